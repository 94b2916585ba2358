//! Unified error handling for the analysis pipeline.
//!
//! Mirrors the kinds laid out in the error-handling design: most of them are
//! advisory (logged, never fatal) because a single bad point or a cache miss
//! must not take down a rider's whole pipeline. `MalformedRoute` is the
//! exception — it is fatal at route/event setup time, before any pipeline
//! has started.

use std::fmt;

/// Unified error type for analysis-pipeline operations.
#[derive(Debug, Clone)]
pub enum AnalysisError {
    /// A route has zero points, or a non-finite coordinate — fatal at
    /// `RouteSet`/`Route` construction.
    MalformedRoute { message: String },
    /// Cross-track projection could not disambiguate the two candidate
    /// points (both failed the endpoint-sum check). Never fatal: the caller
    /// falls back to the nearer segment endpoint.
    NumericDegeneracy { context: String },
    /// The closest-point cache could not be read or written. Never fatal:
    /// on load this means starting from an empty cache; on write this means
    /// the result simply isn't memoized this time.
    CacheIOError { message: String },
    /// An error surfaced from the upstream point source (out of scope here,
    /// but the pipeline must propagate it without corrupting state).
    UpstreamError { message: String },
    /// Invalid pipeline/route configuration.
    ConfigError { message: String },
    /// Generic internal error for conditions that should be unreachable.
    Internal { message: String },
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::MalformedRoute { message } => {
                write!(f, "malformed route: {}", message)
            }
            AnalysisError::NumericDegeneracy { context } => {
                write!(f, "numeric degeneracy: {}", context)
            }
            AnalysisError::CacheIOError { message } => {
                write!(f, "closest-point cache I/O error: {}", message)
            }
            AnalysisError::UpstreamError { message } => {
                write!(f, "upstream source error: {}", message)
            }
            AnalysisError::ConfigError { message } => {
                write!(f, "configuration error: {}", message)
            }
            AnalysisError::Internal { message } => {
                write!(f, "internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Result type alias for analysis-pipeline operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Extension trait for converting `Option` absence into a typed error at the
/// few real fallible boundaries (route construction, cache I/O).
pub trait OptionExt<T> {
    fn ok_or_malformed_route(self, message: &str) -> Result<T>;
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_malformed_route(self, message: &str) -> Result<T> {
        self.ok_or_else(|| AnalysisError::MalformedRoute {
            message: message.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| AnalysisError::Internal {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = AnalysisError::MalformedRoute {
            message: "zero points".to_string(),
        };
        assert!(err.to_string().contains("zero points"));
    }

    #[test]
    fn option_ext_converts_none() {
        let none: Option<i32> = None;
        let result = none.ok_or_malformed_route("empty");
        assert!(matches!(result, Err(AnalysisError::MalformedRoute { .. })));
    }
}
