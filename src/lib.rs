//! # Ride Tracker Analysis
//!
//! Geospatial analysis pipeline for live endurance-event GPS tracking.
//!
//! This library provides:
//! - n-vector based route matching (closest-point-on-polyline on the sphere)
//! - A per-rider analysis pipeline deriving distance ridden, speed, track
//!   segmentation, off-route excursions, and finish detection from a raw
//!   GPS stream
//! - Predicted-position extrapolation between received points
//!
//! ## Features
//!
//! - **`parallel`** — parallel per-rider/per-route preprocessing with rayon
//! - **`persistence`** — SQLite-backed persistence for the closest-point cache
//! - **`ffi`** — FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** — enable all of the above
//!
//! ## Quick Start
//!
//! ```rust
//! use ride_tracker_analysis::{RawRoute, RawRoutePoint, RouteSet};
//!
//! let route = RawRoute {
//!     points: vec![
//!         RawRoutePoint::new(51.5074, -0.1278),
//!         RawRoutePoint::new(51.51, -0.12),
//!     ],
//!     main: true,
//!     ..Default::default()
//! };
//!
//! let routes = RouteSet::new(vec![route]).unwrap();
//! assert!(routes.main().is_some());
//! ```

// Unified error handling
pub mod error;
pub use error::{AnalysisError, OptionExt, Result};

// Geographic primitives: n-vector/p-vector math, cross-track projection
pub mod geo;
pub use geo::{distance, interpolate, nv, pv, Point};

// Tunable pipeline/search parameters
pub mod config;
pub use config::PipelineConfig;

// Route preprocessing (indexing, RDP simplification, alt-route mapping)
pub mod route;
pub use route::{AltRouteMapping, ElevationSample, RawRoute, RawRoutePoint, Route};

// Main route plus alternates, preprocessed once per event
pub mod route_set;
pub use route_set::RouteSet;

// Hierarchical, cross-route closest-point search
pub mod search;
pub use search::{ClosestMatch, SegmentRef};

// Persisted closest-point cache
pub mod cache;
pub use cache::{CacheEntry, CacheKey, ClosestPointCache};

// Source tracker seam (external interface, §5a)
pub mod source;
pub use source::{Observer, RawPointSource, SourceReset};

// Per-rider analysis state machine
pub mod pipeline;
pub use pipeline::{AnalyzedPoint, Pipeline, PipelineState, RawPoint, RawPosition, Status};

// Predicted-position extrapolation
pub mod predicted;
pub use predicted::PredictedPosition;

#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI builds).
#[cfg(all(feature = "ffi", target_os = "android"))]
fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RideTrackerAnalysis"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
fn init_logging() {
    // No-op on non-Android platforms; the host application owns its own
    // logger initialization there.
}
