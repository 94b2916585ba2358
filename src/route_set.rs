//! # Route Set
//!
//! A main route plus zero or more alternates, preprocessed once per event
//! and shared read-only across every rider's pipeline (§4.3, §5).

use crate::error::{AnalysisError, Result};
use crate::route::{preprocess, RawRoute, Route};

/// An ordered collection of preprocessed routes. Index 0 is always the main
/// route; RouteSet construction guarantees that the main route (if any) is
/// preprocessed before the alternates, so their `dist_factor`/`start_distance`
/// mapping can be computed against it.
pub struct RouteSet {
    pub routes: Vec<Route>,
}

impl RouteSet {
    /// Preprocesses a set of raw routes. The first route supplied becomes
    /// the main route regardless of its `main` flag (matching the original
    /// system's convention that route order, not a flag, determines this —
    /// the flag is retained on `Route` for callers that want to check it).
    pub fn new(raw_routes: Vec<RawRoute>) -> Result<RouteSet> {
        if raw_routes.is_empty() {
            return Ok(RouteSet { routes: Vec::new() });
        }

        validate_main_flags(&raw_routes)?;

        let main = preprocess(&raw_routes[0], default_epsilon(&raw_routes[0]), None)?;

        // Alternates only depend on the main route, never on each other, so
        // preprocessing them is an independent per-route batch (§2a).
        #[cfg(feature = "parallel")]
        let alternates: Vec<Route> = {
            use rayon::prelude::*;
            raw_routes[1..]
                .par_iter()
                .map(|raw| preprocess(raw, default_epsilon(raw), Some(&main)))
                .collect::<Result<Vec<Route>>>()?
        };

        #[cfg(not(feature = "parallel"))]
        let alternates: Vec<Route> = raw_routes[1..]
            .iter()
            .map(|raw| preprocess(raw, default_epsilon(raw), Some(&main)))
            .collect::<Result<Vec<Route>>>()?;

        let mut routes = Vec::with_capacity(raw_routes.len());
        routes.push(main);
        routes.extend(alternates);

        Ok(RouteSet { routes })
    }

    /// An empty route set: every point is "no match", every point is
    /// off-route (§8 scenario 1).
    pub fn empty() -> RouteSet {
        RouteSet { routes: Vec::new() }
    }

    pub fn main(&self) -> Option<&Route> {
        self.routes.first()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn default_epsilon(_raw: &RawRoute) -> f64 {
    crate::config::PipelineConfig::default().rdp_epsilon
}

/// Rejects a set with more than one route flagged `main` in input metadata.
/// Called from [`RouteSet::new`] before route 0 is committed to as the main
/// route, since that flag is otherwise only informational (route order, not
/// the flag, decides which route is main) and a caller that set it on two
/// routes almost certainly made a mistake worth surfacing early.
pub fn validate_main_flags(raw_routes: &[RawRoute]) -> Result<()> {
    let main_count = raw_routes.iter().filter(|r| r.main).count();
    if main_count > 1 {
        return Err(AnalysisError::ConfigError {
            message: format!("expected at most one main route, found {main_count}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RawRoutePoint;

    fn simple(points: Vec<(f64, f64)>, main: bool) -> RawRoute {
        RawRoute {
            points: points.into_iter().map(|(lat, lon)| RawRoutePoint::new(lat, lon)).collect(),
            main,
            ..Default::default()
        }
    }

    #[test]
    fn empty_input_gives_empty_set() {
        let set = RouteSet::new(vec![]).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn first_route_becomes_main() {
        let set = RouteSet::new(vec![simple(vec![(0.0, 0.0), (0.0, 0.01), (0.0, 0.02)], true)]).unwrap();
        assert_eq!(set.routes.len(), 1);
        assert!(set.main().is_some());
    }

    #[test]
    fn alternate_gets_mapping_back_to_main() {
        let main = simple((0..=50).map(|i| (0.0, i as f64 * 0.002)).collect(), true);
        let alt = simple(vec![(0.0005, 0.02), (0.0005, 0.03), (0.0005, 0.04)], false);
        let set = RouteSet::new(vec![main, alt]).unwrap();
        assert_eq!(set.routes.len(), 2);
        assert!(set.routes[1].alt_mapping.is_some());
    }

    #[test]
    fn validate_main_flags_rejects_multiple_main() {
        let routes = vec![
            simple(vec![(0.0, 0.0), (0.0, 0.01)], true),
            simple(vec![(0.0, 0.0), (0.0, 0.01)], true),
        ];
        assert!(validate_main_flags(&routes).is_err());
    }

    #[test]
    fn route_set_new_rejects_multiple_main_flags() {
        let routes = vec![
            simple(vec![(0.0, 0.0), (0.0, 0.01)], true),
            simple(vec![(0.0, 0.0), (0.0, 0.01)], true),
        ];
        assert!(RouteSet::new(routes).is_err());
    }
}
