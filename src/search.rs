//! # Closest-Point Search
//!
//! The hierarchical, cross-route search described in §4.4: a fast pass over
//! each route's simplified segments, refined against the full polyline only
//! for the winning simplified segment, with a "preferred route" short-circuit
//! so that common-case per-point searches stay cheap (most points keep
//! matching the same route they matched last time).

use crate::config::PipelineConfig;
use crate::geo::{cross_track, distance, Point};
use crate::route::{Route, Segment};
use crate::route_set::RouteSet;

/// A segment identified by the full-point index range it spans. For a full
/// segment this range always has length 1; for a simplified segment it may
/// span many full points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRef {
    pub start_index: usize,
    pub end_index: usize,
}

/// Result of searching a single route.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub segment: SegmentRef,
    pub projection: Point,
    pub distance_to_route: f64,
}

/// Result of the full cross-route search (§4.4), the pipeline's `ClosestMatch`.
#[derive(Debug, Clone)]
pub struct ClosestMatch {
    pub route_index: usize,
    pub segment: SegmentRef,
    pub projection: Point,
    pub distance_to_route: f64,
    /// Along-route distance in the main route's distance frame (mapped
    /// through `dist_factor`/`start_distance` for alternates).
    pub along_route_distance: f64,
    /// Along-route distance in the matched route's own local frame, with no
    /// alt-route mapping applied — used for `dist_from_prev` when both the
    /// current and previous match are on the same route (§4.6).
    pub local_distance: f64,
}

fn rank_key(distance_to_segment: f64, local_distance: f64, prev_dist: Option<f64>, circular_range: Option<f64>) -> f64 {
    match (circular_range, prev_dist) {
        (Some(range), Some(prev)) => {
            let move_distance = (local_distance - prev).abs();
            distance_to_segment + 2f64.powf((move_distance - range) / 1000.0)
        }
        _ => distance_to_segment,
    }
}

fn closest_among_segments(
    route: &Route,
    segments: &[Segment],
    to: &Point,
    prev_dist: Option<f64>,
) -> RouteMatch {
    segments
        .iter()
        .map(|segment| {
            let a = &route.points[segment.start_index].point;
            let b = &route.points[segment.end_index].point;
            let result = cross_track(to, a, b, &segment.precalc);
            let local_distance = route.points[segment.start_index].distance + distance(a, &result.projection);
            let mapped_distance = match &route.alt_mapping {
                Some(mapping) => local_distance * mapping.dist_factor + mapping.start_distance,
                None => local_distance,
            };
            let rank = rank_key(result.distance_to_segment, mapped_distance, prev_dist, route.circular_range);
            (
                RouteMatch {
                    segment: SegmentRef {
                        start_index: segment.start_index,
                        end_index: segment.end_index,
                    },
                    projection: result.projection,
                    distance_to_route: result.distance_to_segment,
                },
                rank,
            )
        })
        .min_by(|(_, rank_a), (_, rank_b)| rank_a.partial_cmp(rank_b).unwrap())
        .map(|(m, _)| m)
        .expect("route has at least one segment")
}

/// Two-level search against a single route: simplified segments first, then
/// (when the winner isn't already a single full segment, and is close
/// enough to be worth refining) the full segments it spans.
pub fn find_closest_point_pair_route(
    route: &Route,
    to: &Point,
    min_search_complex_dist: f64,
    prev_dist: Option<f64>,
) -> Option<RouteMatch> {
    if route.simplified_segments.is_empty() {
        return None;
    }
    let simplified = closest_among_segments(route, &route.simplified_segments, to, prev_dist);

    let span = simplified.segment.end_index - simplified.segment.start_index;
    if simplified.distance_to_route > min_search_complex_dist || span <= 1 {
        return Some(simplified);
    }

    let full_slice = &route.full_segments[simplified.segment.start_index..simplified.segment.end_index];
    Some(closest_among_segments(route, full_slice, to, prev_dist))
}

fn local_distance_of(route: &Route, route_match: &RouteMatch) -> f64 {
    route.points[route_match.segment.start_index].distance + distance(&route.points[route_match.segment.start_index].point, &route_match.projection)
}

fn to_closest_match(route_index: usize, route: &Route, route_match: RouteMatch) -> ClosestMatch {
    let local_distance = local_distance_of(route, &route_match);
    let along_route_distance = match &route.alt_mapping {
        Some(mapping) => local_distance * mapping.dist_factor + mapping.start_distance,
        None => local_distance,
    };
    ClosestMatch {
        route_index,
        segment: route_match.segment,
        projection: route_match.projection,
        distance_to_route: route_match.distance_to_route,
        along_route_distance,
        local_distance,
    }
}

/// Full cross-route search (§4.4): tries the previous match's route and the
/// main route first (in that order preference-wise, main checked last so it
/// wins ties), breaking out early on a close-enough match; otherwise
/// searches every remaining route and returns the global minimum.
pub fn find(
    routes: &RouteSet,
    to: &Point,
    config: &PipelineConfig,
    prev_closest_route_index: Option<usize>,
    prev_dist: Option<f64>,
) -> Option<ClosestMatch> {
    if routes.routes.is_empty() {
        return None;
    }

    let mut preferred = vec![0usize];
    if let Some(prev_index) = prev_closest_route_index {
        if prev_index != 0 && prev_index < routes.routes.len() {
            preferred.push(prev_index);
        }
    }

    let mut candidates: Vec<ClosestMatch> = Vec::new();
    // Iterate in reverse so prev_closest_route_index is tried before route 0.
    for &route_index in preferred.iter().rev() {
        let route = &routes.routes[route_index];
        if let Some(route_match) =
            find_closest_point_pair_route(route, to, config.min_search_complex_dist, prev_dist)
        {
            let closest = to_closest_match(route_index, route, route_match);
            if closest.distance_to_route < config.break_out_dist {
                return Some(closest);
            }
            candidates.push(closest);
        }
    }

    for (route_index, route) in routes.routes.iter().enumerate() {
        if preferred.contains(&route_index) {
            continue;
        }
        if let Some(route_match) =
            find_closest_point_pair_route(route, to, config.min_search_complex_dist, prev_dist)
        {
            candidates.push(to_closest_match(route_index, route, route_match));
        }
    }

    candidates
        .into_iter()
        .min_by(|a, b| a.distance_to_route.partial_cmp(&b.distance_to_route).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{preprocess, RawRoute, RawRoutePoint};
    use crate::route_set::RouteSet;

    fn straight_route() -> RawRoute {
        RawRoute {
            points: vec![
                RawRoutePoint::new(0.0, 0.0),
                RawRoutePoint::new(0.0, 0.01),
                RawRoutePoint::new(0.0, 0.02),
            ],
            main: true,
            ..Default::default()
        }
    }

    #[test]
    fn finds_midpoint_match_on_straight_route() {
        let route = preprocess(&straight_route(), 500.0, None).unwrap();
        let to = Point::new(0.0, 0.005);
        let result = find_closest_point_pair_route(&route, &to, 5_000.0, None).unwrap();
        assert!(result.distance_to_route < 1.0);
        let along = local_distance_of(&route, &result);
        assert!((along - 556.0).abs() < 5.0, "got {along}");
    }

    #[test]
    fn full_search_prefers_main_route_on_tie() {
        let routes = RouteSet::new(vec![straight_route()]).unwrap();
        let config = PipelineConfig::default();
        let to = Point::new(0.0, 0.005);
        let result = find(&routes, &to, &config, None, None).unwrap();
        assert_eq!(result.route_index, 0);
    }

    #[test]
    fn empty_route_set_returns_none() {
        let routes = RouteSet::empty();
        let config = PipelineConfig::default();
        let to = Point::new(0.0, 0.0);
        assert!(find(&routes, &to, &config, None, None).is_none());
    }
}
