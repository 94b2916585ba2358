//! # Predicted Position
//!
//! Extrapolates a rider's current position from the last analyzed state
//! (§4.8), for "where is the rider right now" queries between points — the
//! source tracker may only deliver a position every 30-60 seconds, but a
//! viewer wants to see smooth forward motion in between.

use crate::geo::{self, Point};
use crate::pipeline::PipelineState;
use crate::route_set::RouteSet;

/// A predicted position, with along-route bookkeeping when the prediction
/// walked forward along the route rather than dead-reckoning in a straight
/// line.
#[derive(Debug, Clone)]
pub struct PredictedPosition {
    pub position: Point,
    pub along_route_distance: Option<f64>,
    pub route_elevation: Option<f64>,
}

const MIN_SPEED_KMH: f64 = 3.0;
const ON_ROUTE_DISTANCE: f64 = 500.0;

/// Predicts where the rider is at `time` (a Unix timestamp, typically "now")
/// given the pipeline's last known state. `None` when extrapolation would be
/// unfounded: no previous point, the rider already finished, the gap since
/// the last point is at least a track break, or they were effectively
/// stopped.
pub fn predict(state: &PipelineState, routes: &RouteSet, config: &crate::config::PipelineConfig, time: i64) -> Option<PredictedPosition> {
    if state.finished {
        return None;
    }
    let prev_point = state.prev_point.as_ref()?;
    let prev_geo = state.prev_point_geo.as_ref()?;
    let prev_speed_kmh = state.prev_analyzed.as_ref().and_then(|p| p.speed_kmh)?;

    let elapsed = (time - prev_point.time) as f64;
    if elapsed >= config.track_break_time.as_secs_f64() {
        return None;
    }
    if prev_speed_kmh <= MIN_SPEED_KMH {
        return None;
    }

    let dist_moved = prev_speed_kmh / 3.6 * elapsed;

    let on_route = state
        .prev_match
        .as_ref()
        .filter(|m| m.distance_to_route < ON_ROUTE_DISTANCE && state.going_forward == Some(true));

    if let Some(m) = on_route {
        if let Some(route) = routes.routes.get(m.route_index) {
            if let Some(walked) = walk_forward(route, m.segment.end_index, &m.projection, dist_moved) {
                let along_route_distance = state.prev_route_dist.map(|d| d + dist_moved);
                let route_elevation = along_route_distance.and_then(|d| route.elevation_at(d));
                return Some(PredictedPosition {
                    position: walked,
                    along_route_distance,
                    route_elevation,
                });
            }
        }
    }

    if let Some(dir) = state.prev_unit_vector {
        let new_pv = geo::pv_add_scaled(prev_geo.pv(), dir, dist_moved);
        return Some(PredictedPosition {
            position: geo::point_from_pv(new_pv),
            along_route_distance: None,
            route_elevation: None,
        });
    }

    None
}

/// Walks forward along `route`'s full points starting at `start_index`
/// (the matched segment's far endpoint), consuming `dist_moved`, and
/// interpolating on the segment where it runs out.
fn walk_forward(route: &crate::route::Route, start_index: usize, from: &Point, dist_moved: f64) -> Option<Point> {
    if route.points.is_empty() {
        return None;
    }
    let last_index = route.points.len() - 1;
    if start_index > last_index {
        return Some(route.points[last_index].point.clone());
    }

    let mut remaining = dist_moved;
    let mut current = from.clone();
    let mut index = start_index;

    while index <= last_index {
        let next = &route.points[index].point;
        let leg = geo::distance(&current, next);
        if leg >= remaining {
            if leg < 1e-6 {
                return Some(next.clone());
            }
            let t = remaining / leg;
            return geo::interpolate(current.nv(), next.nv(), t).ok().map(Point::from_nv);
        }
        remaining -= leg;
        current = next.clone();
        index += 1;
    }

    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::{AnalyzedPoint, RawPoint, RawPosition};
    use crate::route::{RawRoute, RawRoutePoint};
    use crate::search::{ClosestMatch, SegmentRef};

    fn straight_route_set() -> RouteSet {
        let route = RawRoute {
            points: vec![
                RawRoutePoint::new(0.0, 0.0),
                RawRoutePoint::new(0.0, 0.01),
                RawRoutePoint::new(0.0, 0.02),
            ],
            main: true,
            ..Default::default()
        };
        RouteSet::new(vec![route]).unwrap()
    }

    #[test]
    fn none_when_no_previous_point() {
        let state = PipelineState::default();
        let routes = straight_route_set();
        let config = PipelineConfig::default();
        assert!(predict(&state, &routes, &config, 1000).is_none());
    }

    #[test]
    fn none_when_finished() {
        let mut state = PipelineState::default();
        state.finished = true;
        state.prev_point = Some(RawPoint::new(1000, RawPosition { lat: 0.0, lon: 0.0, elevation: None }));
        let routes = straight_route_set();
        let config = PipelineConfig::default();
        assert!(predict(&state, &routes, &config, 1010).is_none());
    }

    #[test]
    fn on_route_forward_walk_advances_along_route_distance() {
        let routes = straight_route_set();
        let config = PipelineConfig::default();

        let mut state = PipelineState::default();
        state.prev_point = Some(RawPoint::new(1000, RawPosition { lat: 0.0, lon: 0.0, elevation: None }));
        state.prev_point_geo = Some(Point::new(0.0, 0.0));
        state.going_forward = Some(true);
        state.prev_route_dist = Some(0.0);
        let mut analyzed = AnalyzedPoint::from_raw(state.prev_point.as_ref().unwrap());
        analyzed.speed_kmh = Some(36.0); // 10 m/s
        state.prev_analyzed = Some(analyzed);
        state.prev_match = Some(ClosestMatch {
            route_index: 0,
            segment: SegmentRef { start_index: 0, end_index: 1 },
            projection: Point::new(0.0, 0.0),
            distance_to_route: 0.0,
            along_route_distance: 0.0,
            local_distance: 0.0,
        });

        let predicted = predict(&state, &routes, &config, 1010).unwrap();
        assert!((predicted.along_route_distance.unwrap() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn dead_reckons_when_off_route_with_known_heading() {
        let routes = straight_route_set();
        let config = PipelineConfig::default();

        let mut state = PipelineState::default();
        let prev_geo = Point::new(10.0, 10.0);
        state.prev_point = Some(RawPoint::new(1000, RawPosition { lat: 10.0, lon: 10.0, elevation: None }));
        state.prev_point_geo = Some(prev_geo.clone());
        state.prev_unit_vector = geo::pv_unit(geo::pv_sub(Point::new(10.01, 10.0).pv(), prev_geo.pv()));
        let mut analyzed = AnalyzedPoint::from_raw(state.prev_point.as_ref().unwrap());
        analyzed.speed_kmh = Some(36.0);
        state.prev_analyzed = Some(analyzed);

        let predicted = predict(&state, &routes, &config, 1010).unwrap();
        assert!(predicted.along_route_distance.is_none());
        assert!(geo::distance(&predicted.position, &prev_geo) > 50.0);
    }

    #[test]
    fn none_when_stopped() {
        let routes = straight_route_set();
        let config = PipelineConfig::default();
        let mut state = PipelineState::default();
        state.prev_point = Some(RawPoint::new(1000, RawPosition { lat: 0.0, lon: 0.0, elevation: None }));
        state.prev_point_geo = Some(Point::new(0.0, 0.0));
        let mut analyzed = AnalyzedPoint::from_raw(state.prev_point.as_ref().unwrap());
        analyzed.speed_kmh = Some(1.0);
        state.prev_analyzed = Some(analyzed);

        assert!(predict(&state, &routes, &config, 1010).is_none());
    }
}
