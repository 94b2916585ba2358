//! # Route Preprocessing
//!
//! Turns a raw polyline into an [`Route`]: indexed points with cumulative
//! along-route distance, precalculated cross-track quantities for every
//! segment, a simplified subset of the polyline (for the fast first pass of
//! [`crate::search`]), an optional elevation table, and — for alternate
//! routes — the linear mapping back onto the main route's distance frame.

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, OptionExt, Result};
use crate::geo::{self, distance, Point, SegmentPrecalc};
use crate::search;

/// A raw point as supplied by route input: lat/lon and an optional elevation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawRoutePoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
}

impl RawRoutePoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            elevation: None,
        }
    }

    pub fn with_elevation(lat: f64, lon: f64, elevation: f64) -> Self {
        Self {
            lat,
            lon,
            elevation: Some(elevation),
        }
    }

    fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite() && self.lat >= -90.0 && self.lat <= 90.0
    }
}

/// An elevation sample keyed by along-route distance, as supplied separately
/// from the route's own point sequence (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ElevationSample {
    pub lat: f64,
    pub lon: f64,
    pub elevation: f64,
    pub along_distance: f64,
}

/// Raw input for one route, before preprocessing (§6, "Route input format").
#[derive(Debug, Clone, Default)]
pub struct RawRoute {
    pub points: Vec<RawRoutePoint>,
    pub main: bool,
    pub elevation: Option<Vec<ElevationSample>>,
    pub simplified_points_indexes: Option<Vec<usize>>,
    pub split_at_dist: Option<Vec<f64>>,
    pub split_point_range: f64,
    pub circular_range: Option<f64>,
}

/// A point on a route, carrying its position in the route and its cumulative
/// along-route distance from the route start.
#[derive(Debug, Clone)]
pub struct IndexedRoutePoint {
    pub point: Point,
    pub index: usize,
    pub distance: f64,
}

impl IndexedRoutePoint {
    pub fn lat(&self) -> f64 {
        self.point.lat
    }

    pub fn lon(&self) -> f64 {
        self.point.lon
    }
}

/// A preprocessed segment spanning a contiguous range of full-point indices.
/// For a full segment this range always has length 1 (adjacent points); for
/// a simplified segment it may span many full points.
#[derive(Debug, Clone)]
pub struct Segment {
    pub precalc: SegmentPrecalc,
    /// Index of this segment's start point into `Route::points`.
    pub start_index: usize,
    /// Index of this segment's end point into `Route::points`.
    pub end_index: usize,
}

/// How an alternate route's local along-route distance maps back onto the
/// main route's distance frame (§3 invariant: `d * dist_factor +
/// start_distance`).
#[derive(Debug, Clone, Copy)]
pub struct AltRouteMapping {
    pub start_distance: f64,
    pub end_distance: f64,
    pub dist_factor: f64,
}

/// A fully preprocessed route: indexed points, full and simplified segment
/// precalcs, and (for alternates) the mapping back to the main route.
pub struct Route {
    pub points: Vec<IndexedRoutePoint>,
    pub full_segments: Vec<Segment>,
    pub simplified_segments: Vec<Segment>,
    pub is_main: bool,
    pub alt_mapping: Option<AltRouteMapping>,
    pub elevation: Option<Vec<ElevationSample>>,
    pub circular_range: Option<f64>,
}

impl Route {
    /// Total along-route distance, i.e. the last point's cumulative distance.
    pub fn total_distance(&self) -> f64 {
        self.points.last().map(|p| p.distance).unwrap_or(0.0)
    }

    /// Interpolates route elevation at a given along-route distance, linearly
    /// between the two bracketing samples and clamped at the ends (the
    /// "safer reading" of the elevation interpolation open question).
    pub fn elevation_at(&self, along_distance: f64) -> Option<f64> {
        let table = self.elevation.as_ref()?;
        if table.is_empty() {
            return None;
        }
        if along_distance <= table[0].along_distance {
            return Some(table[0].elevation);
        }
        if along_distance >= table[table.len() - 1].along_distance {
            return Some(table[table.len() - 1].elevation);
        }
        for window in table.windows(2) {
            let (p1, p2) = (window[0], window[1]);
            if along_distance >= p1.along_distance && along_distance <= p2.along_distance {
                let span = p2.along_distance - p1.along_distance;
                if span <= 0.0 {
                    return Some(p1.elevation);
                }
                let t = (along_distance - p1.along_distance) / span;
                return Some(p1.elevation + t * (p2.elevation - p1.elevation));
            }
        }
        None
    }
}

/// Builds the per-point index/cumulative-distance annotation described in
/// §3 (`route_with_distance_and_index` in the original implementation).
fn index_and_distance(raw_points: &[RawRoutePoint]) -> Vec<IndexedRoutePoint> {
    let mut cumulative = 0.0;
    let mut previous: Option<Point> = None;
    raw_points
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let point = Point::new(raw.lat, raw.lon);
            if let Some(prev) = &previous {
                cumulative += distance(prev, &point);
            }
            let indexed = IndexedRoutePoint {
                point: point.clone(),
                index,
                distance: cumulative,
            };
            previous = Some(point);
            indexed
        })
        .collect()
}

fn segments_from_points(points: &[IndexedRoutePoint]) -> Vec<Segment> {
    points
        .windows(2)
        .map(|pair| Segment {
            precalc: SegmentPrecalc::new(&pair[0].point, &pair[1].point),
            start_index: pair[0].index,
            end_index: pair[1].index,
        })
        .collect()
}

/// Cross-track distance from a full-route point to the chord between two
/// endpoints, used by Ramer-Douglas-Peucker to pick the split point.
fn cross_track_to_chord(point: &IndexedRoutePoint, a: &IndexedRoutePoint, b: &IndexedRoutePoint) -> f64 {
    let precalc = SegmentPrecalc::new(&a.point, &b.point);
    geo::cross_track(&point.point, &a.point, &b.point, &precalc).distance_to_segment
}

/// Ramer-Douglas-Peucker simplification, iterative (a stack of `(lo, hi)`
/// ranges rather than recursion, so long routes don't blow the call stack).
/// Returns the indices (into `points`) to keep.
fn ramer_douglas_peucker(points: &[IndexedRoutePoint], epsilon: f64) -> Vec<usize> {
    if points.len() < 2 {
        return (0..points.len()).collect();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    let mut stack = vec![(0usize, points.len() - 1)];
    while let Some((lo, hi)) = stack.pop() {
        if hi <= lo + 1 {
            continue;
        }
        let (mut split, mut dmax) = (lo, 0.0);
        for i in (lo + 1)..hi {
            let d = cross_track_to_chord(&points[i], &points[lo], &points[hi]);
            if d > dmax {
                dmax = d;
                split = i;
            }
        }
        if dmax > epsilon {
            keep[split] = true;
            stack.push((lo, split));
            stack.push((split, hi));
        }
    }

    keep.iter()
        .enumerate()
        .filter_map(|(i, &k)| k.then_some(i))
        .collect()
}

/// Section-wise RDP around known split distances (§4.2): within `dist ±
/// split_point_range` of each split distance, find the RDP-kept point
/// closest to that distance and force it as an anchor, then simplify each
/// section between consecutive anchors independently.
fn ramer_douglas_peucker_sections(
    points: &[IndexedRoutePoint],
    epsilon: f64,
    split_at_dist: &[f64],
    split_point_range: f64,
) -> Vec<usize> {
    let mut sections: Vec<usize> = Vec::new();
    let mut last_index = 0usize;

    for &dist in split_at_dist {
        let min_dist = dist - split_point_range;
        let max_dist = dist - split_point_range + 2.0 * split_point_range;
        let close: Vec<usize> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.distance >= min_dist && p.distance < max_dist)
            .map(|(i, _)| i)
            .collect();
        if close.is_empty() {
            continue;
        }
        let close_points: Vec<IndexedRoutePoint> = close.iter().map(|&i| points[i].clone()).collect();
        let simplified_close = ramer_douglas_peucker(&close_points, epsilon);
        let anchor_local = simplified_close
            .iter()
            .min_by(|&&a, &&b| {
                let da = (dist - close_points[a].distance).abs();
                let db = (dist - close_points[b].distance).abs();
                da.partial_cmp(&db).unwrap()
            })
            .copied()
            .unwrap();
        let anchor_index = close[anchor_local];

        let section_points = &points[last_index..=anchor_index];
        let section_simplified = ramer_douglas_peucker(section_points, epsilon);
        for &i in &section_simplified[..section_simplified.len().saturating_sub(1)] {
            sections.push(last_index + i);
        }
        last_index = anchor_index;
    }

    let tail_points = &points[last_index..];
    let tail_simplified = ramer_douglas_peucker(tail_points, epsilon);
    for &i in &tail_simplified {
        sections.push(last_index + i);
    }

    sections
}

/// Preprocesses a raw polyline into a [`Route`]. `main_route` is `None` when
/// this is the main route itself (or when there is no main route to map
/// onto); `Some` when preprocessing an alternate.
pub fn preprocess(raw: &RawRoute, epsilon: f64, main_route: Option<&Route>) -> Result<Route> {
    if raw.points.is_empty() {
        return None.ok_or_malformed_route("route has zero points");
    }
    if raw.points.iter().any(|p| !p.is_finite()) {
        return Err(AnalysisError::MalformedRoute {
            message: "route contains non-finite coordinates".to_string(),
        });
    }

    let points = index_and_distance(&raw.points);
    let full_segments = segments_from_points(&points);

    let simplified_indexes = if let Some(indexes) = &raw.simplified_points_indexes {
        indexes.clone()
    } else if let Some(split_at_dist) = &raw.split_at_dist {
        ramer_douglas_peucker_sections(&points, epsilon, split_at_dist, raw.split_point_range)
    } else {
        ramer_douglas_peucker(&points, epsilon)
    };
    let simplified_points: Vec<IndexedRoutePoint> = simplified_indexes.iter().map(|&i| points[i].clone()).collect();
    let simplified_segments = segments_from_points(&simplified_points);

    let elevation = raw.elevation.clone().map(|mut table| {
        table.sort_by(|a, b| a.along_distance.partial_cmp(&b.along_distance).unwrap());
        table
    });

    let alt_mapping = match main_route {
        None => None,
        Some(main) => Some(compute_alt_mapping(main, &points)?),
    };

    log::debug!(
        "route preprocessed: {} points, {} simplified, {:.0}m total",
        points.len(),
        simplified_points.len(),
        points.last().map(|p| p.distance).unwrap_or(0.0)
    );

    Ok(Route {
        points,
        full_segments,
        simplified_segments,
        is_main: raw.main,
        alt_mapping,
        elevation,
        circular_range: raw.circular_range,
    })
}

fn compute_alt_mapping(main: &Route, alt_points: &[IndexedRoutePoint]) -> Result<AltRouteMapping> {
    let alt_total = alt_points
        .last()
        .ok_or_malformed_route("alternate route has no points")?
        .distance;

    let start = alt_points.first().ok_or_internal("alternate route has no start point")?;
    let end = alt_points.last().ok_or_internal("alternate route has no end point")?;

    let start_match = search::find_closest_point_pair_route(main, &start.point, 2_000.0, None)
        .ok_or_internal("could not project alternate route start onto main route")?;
    let start_distance = main.points[start_match.segment.start_index].distance
        + distance(&main.points[start_match.segment.start_index].point, &start_match.projection);

    let end_match = search::find_closest_point_pair_route(main, &end.point, 2_000.0, None)
        .ok_or_internal("could not project alternate route end onto main route")?;
    let end_distance = main.points[end_match.segment.end_index].distance
        - distance(&main.points[end_match.segment.end_index].point, &end_match.projection);

    if alt_total < 2.0 * 250.0 {
        log::debug!(
            "alternate route is shorter than twice the default break-out distance ({:.0}m); \
             dist_factor stability is unverified for such short alternates",
            alt_total
        );
    }

    let dist_factor = if alt_total > 0.0 {
        (end_distance - start_distance) / alt_total
    } else {
        1.0
    };

    Ok(AltRouteMapping {
        start_distance,
        end_distance,
        dist_factor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_route(n: usize, step_deg: f64) -> RawRoute {
        RawRoute {
            points: (0..n).map(|i| RawRoutePoint::new(0.0, i as f64 * step_deg)).collect(),
            main: true,
            ..Default::default()
        }
    }

    #[test]
    fn index_and_distance_is_monotonic_from_zero() {
        let raw = straight_route(5, 0.01);
        let points = index_and_distance(&raw.points);
        assert_eq!(points[0].distance, 0.0);
        for w in points.windows(2) {
            assert!(w[1].distance >= w[0].distance);
        }
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.index, i);
        }
    }

    #[test]
    fn preprocess_rejects_empty_route() {
        let raw = RawRoute {
            points: vec![],
            main: true,
            ..Default::default()
        };
        assert!(preprocess(&raw, 500.0, None).is_err());
    }

    #[test]
    fn preprocess_rejects_non_finite_coordinates() {
        let raw = RawRoute {
            points: vec![RawRoutePoint::new(f64::NAN, 0.0), RawRoutePoint::new(0.0, 0.01)],
            main: true,
            ..Default::default()
        };
        assert!(preprocess(&raw, 500.0, None).is_err());
    }

    #[test]
    fn rdp_keeps_points_within_epsilon_of_chord() {
        // A route with a single big kink: RDP must keep the kink point.
        let raw = RawRoute {
            points: vec![
                RawRoutePoint::new(0.0, 0.0),
                RawRoutePoint::new(0.0, 0.1),
                RawRoutePoint::new(0.05, 0.2), // kink, ~5.5km off the chord
                RawRoutePoint::new(0.0, 0.3),
                RawRoutePoint::new(0.0, 0.4),
            ],
            main: true,
            ..Default::default()
        };
        let route = preprocess(&raw, 500.0, None).unwrap();
        assert!(route.simplified_segments.len() >= 2, "kink should not be simplified away");

        // Every full point must be within epsilon of *some* simplified segment.
        for p in &route.points {
            let best = route
                .simplified_segments
                .iter()
                .map(|seg| cross_track_to_chord(p, &route.points[seg.start_index], &route.points[seg.end_index]))
                .fold(f64::INFINITY, f64::min);
            assert!(best <= 500.0 + 1.0, "point {} is {}m from simplification", p.index, best);
        }
    }

    #[test]
    fn preprocess_straight_route_totals_expected_distance() {
        let raw = straight_route(3, 0.01); // ~1.1km per segment at the equator
        let route = preprocess(&raw, 500.0, None).unwrap();
        assert!((route.total_distance() - 2226.0).abs() < 20.0, "got {}", route.total_distance());
    }

    #[test]
    fn elevation_interpolates_linearly_and_clamps() {
        let raw = RawRoute {
            points: straight_route(2, 0.01).points,
            main: true,
            elevation: Some(vec![
                ElevationSample { lat: 0.0, lon: 0.0, elevation: 100.0, along_distance: 0.0 },
                ElevationSample { lat: 0.0, lon: 0.005, elevation: 200.0, along_distance: 500.0 },
            ]),
            ..Default::default()
        };
        let route = preprocess(&raw, 500.0, None).unwrap();
        assert_eq!(route.elevation_at(-10.0), Some(100.0));
        assert_eq!(route.elevation_at(1000.0), Some(200.0));
        assert_eq!(route.elevation_at(250.0), Some(150.0));
    }

    #[test]
    fn alt_route_maps_onto_main_distance_frame() {
        // Main route: 0 -> ~10km along the equator.
        let main_raw = RawRoute {
            points: (0..=100).map(|i| RawRoutePoint::new(0.0, i as f64 * 0.0009)).collect(),
            main: true,
            ..Default::default()
        };
        let main = preprocess(&main_raw, 500.0, None).unwrap();

        // Alt route attaching near main's start and reconnecting a bit later.
        let alt_raw = RawRoute {
            points: vec![
                RawRoutePoint::new(0.001, 0.027),
                RawRoutePoint::new(0.001, 0.04),
                RawRoutePoint::new(0.001, 0.054),
            ],
            main: false,
            ..Default::default()
        };
        let alt = preprocess(&alt_raw, 500.0, Some(&main)).unwrap();
        let mapping = alt.alt_mapping.unwrap();
        assert!(mapping.start_distance < mapping.end_distance);
        assert!(mapping.dist_factor > 0.0);
    }
}
