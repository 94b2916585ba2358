//! # Geographic Primitives
//!
//! n-vector based geometry for the analysis pipeline: unit vectors from the
//! Earth's center avoid the polar singularities that plain lat/lon trig runs
//! into, and make cross-track projection onto a great-circle segment a small
//! amount of 3D linear algebra instead of a spherical-trig special case.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`nv`] | Unit 3-vector from WGS-84 lat/lon |
//! | [`pv`] | Earth-centered Cartesian position from an n-vector |
//! | [`distance`] | Euclidean chord distance between two points, in meters |
//! | [`interpolate`] | Point along a great-circle segment at parameter `t` |
//! | [`cross_track`] | Closest point on a segment to a query point |
//!
//! Distances are chord distances (`‖A.pv − B.pv‖`), not great-circle arc
//! lengths. For the segment lengths this system deals with (well under 50km
//! between consecutive route points) the two agree to within 0.5%, which is
//! the precision budget this module is built to.

use once_cell::sync::OnceCell;
use std::fmt;

/// Mean Earth radius used for the p-vector sphere, in meters.
///
/// The system only ever differences p-vectors over short spans, so the
/// choice of sphere (vs. WGS-84 ellipsoid) does not materially affect
/// reported distances.
pub const EARTH_RADIUS_M: f64 = 6_371_009.0;

/// A unit vector from the Earth's center to a surface point.
pub type NVector = [f64; 3];

/// An Earth-centered Cartesian position vector, in meters.
pub type PVector = [f64; 3];

fn clamp_unit(x: f64) -> f64 {
    x.clamp(-1.0, 1.0)
}

/// Unit 3-vector from WGS-84 latitude/longitude, in degrees.
///
/// Axis convention: `[sin(lat), -sin(lon)*cos(lat), cos(lon)*cos(lat)]`.
pub fn nv(lat_deg: f64, lon_deg: f64) -> NVector {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    [lat.sin(), -lon.sin() * lat.cos(), lon.cos() * lat.cos()]
}

/// Inverse of [`nv`]: latitude/longitude in degrees from a unit n-vector.
pub fn nv_to_lat_lon(v: NVector) -> (f64, f64) {
    let lat = v[0].clamp(-1.0, 1.0).asin();
    let lon = (-v[1]).atan2(v[2]);
    (lat.to_degrees(), lon.to_degrees())
}

/// Earth-centered Cartesian position from an n-vector, on the sphere of
/// radius [`EARTH_RADIUS_M`].
pub fn pv(n: NVector) -> PVector {
    [n[0] * EARTH_RADIUS_M, n[1] * EARTH_RADIUS_M, n[2] * EARTH_RADIUS_M]
}

fn sub(a: PVector, b: PVector) -> PVector {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn norm(v: PVector) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// `a - b`, exposed for callers (the pipeline's `prev_unit_vector`, predicted
/// position dead-reckoning) that need to work with p-vectors directly rather
/// than through a pair of [`Point`]s.
pub fn pv_sub(a: PVector, b: PVector) -> PVector {
    sub(a, b)
}

pub fn pv_add_scaled(base: PVector, direction: PVector, scale: f64) -> PVector {
    [
        base[0] + direction[0] * scale,
        base[1] + direction[1] * scale,
        base[2] + direction[2] * scale,
    ]
}

/// Normalizes a p-vector direction. `None` for a (near-)zero vector — two
/// coincident points have no defined heading.
pub fn pv_unit(v: PVector) -> Option<PVector> {
    let n = norm(v);
    if n < 1e-9 {
        None
    } else {
        Some([v[0] / n, v[1] / n, v[2] / n])
    }
}

/// Recovers a [`Point`] from a p-vector, projecting it back onto the sphere
/// of radius [`EARTH_RADIUS_M`] first (dead-reckoned positions drift off the
/// sphere by a negligible amount over the distances this system covers).
pub fn point_from_pv(p: PVector) -> Point {
    let r = norm(p);
    let n = if r < 1e-9 {
        [0.0, 0.0, 1.0]
    } else {
        [p[0] / r, p[1] / r, p[2] / r]
    };
    Point::from_nv(n)
}

pub(crate) fn cross(a: NVector, b: NVector) -> NVector {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn dot(a: NVector, b: NVector) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn vnorm(v: NVector) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Normalizes a vector to unit length. Returns `None` for a (near-)zero
/// vector, which can only arise from antipodal or coincident inputs.
fn unit(v: NVector) -> Option<NVector> {
    let n = vnorm(v);
    if n < 1e-12 {
        None
    } else {
        Some([v[0] / n, v[1] / n, v[2] / n])
    }
}

/// Euclidean chord distance between two points' p-vectors, in meters.
///
/// Symmetric, zero iff `a == b` in position, within 0.5% of the great-circle
/// distance for segments shorter than 50km.
pub fn distance(a: &Point, b: &Point) -> f64 {
    norm(sub(a.pv(), b.pv()))
}

/// Error returned when a great-circle computation degenerates (e.g.
/// antipodal or coincident inputs). Non-fatal everywhere it is produced —
/// callers fall back to a nearby well-defined answer.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericDegeneracy;

impl fmt::Display for NumericDegeneracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "numeric degeneracy in great-circle computation")
    }
}

impl std::error::Error for NumericDegeneracy {}

/// Interpolates between two n-vectors at parameter `t` (0 at `a`, 1 at `b`).
///
/// `t` is not clamped to `[0, 1]` — callers walking past a segment's end use
/// `t > 1` deliberately (see [`crate::predicted`]).
pub fn interpolate(a: NVector, b: NVector, t: f64) -> Result<NVector, NumericDegeneracy> {
    let sum = [
        a[0] + t * (b[0] - a[0]),
        a[1] + t * (b[1] - a[1]),
        a[2] + t * (b[2] - a[2]),
    ];
    unit(sum).ok_or(NumericDegeneracy)
}

/// A lat/lon position, with its n-vector and p-vector computed at most once.
///
/// Cheap to clone (the lazy cells start empty again on clone, matching the
/// "immutable once constructed" contract rather than sharing cached state
/// across logically distinct points).
#[derive(Clone)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
    nv: OnceCell<NVector>,
    pv: OnceCell<PVector>,
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("lat", &self.lat)
            .field("lon", &self.lon)
            .finish()
    }
}

impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        self.lat == other.lat && self.lon == other.lon
    }
}

impl Point {
    /// Creates a point. n-vector/p-vector are computed lazily on first use.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            nv: OnceCell::new(),
            pv: OnceCell::new(),
        }
    }

    /// Builds a point directly from a precomputed n-vector (used when a
    /// point is derived from a match result, where the n-vector is already
    /// on hand and recomputing it from lat/lon would be wasted work).
    pub fn from_nv(n: NVector) -> Self {
        let (lat, lon) = nv_to_lat_lon(n);
        let point = Self::new(lat, lon);
        let _ = point.nv.set(n);
        point
    }

    pub fn nv(&self) -> NVector {
        *self.nv.get_or_init(|| nv(self.lat, self.lon))
    }

    pub fn pv(&self) -> PVector {
        *self.pv.get_or_init(|| pv(self.nv()))
    }
}

/// Precalculated quantities for a consecutive pair of route points, shared
/// by every query that projects onto this segment.
#[derive(Debug, Clone)]
pub struct SegmentPrecalc {
    /// `A.nv x B.nv` — normal of the great circle through A and B.
    pub c12: NVector,
    pub a_nv: NVector,
    pub b_nv: NVector,
    /// `arccos(A.nv . B.nv)` — the great-circle angular length of the segment.
    pub dp1p2: f64,
}

impl SegmentPrecalc {
    pub fn new(a: &Point, b: &Point) -> Self {
        let a_nv = a.nv();
        let b_nv = b.nv();
        Self {
            c12: cross(a_nv, b_nv),
            a_nv,
            b_nv,
            dp1p2: clamp_unit(dot(a_nv, b_nv)).acos(),
        }
    }
}

/// Result of projecting a point onto a great-circle segment.
#[derive(Debug, Clone)]
pub struct CrossTrack {
    pub distance_to_segment: f64,
    pub projection: Point,
}

/// Projects `to` onto the great-circle segment described by `precalc`,
/// falling back to whichever endpoint is closer when the projection is
/// numerically degenerate or lands outside the segment (§4.1).
pub fn cross_track(to: &Point, a: &Point, b: &Point, precalc: &SegmentPrecalc) -> CrossTrack {
    let tpn = to.nv();
    let ctp = cross(tpn, precalc.c12);
    let candidate = unit(cross(ctp, precalc.c12));

    if let Some(c) = candidate {
        for candidate_c in [c, [-c[0], -c[1], -c[2]]] {
            let dp1c = clamp_unit(dot(precalc.a_nv, candidate_c)).acos();
            let dp2c = clamp_unit(dot(precalc.b_nv, candidate_c)).acos();
            if (dp1c + dp2c - precalc.dp1p2).abs() < 1e-6 {
                let projection = Point::from_nv(candidate_c);
                let distance_to_segment = distance(to, &projection);
                return CrossTrack {
                    distance_to_segment,
                    projection,
                };
            }
        }
    }

    // Neither candidate disambiguates (projects outside the segment, or the
    // cross products degenerated): fall back to the nearer endpoint.
    log::debug!(
        "cross_track: numeric degeneracy projecting ({:.6},{:.6}) onto segment, falling back to nearest endpoint",
        to.lat, to.lon
    );
    let dist_a = distance(to, a);
    let dist_b = distance(to, b);
    if dist_a <= dist_b {
        CrossTrack {
            distance_to_segment: dist_a,
            projection: a.clone(),
        }
    } else {
        CrossTrack {
            distance_to_segment: dist_b,
            projection: b.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv_round_trip() {
        for (lat, lon) in [(0.0, 0.0), (51.5074, -0.1278), (-33.8, 151.2), (89.9, 179.9)] {
            let v = nv(lat, lon);
            let (lat2, lon2) = nv_to_lat_lon(v);
            assert!((lat - lat2).abs() < 1e-6, "{lat} vs {lat2}");
            assert!((lon - lon2).abs() < 1e-6, "{lon} vs {lon2}");
        }
    }

    #[test]
    fn distance_is_symmetric_and_zero_at_identity() {
        let a = Point::new(51.5074, -0.1278);
        let b = Point::new(51.51, -0.12);
        assert_eq!(distance(&a, &a), 0.0);
        assert!((distance(&a, &b) - distance(&b, &a)).abs() < 1e-9);
    }

    #[test]
    fn distance_matches_known_scale() {
        // One degree of latitude is approximately 111km.
        let a = Point::new(0.0, 0.0);
        let b = Point::new(1.0, 0.0);
        let d = distance(&a, &b);
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn cross_track_endpoint_sum_identity() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(0.0, 0.02);
        let precalc = SegmentPrecalc::new(&a, &b);
        let to = Point::new(0.0005, 0.01);
        let result = cross_track(&to, &a, &b, &precalc);
        let sum = distance(&result.projection, &a) + distance(&result.projection, &b);
        let ab = distance(&a, &b);
        assert!((sum - ab).abs() < 1.0, "sum={sum} ab={ab}");
    }

    #[test]
    fn cross_track_falls_back_outside_segment() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(0.0, 0.01);
        let precalc = SegmentPrecalc::new(&a, &b);
        // well past B, in the same direction
        let to = Point::new(0.0, 0.05);
        let result = cross_track(&to, &a, &b, &precalc);
        assert!(distance(&result.projection, &b) < 1.0);
    }

    #[test]
    fn interpolate_midpoint() {
        let a = nv(0.0, 0.0);
        let b = nv(0.0, 0.02);
        let mid = interpolate(a, b, 0.5).unwrap();
        let (lat, lon) = nv_to_lat_lon(mid);
        assert!(lat.abs() < 1e-6);
        assert!((lon - 0.01).abs() < 1e-6);
    }

    #[test]
    fn point_caches_nv_across_calls() {
        let p = Point::new(12.0, 34.0);
        let v1 = p.nv();
        let v2 = p.nv();
        assert_eq!(v1, v2);
    }
}
