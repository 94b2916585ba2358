//! Tunable parameters for route preprocessing, closest-point search, and the
//! analysis pipeline.
//!
//! Grouped into one struct (mirroring the teacher's `MatchConfig`/
//! `SectionConfig` convention) so a caller can override a handful of values
//! without having to thread individual parameters through every function.

use std::time::Duration;

/// Configuration for the analysis pipeline and the search it drives.
///
/// All defaults are the tunables from the external-interfaces section of the
/// specification this crate implements.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Gap since the last point-with-position, and distance moved across
    /// that gap, both of which must be exceeded before a track break is
    /// declared (a new `track_id`/`off_route_track_id`, plus a synthetic
    /// "Inactive" point). Default: 15 minutes.
    ///
    /// Two historical variants of this system disagreed on this default (15
    /// vs 20 minutes); 15 minutes is the newer, and the one this crate uses.
    pub track_break_time: Duration,

    /// Default: 10,000 meters. See [`Self::track_break_time`].
    pub track_break_dist: f64,

    /// Cross-track distance above which the simplified-segment search result
    /// is accepted without refining against the full polyline. Default:
    /// 5,000 meters.
    pub min_search_complex_dist: f64,

    /// Cross-track distance under which a preferred route (the previous
    /// match's route, or the main route) is accepted without searching every
    /// other route. Default: 250 meters.
    pub break_out_dist: f64,

    /// Ramer-Douglas-Peucker simplification tolerance, in meters. Default:
    /// 500 meters.
    pub rdp_epsilon: f64,

    /// Cross-track distance beyond which a rider is considered off-route
    /// (together with the "moved backwards more than this" rule). Default:
    /// 200 meters.
    pub off_route_distance: f64,

    /// Along-route distance from the main route's total length within which
    /// a rider is considered finished. Default: 100 meters.
    pub finish_tolerance: f64,

    /// Cross-track distance above which a closest-point-search result is
    /// discarded as "no match" rather than used. Default: 100,000 meters.
    pub out_of_range_distance: f64,

    /// Cross-track distance above which `route_elevation` is interpolated
    /// from the route's elevation table (below it, the point is considered
    /// snapped enough that the route's own sampled elevation isn't a useful
    /// correction). Default: 250 meters.
    pub elevation_lookup_distance: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            track_break_time: Duration::from_secs(15 * 60),
            track_break_dist: 10_000.0,
            min_search_complex_dist: 5_000.0,
            break_out_dist: 250.0,
            rdp_epsilon: 500.0,
            off_route_distance: 200.0,
            finish_tolerance: 100.0,
            out_of_range_distance: 100_000.0,
            elevation_lookup_distance: 250.0,
        }
    }
}
