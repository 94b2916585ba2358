//! FFI bindings for mobile platforms (iOS/Android).
//!
//! This module provides the UniFFI bindings that expose the analysis
//! pipeline to Kotlin and Swift. State that must survive across calls (route
//! sets, running pipelines) lives in global registries keyed by an opaque
//! `u64` handle, the same way the teacher's `ENGINE` singleton lets FFI calls
//! reach shared state without passing it back and forth across the
//! boundary — generalized here to more than one instance, since a mobile
//! client tracks more than one event/rider at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::config::PipelineConfig;
use crate::pipeline::{AnalyzedPoint as CoreAnalyzedPoint, Pipeline, RawPoint as CoreRawPoint, RawPosition, Status as CoreStatus};
use crate::predicted::PredictedPosition as CorePredictedPosition;
use crate::route::{ElevationSample, RawRoute, RawRoutePoint};
use crate::route_set::RouteSet;

// ============================================================================
// Analysis Callback Interface
// ============================================================================

/// Callback interface for receiving analyzed points as a pipeline processes
/// them. Implement this in Kotlin/Swift to receive real-time updates.
#[uniffi::export(callback_interface)]
pub trait AnalysisCallback: Send + Sync {
    /// Called for every analyzed point (§4.7).
    fn on_point(&self, point: FfiAnalyzedPoint);
}

// ============================================================================
// FFI-safe records
// ============================================================================

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRoutePoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiElevationSample {
    pub lat: f64,
    pub lon: f64,
    pub elevation: f64,
    pub along_distance: f64,
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRoute {
    pub points: Vec<FfiRoutePoint>,
    pub main: bool,
    pub elevation: Option<Vec<FfiElevationSample>>,
    pub circular_range: Option<f64>,
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiRawPoint {
    pub time: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub elevation: Option<f64>,
    pub server_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAnalyzedPoint {
    pub time: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub elevation: Option<f64>,
    pub along_route_distance: Option<f64>,
    pub route_elevation: Option<f64>,
    pub dist_from_prev: Option<f64>,
    pub dist: Option<f64>,
    pub time_from_prev: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub track_id: Option<u32>,
    pub off_route_track_id: Option<u32>,
    pub finished_time: Option<i64>,
    pub rider_status: Option<String>,
    pub status: Option<FfiStatus>,
}

impl From<&CoreAnalyzedPoint> for FfiAnalyzedPoint {
    fn from(p: &CoreAnalyzedPoint) -> Self {
        Self {
            time: p.time,
            lat: p.lat,
            lon: p.lon,
            elevation: p.elevation,
            along_route_distance: p.along_route_distance,
            route_elevation: p.route_elevation,
            dist_from_prev: p.dist_from_prev,
            dist: p.dist,
            time_from_prev: p.time_from_prev,
            speed_kmh: p.speed_kmh,
            track_id: p.track_id,
            off_route_track_id: p.off_route_track_id,
            finished_time: p.finished_time,
            rider_status: p.rider_status.clone(),
            status: p.status.map(|s| match s {
                CoreStatus::Active => FfiStatus::Active,
                CoreStatus::Inactive => FfiStatus::Inactive,
            }),
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPredictedPosition {
    pub lat: f64,
    pub lon: f64,
    pub along_route_distance: Option<f64>,
    pub route_elevation: Option<f64>,
}

impl From<CorePredictedPosition> for FfiPredictedPosition {
    fn from(p: CorePredictedPosition) -> Self {
        Self {
            lat: p.position.lat,
            lon: p.position.lon,
            along_route_distance: p.along_route_distance,
            route_elevation: p.route_elevation,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPipelineConfig {
    pub track_break_time_secs: u64,
    pub track_break_dist: f64,
    pub min_search_complex_dist: f64,
    pub break_out_dist: f64,
    pub rdp_epsilon: f64,
    pub off_route_distance: f64,
    pub finish_tolerance: f64,
    pub out_of_range_distance: f64,
    pub elevation_lookup_distance: f64,
}

impl From<FfiPipelineConfig> for PipelineConfig {
    fn from(c: FfiPipelineConfig) -> Self {
        Self {
            track_break_time: std::time::Duration::from_secs(c.track_break_time_secs),
            track_break_dist: c.track_break_dist,
            min_search_complex_dist: c.min_search_complex_dist,
            break_out_dist: c.break_out_dist,
            rdp_epsilon: c.rdp_epsilon,
            off_route_distance: c.off_route_distance,
            finish_tolerance: c.finish_tolerance,
            out_of_range_distance: c.out_of_range_distance,
            elevation_lookup_distance: c.elevation_lookup_distance,
        }
    }
}

impl From<PipelineConfig> for FfiPipelineConfig {
    fn from(c: PipelineConfig) -> Self {
        Self {
            track_break_time_secs: c.track_break_time.as_secs(),
            track_break_dist: c.track_break_dist,
            min_search_complex_dist: c.min_search_complex_dist,
            break_out_dist: c.break_out_dist,
            rdp_epsilon: c.rdp_epsilon,
            off_route_distance: c.off_route_distance,
            finish_tolerance: c.finish_tolerance,
            out_of_range_distance: c.out_of_range_distance,
            elevation_lookup_distance: c.elevation_lookup_distance,
        }
    }
}

fn to_raw_route(r: &FfiRoute) -> RawRoute {
    RawRoute {
        points: r
            .points
            .iter()
            .map(|p| RawRoutePoint {
                lat: p.lat,
                lon: p.lon,
                elevation: p.elevation,
            })
            .collect(),
        main: r.main,
        elevation: r.elevation.as_ref().map(|table| {
            table
                .iter()
                .map(|s| ElevationSample {
                    lat: s.lat,
                    lon: s.lon,
                    elevation: s.elevation,
                    along_distance: s.along_distance,
                })
                .collect()
        }),
        simplified_points_indexes: None,
        split_at_dist: None,
        split_point_range: 0.0,
        circular_range: r.circular_range,
    }
}

fn to_raw_point(p: &FfiRawPoint) -> CoreRawPoint {
    match (p.lat, p.lon) {
        (Some(lat), Some(lon)) => CoreRawPoint {
            time: p.time,
            position: Some(RawPosition { lat, lon, elevation: p.elevation }),
            server_time: p.server_time,
        },
        _ => CoreRawPoint::without_position(p.time),
    }
}

// ============================================================================
// Global registries
// ============================================================================

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

static ROUTE_SETS: Lazy<Mutex<HashMap<u64, Arc<RouteSet>>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static PIPELINES: Lazy<Mutex<HashMap<u64, Arc<Pipeline>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn next_handle() -> u64 {
    NEXT_HANDLE.fetch_add(1, Ordering::SeqCst)
}

// ============================================================================
// Route set setup
// ============================================================================

/// Preprocesses a route set (main route plus alternates) and returns an
/// opaque handle to it, or `None` if any route is malformed.
#[uniffi::export]
pub fn ffi_create_route_set(routes: Vec<FfiRoute>) -> Option<u64> {
    crate::init_logging();
    let raw_routes: Vec<RawRoute> = routes.iter().map(to_raw_route).collect();
    match RouteSet::new(raw_routes) {
        Ok(set) => {
            let handle = next_handle();
            ROUTE_SETS.lock().expect("route set registry mutex poisoned").insert(handle, Arc::new(set));
            log::info!("route set {handle} created with {} route(s)", routes.len());
            Some(handle)
        }
        Err(e) => {
            log::warn!("route set creation failed: {e}");
            None
        }
    }
}

/// Releases a route set handle. Pipelines built on it keep their own `Arc`
/// and remain valid.
#[uniffi::export]
pub fn ffi_release_route_set(handle: u64) {
    ROUTE_SETS.lock().expect("route set registry mutex poisoned").remove(&handle);
}

#[uniffi::export]
pub fn ffi_default_config() -> FfiPipelineConfig {
    PipelineConfig::default().into()
}

// ============================================================================
// Pipeline lifecycle
// ============================================================================

/// Creates a pipeline for one rider against a previously created route set.
/// Returns `None` if `route_set_handle` is unknown.
#[uniffi::export]
pub fn ffi_create_pipeline(route_set_handle: u64, config: FfiPipelineConfig) -> Option<u64> {
    crate::init_logging();
    let routes = ROUTE_SETS.lock().expect("route set registry mutex poisoned").get(&route_set_handle)?.clone();
    let pipeline = Arc::new(Pipeline::new(routes, route_set_handle, config.into()));
    let handle = next_handle();
    PIPELINES.lock().expect("pipeline registry mutex poisoned").insert(handle, pipeline);
    Some(handle)
}

/// Registers a callback to receive every analyzed point from a pipeline.
#[uniffi::export]
pub fn ffi_pipeline_subscribe_analyzed(handle: u64, callback: Box<dyn AnalysisCallback>) {
    if let Some(pipeline) = PIPELINES.lock().expect("pipeline registry mutex poisoned").get(&handle) {
        let callback: Arc<dyn AnalysisCallback> = Arc::from(callback);
        pipeline.analyzed.subscribe(Arc::new(move |p: &CoreAnalyzedPoint| callback.on_point(p.into())));
    }
}

/// Registers a callback to receive off-route excursion points from a
/// pipeline (§4.7).
#[uniffi::export]
pub fn ffi_pipeline_subscribe_off_route(handle: u64, callback: Box<dyn AnalysisCallback>) {
    if let Some(pipeline) = PIPELINES.lock().expect("pipeline registry mutex poisoned").get(&handle) {
        let callback: Arc<dyn AnalysisCallback> = Arc::from(callback);
        pipeline.off_route.subscribe(Arc::new(move |p: &CoreAnalyzedPoint| callback.on_point(p.into())));
    }
}

/// Processes an ordered batch of raw points, blocking until every point has
/// been analyzed and delivered to subscribed callbacks. Mirrors the
/// teacher's `fetch_activity_maps_sync`: a fresh tokio runtime bridges the
/// async pipeline into this synchronous FFI call.
#[uniffi::export]
pub fn ffi_pipeline_process_batch(handle: u64, points: Vec<FfiRawPoint>) {
    let pipeline = match PIPELINES.lock().expect("pipeline registry mutex poisoned").get(&handle) {
        Some(p) => Arc::clone(p),
        None => {
            log::warn!("process_batch called on unknown pipeline handle {handle}");
            return;
        }
    };

    let raw_points: Vec<CoreRawPoint> = points.iter().map(to_raw_point).collect();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::warn!("failed to create tokio runtime: {e}");
            return;
        }
    };
    rt.block_on(pipeline.process_batch(raw_points));
}

/// Discards accumulated state for a pipeline (§5, source reset signal).
#[uniffi::export]
pub fn ffi_pipeline_reset(handle: u64) {
    if let Some(pipeline) = PIPELINES.lock().expect("pipeline registry mutex poisoned").get(&handle) {
        pipeline.reset();
    }
}

/// Stops a pipeline's inactivity timer and releases its handle.
#[uniffi::export]
pub fn ffi_pipeline_stop(handle: u64) {
    if let Some(pipeline) = PIPELINES.lock().expect("pipeline registry mutex poisoned").remove(&handle) {
        pipeline.stop();
    }
}

/// Predicts the rider's current position at `time` (a Unix timestamp) from
/// the pipeline's last known state (§4.8).
#[uniffi::export]
pub fn ffi_predict(handle: u64, route_set_handle: u64, time: i64) -> Option<FfiPredictedPosition> {
    let pipeline = PIPELINES.lock().expect("pipeline registry mutex poisoned").get(&handle)?.clone();
    let routes = ROUTE_SETS.lock().expect("route set registry mutex poisoned").get(&route_set_handle)?.clone();
    let state = pipeline.state_snapshot();
    crate::predicted::predict(&state, &routes, pipeline.config(), time).map(FfiPredictedPosition::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_route() -> FfiRoute {
        FfiRoute {
            points: vec![
                FfiRoutePoint { lat: 0.0, lon: 0.0, elevation: None },
                FfiRoutePoint { lat: 0.0, lon: 0.01, elevation: None },
            ],
            main: true,
            elevation: None,
            circular_range: None,
        }
    }

    #[test]
    fn create_route_set_then_pipeline_round_trips() {
        let route_set_handle = ffi_create_route_set(vec![simple_route()]).unwrap();
        let pipeline_handle = ffi_create_pipeline(route_set_handle, ffi_default_config()).unwrap();

        ffi_pipeline_process_batch(
            pipeline_handle,
            vec![FfiRawPoint { time: 1000, lat: Some(0.0), lon: Some(0.005), elevation: None, server_time: None }],
        );

        let predicted = ffi_predict(pipeline_handle, route_set_handle, 1000);
        assert!(predicted.is_none());

        ffi_pipeline_stop(pipeline_handle);
        ffi_release_route_set(route_set_handle);
    }

    #[test]
    fn unknown_route_set_handle_yields_no_pipeline() {
        assert!(ffi_create_pipeline(999_999, ffi_default_config()).is_none());
    }

    #[test]
    fn malformed_route_yields_no_handle() {
        let route = FfiRoute { points: vec![], main: true, elevation: None, circular_range: None };
        assert!(ffi_create_route_set(vec![route]).is_none());
    }
}
