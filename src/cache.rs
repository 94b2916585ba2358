//! # Closest-Point Cache
//!
//! Memoizes [`search::find`] results keyed by the query point, since riders
//! revisit the same stretches of road (start pens, aid stations, out-and-back
//! sections) far more often than a fresh cross-track search would suggest.
//!
//! Without the `persistence` feature this is a plain in-memory map. With it,
//! writes go through a single-writer background thread the same way the
//! teacher's `PersistentRouteEngine` defers its SQLite writes — readers never
//! block on disk I/O, and a write failure is logged and dropped rather than
//! propagated.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AnalysisError, Result};
use crate::geo::Point;
use crate::search::{ClosestMatch, SegmentRef};

/// Cache key: the query tuple from the specification's §4.5 key — `(to.lat,
/// to.lon, min_search_complex_dist, prev_closest_route_index, break_out_dist,
/// prev_dist)` — quantized to IEEE-754 bit patterns so it can be hashed and
/// compared exactly. Every field that can change which candidate `search::find`
/// returns for the same point must be part of the key, or a cache hit from one
/// rider's prior-state context can be handed back for a different one (§5,
/// riders sharing a cache over the same route set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    route_set_id: u64,
    lat_bits: u64,
    lon_bits: u64,
    min_search_complex_dist_bits: u64,
    break_out_dist_bits: u64,
    prev_closest_route_index: Option<usize>,
    prev_dist_bits: Option<u64>,
}

impl CacheKey {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        route_set_id: u64,
        to: &Point,
        min_search_complex_dist: f64,
        break_out_dist: f64,
        prev_closest_route_index: Option<usize>,
        prev_dist: Option<f64>,
    ) -> Self {
        Self {
            route_set_id,
            lat_bits: to.lat.to_bits(),
            lon_bits: to.lon.to_bits(),
            min_search_complex_dist_bits: min_search_complex_dist.to_bits(),
            break_out_dist_bits: break_out_dist.to_bits(),
            prev_closest_route_index,
            prev_dist_bits: prev_dist.map(f64::to_bits),
        }
    }
}

/// Packed, `Copy`-able form of [`ClosestMatch`] suitable for hashing into a
/// table or serializing to the persistence backend. `pack`/`unpack` round
/// trip a `ClosestMatch` exactly modulo floating-point equality (§8).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    pub route_index: usize,
    pub segment_start_index: usize,
    pub segment_end_index: usize,
    pub distance_to_route: f64,
    pub along_route_distance: f64,
    pub local_distance: f64,
    pub projection_lat: f64,
    pub projection_lon: f64,
}

pub fn pack(m: &ClosestMatch) -> CacheEntry {
    CacheEntry {
        route_index: m.route_index,
        segment_start_index: m.segment.start_index,
        segment_end_index: m.segment.end_index,
        distance_to_route: m.distance_to_route,
        along_route_distance: m.along_route_distance,
        local_distance: m.local_distance,
        projection_lat: m.projection.lat,
        projection_lon: m.projection.lon,
    }
}

pub fn unpack(e: &CacheEntry) -> ClosestMatch {
    ClosestMatch {
        route_index: e.route_index,
        segment: SegmentRef {
            start_index: e.segment_start_index,
            end_index: e.segment_end_index,
        },
        projection: Point::new(e.projection_lat, e.projection_lon),
        distance_to_route: e.distance_to_route,
        along_route_distance: e.along_route_distance,
        local_distance: e.local_distance,
    }
}

/// A content-addressed store for closest-point matches.
///
/// `get`/`put` never block on disk: the in-memory table is always the
/// immediate source of truth, and (with `persistence`) writes are handed off
/// to a background thread that owns the only `rusqlite::Connection`.
pub struct ClosestPointCache {
    table: Mutex<HashMap<CacheKey, CacheEntry>>,
    #[cfg(feature = "persistence")]
    writer: Option<backend::Writer>,
}

impl ClosestPointCache {
    /// An in-memory-only cache, with no backing store.
    pub fn in_memory() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            #[cfg(feature = "persistence")]
            writer: None,
        }
    }

    /// A cache backed by a SQLite database at `db_path`, loading any
    /// previously persisted entries before returning.
    #[cfg(feature = "persistence")]
    pub fn open(db_path: &str) -> Result<Self> {
        let (writer, loaded) = backend::Writer::open(db_path)?;
        Ok(Self {
            table: Mutex::new(loaded),
            writer: Some(writer),
        })
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.table.lock().expect("cache mutex poisoned").get(key).copied()
    }

    /// Records a match, both in memory (immediately visible to `get`) and,
    /// with `persistence`, queued for the background writer. A full queue or
    /// a dead writer thread is a [`AnalysisError::CacheIOError`], logged by
    /// the caller rather than treated as fatal — the in-memory entry is
    /// still there either way.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> Result<()> {
        self.table.lock().expect("cache mutex poisoned").insert(key, entry);

        #[cfg(feature = "persistence")]
        if let Some(writer) = &self.writer {
            return writer.enqueue(key, entry);
        }

        Ok(())
    }

    /// Blocks until every queued write has been committed. Intended for
    /// clean shutdown and tests; never needed for correctness since `get`
    /// always sees the in-memory copy first.
    pub fn flush(&self) -> Result<()> {
        #[cfg(feature = "persistence")]
        if let Some(writer) = &self.writer {
            return writer.flush();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClosestPointCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(feature = "persistence")]
mod backend {
    use std::collections::HashMap;
    use std::sync::mpsc::{self, Sender};
    use std::sync::Mutex as StdMutex;
    use std::thread;

    use rusqlite::{params, Connection};

    use crate::error::{AnalysisError, Result};

    use super::{CacheEntry, CacheKey};

    enum Command {
        Put(CacheKey, CacheEntry),
        Flush(Sender<()>),
    }

    /// Owns the single `rusqlite::Connection` used for writes. The channel
    /// sender is cheap to clone and share; the connection itself never
    /// leaves the background thread.
    pub struct Writer {
        tx: Sender<Command>,
        // Held so `flush` can be called concurrently without racing a
        // second flush's ack channel.
        flush_lock: StdMutex<()>,
    }

    impl Writer {
        pub fn open(db_path: &str) -> Result<(Self, HashMap<CacheKey, CacheEntry>)> {
            let conn = Connection::open(db_path).map_err(|e| AnalysisError::CacheIOError {
                message: format!("opening cache database: {e}"),
            })?;
            init_schema(&conn).map_err(|e| AnalysisError::CacheIOError {
                message: format!("initializing cache schema: {e}"),
            })?;
            let loaded = load_all(&conn).map_err(|e| AnalysisError::CacheIOError {
                message: format!("loading cache entries: {e}"),
            })?;

            let (tx, rx) = mpsc::channel::<Command>();
            let db_path = db_path.to_string();
            thread::spawn(move || {
                let conn = match Connection::open(&db_path) {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("closest-point cache writer thread could not open database: {e}");
                        return;
                    }
                };
                for command in rx {
                    match command {
                        Command::Put(key, entry) => {
                            if let Err(e) = store_one(&conn, &key, &entry) {
                                log::warn!("closest-point cache write failed: {e}");
                            }
                        }
                        Command::Flush(ack) => {
                            ack.send(()).ok();
                        }
                    }
                }
            });

            Ok((
                Self {
                    tx,
                    flush_lock: StdMutex::new(()),
                },
                loaded,
            ))
        }

        pub fn enqueue(&self, key: CacheKey, entry: CacheEntry) -> Result<()> {
            self.tx
                .send(Command::Put(key, entry))
                .map_err(|e| AnalysisError::CacheIOError {
                    message: format!("cache writer thread is gone: {e}"),
                })
        }

        pub fn flush(&self) -> Result<()> {
            let _guard = self.flush_lock.lock().expect("flush mutex poisoned");
            let (ack_tx, ack_rx) = mpsc::channel();
            self.tx
                .send(Command::Flush(ack_tx))
                .map_err(|e| AnalysisError::CacheIOError {
                    message: format!("cache writer thread is gone: {e}"),
                })?;
            ack_rx.recv().map_err(|e| AnalysisError::CacheIOError {
                message: format!("cache writer thread dropped before flushing: {e}"),
            })
        }
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS closest_point_cache (
                route_set_id INTEGER NOT NULL,
                lat_bits INTEGER NOT NULL,
                lon_bits INTEGER NOT NULL,
                min_search_complex_dist_bits INTEGER NOT NULL,
                break_out_dist_bits INTEGER NOT NULL,
                prev_closest_route_index INTEGER,
                prev_dist_bits INTEGER,
                route_index INTEGER NOT NULL,
                segment_start_index INTEGER NOT NULL,
                segment_end_index INTEGER NOT NULL,
                distance_to_route REAL NOT NULL,
                along_route_distance REAL NOT NULL,
                local_distance REAL NOT NULL,
                projection_lat REAL NOT NULL,
                projection_lon REAL NOT NULL,
                PRIMARY KEY (route_set_id, lat_bits, lon_bits, min_search_complex_dist_bits,
                             break_out_dist_bits, prev_closest_route_index, prev_dist_bits)
            );
            "#,
        )
    }

    fn load_all(conn: &Connection) -> rusqlite::Result<HashMap<CacheKey, CacheEntry>> {
        let mut stmt = conn.prepare(
            "SELECT route_set_id, lat_bits, lon_bits, min_search_complex_dist_bits,
                    break_out_dist_bits, prev_closest_route_index, prev_dist_bits,
                    route_index, segment_start_index, segment_end_index, distance_to_route,
                    along_route_distance, local_distance, projection_lat, projection_lon
             FROM closest_point_cache",
        )?;
        let rows = stmt.query_map([], |row| {
            let route_set_id: i64 = row.get(0)?;
            let lat_bits: i64 = row.get(1)?;
            let lon_bits: i64 = row.get(2)?;
            let min_search_complex_dist_bits: i64 = row.get(3)?;
            let break_out_dist_bits: i64 = row.get(4)?;
            let prev_closest_route_index: Option<i64> = row.get(5)?;
            let prev_dist_bits: Option<i64> = row.get(6)?;
            let key = CacheKey {
                route_set_id: route_set_id as u64,
                lat_bits: lat_bits as u64,
                lon_bits: lon_bits as u64,
                min_search_complex_dist_bits: min_search_complex_dist_bits as u64,
                break_out_dist_bits: break_out_dist_bits as u64,
                prev_closest_route_index: prev_closest_route_index.map(|i| i as usize),
                prev_dist_bits: prev_dist_bits.map(|i| i as u64),
            };
            let entry = CacheEntry {
                route_index: row.get::<_, i64>(7)? as usize,
                segment_start_index: row.get::<_, i64>(8)? as usize,
                segment_end_index: row.get::<_, i64>(9)? as usize,
                distance_to_route: row.get(10)?,
                along_route_distance: row.get(11)?,
                local_distance: row.get(12)?,
                projection_lat: row.get(13)?,
                projection_lon: row.get(14)?,
            };
            Ok((key, entry))
        })?;

        let mut table = HashMap::new();
        for row in rows {
            let (key, entry) = row?;
            table.insert(key, entry);
        }
        Ok(table)
    }

    fn store_one(conn: &Connection, key: &CacheKey, entry: &CacheEntry) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO closest_point_cache
                (route_set_id, lat_bits, lon_bits, min_search_complex_dist_bits, break_out_dist_bits,
                 prev_closest_route_index, prev_dist_bits, route_index, segment_start_index,
                 segment_end_index, distance_to_route, along_route_distance, local_distance,
                 projection_lat, projection_lon)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                key.route_set_id as i64,
                key.lat_bits as i64,
                key.lon_bits as i64,
                key.min_search_complex_dist_bits as i64,
                key.break_out_dist_bits as i64,
                key.prev_closest_route_index.map(|i| i as i64),
                key.prev_dist_bits.map(|b| b as i64),
                entry.route_index as i64,
                entry.segment_start_index as i64,
                entry.segment_end_index as i64,
                entry.distance_to_route,
                entry.along_route_distance,
                entry.local_distance,
                entry.projection_lat,
                entry.projection_lon,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{ClosestMatch, SegmentRef};

    fn sample_match() -> ClosestMatch {
        ClosestMatch {
            route_index: 1,
            segment: SegmentRef {
                start_index: 4,
                end_index: 5,
            },
            projection: Point::new(51.5, -0.1),
            distance_to_route: 12.5,
            along_route_distance: 4321.0,
            local_distance: 4321.0,
        }
    }

    #[test]
    fn pack_unpack_round_trips() {
        let original = sample_match();
        let entry = pack(&original);
        let restored = unpack(&entry);
        assert_eq!(restored.route_index, original.route_index);
        assert_eq!(restored.segment.start_index, original.segment.start_index);
        assert_eq!(restored.segment.end_index, original.segment.end_index);
        assert_eq!(restored.distance_to_route, original.distance_to_route);
        assert_eq!(restored.along_route_distance, original.along_route_distance);
        assert_eq!(restored.local_distance, original.local_distance);
        assert_eq!(restored.projection.lat, original.projection.lat);
        assert_eq!(restored.projection.lon, original.projection.lon);
    }

    #[test]
    fn in_memory_cache_round_trips_through_get_put() {
        let cache = ClosestPointCache::in_memory();
        let key = CacheKey::new(0, &Point::new(51.5, -0.1), 5_000.0, 250.0, None, None);
        let entry = pack(&sample_match());
        cache.put(key, entry).unwrap();
        assert_eq!(cache.get(&key), Some(entry));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_points_get_distinct_keys() {
        let a = CacheKey::new(0, &Point::new(51.5, -0.1), 5_000.0, 250.0, None, None);
        let b = CacheKey::new(0, &Point::new(51.5, -0.10001), 5_000.0, 250.0, None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn same_point_different_route_set_gets_distinct_key() {
        let a = CacheKey::new(0, &Point::new(51.5, -0.1), 5_000.0, 250.0, None, None);
        let b = CacheKey::new(1, &Point::new(51.5, -0.1), 5_000.0, 250.0, None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn same_point_different_prior_state_gets_distinct_key() {
        let point = Point::new(51.5, -0.1);
        let base = CacheKey::new(0, &point, 5_000.0, 250.0, None, None);
        let different_prev_route = CacheKey::new(0, &point, 5_000.0, 250.0, Some(2), None);
        let different_prev_dist = CacheKey::new(0, &point, 5_000.0, 250.0, None, Some(1234.0));
        let different_min_search_complex_dist = CacheKey::new(0, &point, 6_000.0, 250.0, None, None);
        let different_break_out_dist = CacheKey::new(0, &point, 5_000.0, 300.0, None, None);

        assert_ne!(base, different_prev_route);
        assert_ne!(base, different_prev_dist);
        assert_ne!(base, different_min_search_complex_dist);
        assert_ne!(base, different_break_out_dist);
    }

    #[test]
    fn miss_returns_none() {
        let cache = ClosestPointCache::in_memory();
        let key = CacheKey::new(0, &Point::new(0.0, 0.0), 5_000.0, 250.0, None, None);
        assert!(cache.get(&key).is_none());
    }
}
