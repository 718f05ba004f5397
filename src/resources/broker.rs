//! Resource registry / shared-memory broker.
//!
//! Stages never load reference grids directly: they ask the broker for a
//! named resource and get back a claim on a [`Grid`]. The broker keys
//! resources by identity (name + source), loads each one at most once per
//! process, and reference-counts claims so a grid stays alive exactly as
//! long as some stage holds it. With the shared flag set, the backing is a
//! named shared-memory segment and sibling worker processes attach to the
//! pages the first worker loaded instead of loading their own copy.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::types::{ResourceError, ResourceResult};

use super::grid::{Grid, RawGrid};
#[cfg(unix)]
use super::shm::SharedSegment;

/// A claim on a broker-managed grid; hand it back with
/// [`ResourceBroker::release`] exactly once
pub struct GridHandle {
    key: String,
    grid: Arc<Grid>,
}

impl GridHandle {
    pub fn grid(&self) -> &Grid {
        &self.grid
    }
}

impl std::ops::Deref for GridHandle {
    type Target = Grid;

    fn deref(&self) -> &Grid {
        &self.grid
    }
}

impl std::fmt::Debug for GridHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridHandle").field("key", &self.key).finish()
    }
}

struct Entry {
    grid: Arc<Grid>,
    claims: usize,
}

/// Identity-keyed registry of loaded reference grids
pub struct ResourceBroker {
    entries: Mutex<HashMap<String, Entry>>,
    /// Namespace for shared-memory segment names; lets test runs and
    /// production chains coexist on one machine
    segment_namespace: String,
}

impl Default for ResourceBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceBroker {
    pub fn new() -> Self {
        Self::with_namespace("floe")
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            segment_namespace: namespace.into(),
        }
    }

    /// Reproducible shared-memory segment name for a resource identity
    fn segment_name(&self, name: &str, source: &str) -> String {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        source.hash(&mut hasher);
        let short: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(40)
            .collect();
        format!("/{}.{:016x}.{}", self.segment_namespace, hasher.finish(), short)
    }

    /// Acquire a claim on the grid identified by `(name, source)`.
    ///
    /// The loader runs only when this identity is not yet resident: a
    /// repeat acquire in-process bumps the claim count, and with `shared`
    /// set an acquire in a sibling process attaches to the existing segment
    /// without copying array data.
    pub fn acquire_with<F>(
        &self,
        name: &str,
        source: &str,
        shared: bool,
        loader: F,
    ) -> ResourceResult<GridHandle>
    where
        F: FnOnce() -> ResourceResult<RawGrid>,
    {
        let key = format!("{}:{}", name, source);

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ResourceError::Validation("resource registry poisoned".to_string()))?;

        if let Some(entry) = entries.get_mut(&key) {
            entry.claims += 1;
            log::debug!("resource {} reacquired ({} claims)", key, entry.claims);
            return Ok(GridHandle {
                key,
                grid: Arc::clone(&entry.grid),
            });
        }

        let grid = if shared {
            self.load_shared(name, source, loader)?
        } else {
            let raw = loader()?;
            Grid::from_raw(name, raw)?
        };

        let grid = Arc::new(grid);
        entries.insert(
            key.clone(),
            Entry {
                grid: Arc::clone(&grid),
                claims: 1,
            },
        );
        log::info!("resource {} acquired (shared={})", key, shared);
        Ok(GridHandle { key, grid })
    }

    #[cfg(unix)]
    fn load_shared<F>(&self, name: &str, source: &str, loader: F) -> ResourceResult<Grid>
    where
        F: FnOnce() -> ResourceResult<RawGrid>,
    {
        let os_name = self.segment_name(name, source);
        let (segment, created) = SharedSegment::create_or_attach(&os_name, || {
            let raw = loader()?;
            raw.validate()?;
            Ok(raw)
        })?;
        if !created {
            log::info!("resource {}:{} attached from sibling segment", name, source);
        }
        Grid::from_segment(name, segment)
    }

    #[cfg(not(unix))]
    fn load_shared<F>(&self, name: &str, source: &str, loader: F) -> ResourceResult<Grid>
    where
        F: FnOnce() -> ResourceResult<RawGrid>,
    {
        log::warn!(
            "shared memory unavailable on this platform; loading {}:{} privately",
            name,
            source
        );
        let raw = loader()?;
        Grid::from_raw(name, raw)
    }

    /// Drop one claim; when the last claim goes, the grid is evicted and a
    /// shared backing segment loses this process's reference (the final
    /// process to let go unlinks it).
    pub fn release(&self, handle: GridHandle) {
        let GridHandle { key, grid } = handle;
        drop(grid);

        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => {
                log::warn!("resource registry poisoned; leaking {}", key);
                return;
            }
        };

        let Some(mut entry) = entries.remove(&key) else {
            log::warn!("release of unknown resource {}", key);
            return;
        };

        entry.claims -= 1;
        if entry.claims > 0 {
            log::debug!("resource {} released ({} claims remain)", key, entry.claims);
            entries.insert(key, entry);
            return;
        }
        drop(entries);

        match Arc::try_unwrap(entry.grid) {
            Ok(_grid) => {
                #[cfg(unix)]
                if let Some(segment) = _grid.into_segment() {
                    segment.release();
                }
                log::info!("resource {} evicted", key);
            }
            Err(_) => log::warn!("resource {} still referenced after final release", key),
        }
    }

    /// Number of distinct resident resources (diagnostics)
    pub fn resident(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Projection;
    use crate::types::GeoTransform;
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(fill: f32) -> RawGrid {
        RawGrid {
            data: Array2::from_elem((4, 4), fill),
            transform: GeoTransform {
                top_left_x: 0.0,
                pixel_width: 1.0,
                top_left_y: 4.0,
                pixel_height: -1.0,
            },
            projection: Projection::Geographic,
            void_value: -9999.0,
        }
    }

    #[test]
    fn test_repeat_acquire_loads_once() {
        let broker = ResourceBroker::with_namespace(format!("floe.t{}", std::process::id()));
        let loads = AtomicUsize::new(0);

        let a = broker
            .acquire_with("dem", "synthetic", false, || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(raw(5.0))
            })
            .unwrap();
        let b = broker
            .acquire_with("dem", "synthetic", false, || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(raw(5.0))
            })
            .unwrap();

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(broker.resident(), 1);

        broker.release(a);
        assert_eq!(broker.resident(), 1);
        broker.release(b);
        assert_eq!(broker.resident(), 0);
    }

    #[test]
    fn test_distinct_sources_are_distinct_resources() {
        let broker = ResourceBroker::with_namespace(format!("floe.u{}", std::process::id()));
        let a = broker
            .acquire_with("dem", "file_a", false, || Ok(raw(1.0)))
            .unwrap();
        let b = broker
            .acquire_with("dem", "file_b", false, || Ok(raw(2.0)))
            .unwrap();
        assert_eq!(broker.resident(), 2);
        broker.release(a);
        broker.release(b);
    }

    #[test]
    fn test_failed_load_registers_nothing() {
        let broker = ResourceBroker::with_namespace(format!("floe.v{}", std::process::id()));
        let result = broker.acquire_with("dem", "missing", false, || {
            Err(ResourceError::Validation("no such file".into()))
        });
        assert!(result.is_err());
        assert_eq!(broker.resident(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_shared_and_private_backings_interpolate_identically() {
        let broker = ResourceBroker::with_namespace(format!("floe.w{}", std::process::id()));
        let mut data = Array2::from_elem((6, 6), 0.0_f32);
        for ((r, c), v) in data.indexed_iter_mut() {
            *v = (r * 10 + c) as f32;
        }

        let private = broker
            .acquire_with("dem_private", "syn", false, || {
                Ok(RawGrid { data: data.clone(), ..raw(0.0) })
            })
            .unwrap();
        let shared = broker
            .acquire_with("dem_shared", "syn", true, || {
                Ok(RawGrid { data: data.clone(), ..raw(0.0) })
            })
            .unwrap();

        let lats = ndarray::array![3.2, 1.7, 2.9];
        let lons = ndarray::array![1.1, 4.3, 2.2];
        let a = private.interpolate(&lats, &lons);
        let b = shared.interpolate(&lats, &lons);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-9, "{} vs {}", x, y);
        }

        broker.release(private);
        broker.release(shared);
    }
}
