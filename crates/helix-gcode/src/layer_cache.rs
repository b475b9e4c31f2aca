//! Bounded in-memory cache of parsed layers.
//!
//! Least-recently-used eviction driven by a byte budget, never by entry
//! count. The cache is shared between the UI thread (layer requests) and
//! the prefetch task, so it is lock-guarded as a whole.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use helix_core::error::{Error, FileError, Result};

use crate::layer_index::LayerIndex;
use crate::toolpath::{parse_layer, LayerData};

/// LRU cache of parsed layers, capped by byte budget
pub struct LayerCache {
    inner: Mutex<CacheInner>,
    budget_bytes: usize,
}

struct CacheInner {
    layers: HashMap<usize, Arc<LayerData>>,
    /// Access order, least recent first
    order: Vec<usize>,
    resident_bytes: usize,
}

impl LayerCache {
    /// Create a cache with the given byte budget
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                layers: HashMap::new(),
                order: Vec::new(),
                resident_bytes: 0,
            }),
            budget_bytes,
        }
    }

    /// Configured byte budget
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    /// Bytes currently resident
    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().resident_bytes
    }

    /// Number of cached layers
    pub fn len(&self) -> usize {
        self.inner.lock().layers.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().layers.is_empty()
    }

    /// Fetch a layer, marking it most recently used
    pub fn get(&self, layer: usize) -> Option<Arc<LayerData>> {
        let mut inner = self.inner.lock();
        let data = inner.layers.get(&layer).cloned()?;
        inner.order.retain(|&l| l != layer);
        inner.order.push(layer);
        Some(data)
    }

    /// Whether a layer is resident without touching LRU order
    pub fn contains(&self, layer: usize) -> bool {
        self.inner.lock().layers.contains_key(&layer)
    }

    /// Install a layer, evicting least-recently-used entries over budget
    pub fn insert(&self, layer: usize, data: Arc<LayerData>) {
        let size = data.size_bytes();
        let mut inner = self.inner.lock();

        if let Some(old) = inner.layers.remove(&layer) {
            inner.resident_bytes = inner.resident_bytes.saturating_sub(old.size_bytes());
            inner.order.retain(|&l| l != layer);
        }

        // A layer bigger than the whole budget is never made resident;
        // the caller keeps its Arc and the byte bound holds.
        if size > self.budget_bytes {
            tracing::debug!(
                "Layer {} ({} bytes) exceeds cache budget ({} bytes), not caching",
                layer,
                size,
                self.budget_bytes
            );
            return;
        }

        inner.layers.insert(layer, data);
        inner.order.push(layer);
        inner.resident_bytes += size;

        while inner.resident_bytes > self.budget_bytes && !inner.order.is_empty() {
            let victim = inner.order.remove(0);
            if let Some(evicted) = inner.layers.remove(&victim) {
                inner.resident_bytes = inner.resident_bytes.saturating_sub(evicted.size_bytes());
                tracing::trace!("Evicted layer {} ({} bytes)", victim, evicted.size_bytes());
            }
        }
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.layers.clear();
        inner.order.clear();
        inner.resident_bytes = 0;
    }
}

/// On-demand layer loader combining index, cache, and prefetch
///
/// Lives for the lifetime of one file selection; build a new controller
/// when the selection changes.
pub struct StreamingController {
    index: Arc<LayerIndex>,
    cache: Arc<LayerCache>,
    path: PathBuf,
    prefetch_count: usize,
}

impl StreamingController {
    /// Create a controller over a built index
    pub fn new(
        index: LayerIndex,
        path: impl Into<PathBuf>,
        cache_budget_bytes: usize,
        prefetch_count: usize,
    ) -> Self {
        Self {
            index: Arc::new(index),
            cache: Arc::new(LayerCache::new(cache_budget_bytes)),
            path: path.into(),
            prefetch_count,
        }
    }

    /// Index this controller serves
    pub fn index(&self) -> &LayerIndex {
        &self.index
    }

    /// Cache statistics access
    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    /// Get a layer, loading and caching it if needed
    ///
    /// Requests prefetch of the neighbouring window when running inside
    /// a tokio runtime; otherwise only the requested layer is loaded.
    pub fn get_layer(&self, layer: usize) -> Result<Arc<LayerData>> {
        if let Some(data) = self.cache.get(layer) {
            self.spawn_prefetch(layer);
            return Ok(data);
        }

        let data = Arc::new(load_layer(&self.path, &self.index, layer)?);
        self.cache.insert(layer, data.clone());
        self.spawn_prefetch(layer);
        Ok(data)
    }

    fn spawn_prefetch(&self, around: usize) {
        if self.prefetch_count == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let index = self.index.clone();
        let cache = self.cache.clone();
        let path = self.path.clone();
        let count = self.prefetch_count;
        handle.spawn(async move {
            let layer_count = index.layer_count();
            let mut wanted = Vec::new();
            for step in 1..=count {
                if around + step < layer_count {
                    wanted.push(around + step);
                }
                if let Some(prev) = around.checked_sub(step) {
                    wanted.push(prev);
                }
            }
            for layer in wanted {
                if cache.contains(layer) {
                    continue;
                }
                match load_layer(&path, &index, layer) {
                    Ok(data) => cache.insert(layer, Arc::new(data)),
                    Err(e) => {
                        tracing::debug!("Prefetch of layer {} failed: {}", layer, e);
                        break;
                    }
                }
            }
        });
    }
}

/// Read exactly one layer's byte range and parse it
fn load_layer(path: &Path, index: &LayerIndex, layer: usize) -> Result<LayerData> {
    let entry = index.entry(layer).ok_or_else(|| {
        Error::InvalidArgument(format!(
            "layer {} out of range ({} layers)",
            layer,
            index.layer_count()
        ))
    })?;

    let io_err = |e: std::io::Error| {
        Error::File(FileError::LocalIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    };

    let mut file = File::open(path).map_err(io_err)?;
    file.seek(SeekFrom::Start(entry.file_offset)).map_err(io_err)?;
    let mut bytes = vec![0u8; entry.byte_length as usize];
    file.read_exact(&mut bytes).map_err(io_err)?;

    Ok(parse_layer(layer, &bytes, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolpath::{PathPoint, Segment, SegmentKind};
    use std::io::Write;

    fn layer_of_size(layer: usize, segments: usize) -> Arc<LayerData> {
        let seg = Segment {
            from: PathPoint::default(),
            to: PathPoint::default(),
            kind: SegmentKind::Travel,
        };
        Arc::new(LayerData {
            layer,
            segments: vec![seg; segments],
            raw_bytes: 0,
        })
    }

    #[test]
    fn test_budget_is_respected() {
        let one = layer_of_size(0, 10);
        let budget = one.size_bytes() * 3;
        let cache = LayerCache::new(budget);

        for i in 0..10 {
            cache.insert(i, layer_of_size(i, 10));
            assert!(cache.resident_bytes() <= budget);
        }
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        let one = layer_of_size(0, 10);
        let cache = LayerCache::new(one.size_bytes() * 2);

        cache.insert(0, layer_of_size(0, 10));
        cache.insert(1, layer_of_size(1, 10));
        // Touch 0 so 1 becomes the eviction victim.
        assert!(cache.get(0).is_some());
        cache.insert(2, layer_of_size(2, 10));

        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
    }

    #[test]
    fn test_oversized_layer_is_not_cached() {
        let small = layer_of_size(0, 10);
        let cache = LayerCache::new(small.size_bytes() * 2);

        cache.insert(0, layer_of_size(0, 10));
        cache.insert(1, layer_of_size(1, 100));

        assert!(!cache.contains(1));
        assert!(cache.resident_bytes() <= cache.budget_bytes());
        // The smaller resident layer survives the oversized insert.
        assert!(cache.contains(0));

        // Replacing a resident layer with an oversized one drops it.
        cache.insert(0, layer_of_size(0, 100));
        assert!(!cache.contains(0));
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn test_reinsert_replaces_accounting() {
        let cache = LayerCache::new(1 << 20);
        cache.insert(0, layer_of_size(0, 10));
        let first = cache.resident_bytes();
        cache.insert(0, layer_of_size(0, 10));
        assert_eq!(cache.resident_bytes(), first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_controller_loads_exact_ranges() {
        let content = "G1 Z0.2 E0.1\nG1 X10 E0.2\nG1 Z0.4 E0.3\nG1 X20 E0.4\n";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let index = LayerIndex::build_from_file(file.path()).unwrap();
        let controller = StreamingController::new(index, file.path(), 1 << 20, 0);

        let layer0 = controller.get_layer(0).unwrap();
        let layer1 = controller.get_layer(1).unwrap();
        assert_eq!(
            layer0.raw_bytes + layer1.raw_bytes,
            content.len()
        );
        // Second fetch hits the cache.
        let again = controller.get_layer(1).unwrap();
        assert!(Arc::ptr_eq(&layer1, &again));
        assert!(controller.get_layer(7).is_err());
    }
}
