//! In-memory LRU cache for encoded thumbnails.
//!
//! Keys are fully normalized before they reach the cache, so two requests
//! that differ only in how the position was expressed (time vs percent,
//! clamped vs in-range) map to the same entry. Eviction is strict LRU over
//! entry count: inserting into a full cache evicts exactly the
//! least-recently-used entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;
use video_thumb_common::{ThumbFormat, Thumbnail};

/// Canonical identity of a thumbnail.
///
/// `time_ms` is the resolved, clamped target timestamp; percent positions and
/// out-of-range times have already been normalized away. Dimension bounds of
/// zero (unbounded) are part of the key as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedKey {
    pub source_id: String,
    pub time_ms: u64,
    pub max_width: u32,
    pub max_height: u32,
    pub preserve_aspect: bool,
    pub format: ThumbFormat,
    pub quality: u8,
}

impl fmt::Display for NormalizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}ms {}x{} {} q{}",
            self.source_id, self.time_ms, self.max_width, self.max_height, self.format, self.quality
        )
    }
}

/// Hit/miss counters, snapshotted under the cache lock
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Entry {
    thumbnail: Thumbnail,
    stamp: u64,
}

struct Inner {
    map: HashMap<NormalizedKey, Entry>,
    clock: u64,
    hits: u64,
    misses: u64,
}

/// Bounded thumbnail cache shared across the service.
///
/// A single mutex guards the map; all operations are short (no decoding or
/// encoding happens under the lock) so contention stays negligible next to
/// the cost of a decode.
pub struct ThumbnailCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ThumbnailCache {
    /// Create a cache holding at most `capacity` thumbnails. A capacity of
    /// zero disables caching entirely.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                clock: 0,
                hits: 0,
                misses: 0,
            }),
            capacity,
        }
    }

    /// Look up a thumbnail, marking the entry most-recently-used on a hit
    pub fn get(&self, key: &NormalizedKey) -> Option<Thumbnail> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.clock += 1;
        let stamp = inner.clock;
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.stamp = stamp;
                let thumbnail = entry.thumbnail.clone();
                inner.hits += 1;
                Some(thumbnail)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a thumbnail, evicting the least-recently-used entry if full.
    ///
    /// Re-inserting an existing key replaces the entry in place without
    /// evicting anything else.
    pub fn put(&self, key: NormalizedKey, thumbnail: Thumbnail) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.clock += 1;
        let stamp = inner.clock;

        if !inner.map.contains_key(&key) && inner.map.len() >= self.capacity {
            if let Some(victim) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| k.clone())
            {
                debug!("evicting {victim}");
                inner.map.remove(&victim);
            }
        }

        inner.map.insert(key, Entry { thumbnail, stamp });
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.map.clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        CacheStats {
            entries: inner.map.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}
