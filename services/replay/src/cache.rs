//! Capacity-bounded store of frame groups.
//!
//! The cache holds a contiguous index window `[start, end)`. Callers insert
//! groups in increasing index order and call [`FrameCache::relieve`] when the
//! cache is full; the timestamps of every group ever produced are kept so a
//! seek can find where a frame lives in the recording after it was evicted.

use crate::config::CacheConfig;
use crate::sync::FrameGroup;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Which eviction policy freed room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionKind {
    /// The playback target lies beyond the window; the whole window was dropped.
    Sweep,
    /// The oldest batch was dropped behind a cursor that has caught up.
    Trim,
}

/// Result of one [`FrameCache::relieve`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub kind: EvictionKind,
    pub range: Range<u64>,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct FrameCache {
    groups: BTreeMap<u64, Arc<FrameGroup>>,
    timestamps: BTreeMap<u64, u64>,
    start: Option<u64>,
    end: u64,
    max_entries: usize,
    eviction_batch: usize,
}

impl FrameCache {
    pub fn new(max_entries: usize, eviction_batch: usize) -> Self {
        Self {
            groups: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            start: None,
            end: 0,
            max_entries: max_entries.max(1),
            eviction_batch: eviction_batch.max(1),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_cache_count, config.eviction_batch_size())
    }

    /// Drop every cached group and expect the next insertion at `start_index`.
    /// Known timestamps are kept.
    pub fn reset(&mut self, start_index: u64) {
        self.groups.clear();
        self.start = None;
        self.end = start_index;
    }

    /// Store a group at the end of the window.
    pub fn insert(&mut self, group: Arc<FrameGroup>) {
        let index = group.frame_index;
        debug_assert!(index >= self.end, "frame groups must be inserted in order");

        self.timestamps.insert(index, group.base_timestamp_ns);
        self.groups.insert(index, group);
        if self.start.is_none() {
            self.start = Some(index);
        }
        self.end = index + 1;
    }

    pub fn get(&self, index: u64) -> Option<Arc<FrameGroup>> {
        if self.contains(index) {
            self.groups.get(&index).cloned()
        } else {
            None
        }
    }

    /// Whether `index` lies inside `[start, end)`.
    pub fn contains(&self, index: u64) -> bool {
        matches!(self.start, Some(start) if start <= index && index < self.end)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.groups.len() >= self.max_entries
    }

    /// First cached index, if anything was inserted since the last reset.
    pub fn start(&self) -> Option<u64> {
        self.start
    }

    /// One past the last inserted index.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn eviction_batch(&self) -> usize {
        self.eviction_batch
    }

    /// Timestamp of a group produced at any point, cached or not.
    pub fn timestamp_of(&self, index: u64) -> Option<u64> {
        self.timestamps.get(&index).copied()
    }

    /// Highest index with a known timestamp.
    pub fn last_known(&self) -> Option<(u64, u64)> {
        self.timestamps.iter().next_back().map(|(i, t)| (*i, *t))
    }

    /// Known index whose timestamp is closest to `timestamp_ns`.
    pub fn nearest_index(&self, timestamp_ns: u64) -> Option<u64> {
        self.timestamps
            .iter()
            .min_by_key(|(index, ts)| (ts.abs_diff(timestamp_ns), **index))
            .map(|(index, _)| *index)
    }

    /// Free room once the cache is full.
    ///
    /// With a `target` at or beyond the window, the whole window is stale and
    /// dropped. Otherwise the oldest batch is dropped once `cursor` has moved
    /// past `end - batch`; a cursor further behind leaves the cache untouched
    /// and the producer has to wait for it.
    pub fn relieve(&mut self, cursor: u64, target: Option<u64>) -> Option<Eviction> {
        if !self.is_full() {
            return None;
        }
        let start = self.start?;

        if matches!(target, Some(t) if t >= self.end) {
            let range = start..self.end;
            let evicted = self.evict(range.clone());
            self.start = Some(self.end);
            debug!(from = range.start, to = range.end, evicted, "Stale window swept");
            return Some(Eviction {
                kind: EvictionKind::Sweep,
                range,
                evicted,
            });
        }

        let release_below = self.end.saturating_sub(self.eviction_batch as u64);
        if cursor > release_below {
            let range = start..start + self.eviction_batch as u64;
            let evicted = self.evict(range.clone());
            self.start = Some(range.end.min(self.end));
            debug!(from = range.start, to = range.end, evicted, "Oldest frames trimmed");
            return Some(Eviction {
                kind: EvictionKind::Trim,
                range,
                evicted,
            });
        }

        None
    }

    fn evict(&mut self, range: Range<u64>) -> usize {
        let before = self.groups.len();
        self.groups.retain(|index, _| !range.contains(index));
        before - self.groups.len()
    }

    /// Drop everything, including known timestamps.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.timestamps.clear();
        self.start = None;
    }
}
