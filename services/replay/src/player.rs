//! Cached, seekable playback of synchronized frame groups.
//!
//! A [`Player`] owns one recording. A background producer thread reads the
//! video topics in time order, decodes and synchronizes them, and fills a
//! bounded [`FrameCache`]. Consumers pull groups sequentially or seek; seeks
//! to frames outside the cache restart the producer at the frame's recorded
//! timestamp.

use crate::cache::{EvictionKind, FrameCache};
use crate::config::{CacheConfig, ReplayConfig};
use crate::container::{
    ClassifyRules, ContainerError, ContainerSummary, McapContainer, MessageSource,
};
use crate::decoder::FrameDecoder;
use crate::sync::{FrameGroup, FrameSynchronizer};
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const JOIN_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Frame {index} is not available")]
    FrameUnavailable { index: u64 },

    #[error("No frames have been loaded yet")]
    NotLoaded,

    #[error("Producer did not stop within {0:?}")]
    SyncTimeout(Duration),

    #[error("Failed to spawn producer thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Cache and timing parameters of one player.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub tolerance_ns: u64,
    pub max_cache_count: usize,
    pub eviction_batch: usize,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
    pub frame_wait_timeout: Duration,
}

impl From<&CacheConfig> for PlaybackSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            tolerance_ns: config.tolerance_ns(),
            max_cache_count: config.max_cache_count,
            eviction_batch: config.eviction_batch_size(),
            poll_interval: config.poll_interval(),
            join_timeout: config.join_timeout(),
            frame_wait_timeout: config.frame_wait_timeout(),
        }
    }
}

/// Playback counters.
#[derive(Debug, Default, Clone)]
pub struct PlayerStats {
    pub groups_produced: u64,
    pub groups_evicted: u64,
    pub sweeps: u64,
    pub trims: u64,
    pub restarts: u64,
    pub read_errors: u64,
    pub join_timeouts: u64,
    pub decode_failures: u64,
}

struct PlaybackState {
    cache: FrameCache,
    /// Next index handed out by sequential playback
    cursor: u64,
    /// Frame a pending seek is waiting for
    target: Option<u64>,
    producing: bool,
    /// Bumped on every producer start; older producers must not write
    generation: u64,
    stats: PlayerStats,
}

struct Shared {
    state: Mutex<PlaybackState>,
    changed: Condvar,
    /// Serialises read passes over the source
    read_handle: Mutex<()>,
    source: Arc<dyn MessageSource>,
    decoder: FrameDecoder,
    video_topics: Vec<String>,
    settings: PlaybackSettings,
}

struct Producer {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
struct LoadJob {
    start_ns: Option<u64>,
    end_ns: Option<u64>,
    start_frame: u64,
    generation: u64,
}

pub struct Player {
    shared: Arc<Shared>,
    summary: ContainerSummary,
    producer: Mutex<Option<Producer>>,
}

impl Player {
    /// Open a recording file and summarise it.
    pub fn open(path: impl AsRef<Path>, config: &ReplayConfig) -> Result<Self, ContainerError> {
        let container = McapContainer::open(path)?;
        let summary = container.summary(&ClassifyRules::from(&config.container))?;

        Ok(Self::with_source(
            Arc::new(container),
            summary,
            PlaybackSettings::from(&config.cache),
            FrameDecoder::new(&config.container),
        ))
    }

    pub fn with_source(
        source: Arc<dyn MessageSource>,
        summary: ContainerSummary,
        settings: PlaybackSettings,
        decoder: FrameDecoder,
    ) -> Self {
        let cache = FrameCache::new(settings.max_cache_count, settings.eviction_batch);
        let shared = Shared {
            state: Mutex::new(PlaybackState {
                cache,
                cursor: 0,
                target: None,
                producing: false,
                generation: 0,
                stats: PlayerStats::default(),
            }),
            changed: Condvar::new(),
            read_handle: Mutex::new(()),
            source,
            decoder,
            video_topics: summary.video_topics.clone(),
            settings,
        };

        Self {
            shared: Arc::new(shared),
            summary,
            producer: Mutex::new(None),
        }
    }

    pub fn summary(&self) -> &ContainerSummary {
        &self.summary
    }

    pub fn source(&self) -> Arc<dyn MessageSource> {
        self.shared.source.clone()
    }

    /// Start producing frame groups from `start_ns`, numbering them from
    /// `start_frame`. Any running producer is stopped first.
    pub fn start_load(
        &self,
        start_ns: Option<u64>,
        end_ns: Option<u64>,
        start_frame: u64,
    ) -> Result<(), PlaybackError> {
        let mut slot = self.producer.lock();
        self.stop_producer(&mut slot);

        let generation = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.cache.reset(start_frame);
            state.cursor = start_frame;
            state.producing = true;
            state.generation
        };

        let job = LoadJob {
            start_ns,
            end_ns,
            start_frame,
            generation,
        };
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = self.shared.clone();

        let spawned = thread::Builder::new()
            .name(format!("frame-producer-{}", generation))
            .spawn(move || run_producer(shared, job, token));

        match spawned {
            Ok(handle) => {
                info!(
                    generation = generation,
                    start_ns = ?start_ns,
                    start_frame = start_frame,
                    "Producer started"
                );
                *slot = Some(Producer {
                    generation,
                    cancel,
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                self.shared.finish(generation);
                Err(PlaybackError::Spawn(e))
            }
        }
    }

    fn stop_producer(&self, slot: &mut Option<Producer>) {
        let Some(producer) = slot.take() else {
            return;
        };

        producer.cancel.cancel();
        self.shared.changed.notify_all();

        if let Err(e) = join_bounded(producer.handle, self.shared.settings.join_timeout) {
            warn!(
                generation = producer.generation,
                error = %e,
                "Producer still running, detaching"
            );
            self.shared.state.lock().stats.join_timeouts += 1;
        }
        self.shared.finish(producer.generation);
    }

    /// Next group in sequential order, waiting while it is being produced.
    ///
    /// Returns `None` once the frame can no longer appear: production ended,
    /// the frame was evicted, or the wait timed out.
    pub fn get_next_frame(&self) -> Option<Arc<FrameGroup>> {
        let deadline = Instant::now() + self.shared.settings.frame_wait_timeout;
        let mut state = self.shared.state.lock();

        loop {
            let cursor = state.cursor;
            if let Some(group) = state.cache.get(cursor) {
                state.cursor = cursor + 1;
                self.shared.changed.notify_all();
                return Some(group);
            }

            if matches!(state.cache.start(), Some(start) if cursor < start) {
                warn!(frame_index = cursor, "Next frame is no longer cached");
                return None;
            }
            if !state.producing {
                return None;
            }
            if Instant::now() >= deadline {
                warn!(frame_index = cursor, "Timed out waiting for next frame");
                return None;
            }
            self.shared
                .changed
                .wait_for(&mut state, self.shared.settings.poll_interval);
        }
    }

    /// Jump to `index` and return its group.
    ///
    /// Cached frames are returned directly. Frames just ahead of the loaded
    /// window are waited for; frames whose timestamp is known from an earlier
    /// pass restart the producer there.
    pub fn seek_to_frame(&self, index: u64) -> Result<Arc<FrameGroup>, PlaybackError> {
        let restart_at = {
            let mut state = self.shared.state.lock();
            state.target = Some(index);

            if let Some(group) = state.cache.get(index) {
                debug!(frame_index = index, "Seek hit cache");
                state.cursor = index + 1;
                self.shared.changed.notify_all();
                return Ok(group);
            }

            let end = state.cache.end();
            let loading =
                state.producing && index >= end && index < end + state.cache.eviction_batch() as u64;

            match state.cache.timestamp_of(index) {
                _ if loading => None,
                Some(ts) => Some(ts),
                // behind the loaded window and never produced
                None if index < end => {
                    state.clear_target(index);
                    return Err(PlaybackError::FrameUnavailable { index });
                }
                None => None,
            }
        };

        match restart_at {
            Some(timestamp_ns) => {
                info!(
                    frame_index = index,
                    timestamp_ns = timestamp_ns,
                    "Frame not cached, restarting producer"
                );
                self.start_load(Some(timestamp_ns), None, index)?;
                self.shared.state.lock().stats.restarts += 1;
            }
            None => debug!(frame_index = index, "Waiting for producer to reach frame"),
        }

        self.wait_for_frame(index)
    }

    /// Index of the known frame nearest to `timestamp_ns`.
    ///
    /// Timestamps past the last produced frame map to the last frame of the
    /// recording.
    pub fn index_for_time(&self, timestamp_ns: u64) -> Option<u64> {
        let state = self.shared.state.lock();
        let (last_index, last_ts) = state.cache.last_known()?;

        if timestamp_ns > last_ts {
            Some(last_index.max(self.summary.video_frame_count.saturating_sub(1)))
        } else {
            state.cache.nearest_index(timestamp_ns)
        }
    }

    pub fn seek_to_time(&self, timestamp_ns: u64) -> Result<Arc<FrameGroup>, PlaybackError> {
        let index = self.index_for_time(timestamp_ns).ok_or_else(|| {
            warn!(timestamp_ns = timestamp_ns, "Seek before any frame was loaded");
            PlaybackError::NotLoaded
        })?;
        self.seek_to_frame(index)
    }

    fn wait_for_frame(&self, index: u64) -> Result<Arc<FrameGroup>, PlaybackError> {
        let deadline = Instant::now() + self.shared.settings.frame_wait_timeout;
        let mut state = self.shared.state.lock();

        loop {
            if let Some(group) = state.cache.get(index) {
                state.cursor = index + 1;
                self.shared.changed.notify_all();
                return Ok(group);
            }
            if !state.producing {
                state.clear_target(index);
                return Err(PlaybackError::FrameUnavailable { index });
            }
            if Instant::now() >= deadline {
                warn!(frame_index = index, "Timed out waiting for frame");
                state.clear_target(index);
                return Err(PlaybackError::FrameUnavailable { index });
            }
            self.shared
                .changed
                .wait_for(&mut state, self.shared.settings.poll_interval);
        }
    }

    pub fn cursor(&self) -> u64 {
        self.shared.state.lock().cursor
    }

    /// Loaded index window `[start, end)`.
    pub fn cache_window(&self) -> (Option<u64>, u64) {
        let state = self.shared.state.lock();
        (state.cache.start(), state.cache.end())
    }

    pub fn cached_len(&self) -> usize {
        self.shared.state.lock().cache.len()
    }

    pub fn is_producing(&self) -> bool {
        self.shared.state.lock().producing
    }

    pub fn stats(&self) -> PlayerStats {
        let mut stats = self.shared.state.lock().stats.clone();
        stats.decode_failures = self.shared.decoder.stats().decode_failures;
        stats
    }

    /// Stop the producer and release every cached frame.
    pub fn close(&self) {
        let mut slot = self.producer.lock();
        self.stop_producer(&mut slot);

        let mut state = self.shared.state.lock();
        state.cache.clear();
        state.target = None;
        state.cursor = 0;
        debug!("Player closed");
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

impl PlaybackState {
    /// Forget a failed seek so it no longer steers eviction.
    fn clear_target(&mut self, index: u64) {
        if self.target == Some(index) {
            self.target = None;
        }
    }
}

impl Shared {
    /// Mark production finished if `generation` is still current.
    fn finish(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.producing = false;
        }
        self.changed.notify_all();
    }

    /// Insert a group and wait for room. Returns `false` when the producer
    /// must stop.
    fn store(&self, group: FrameGroup, generation: u64, cancel: &CancellationToken) -> bool {
        let index = group.frame_index;
        let mut state = self.state.lock();
        if cancel.is_cancelled() || state.generation != generation {
            return false;
        }

        state.cache.insert(Arc::new(group));
        state.stats.groups_produced += 1;
        if index % 30 == 0 {
            debug!(frame_index = index, cached = state.cache.len(), "Frame group loaded");
        }
        self.changed.notify_all();

        while state.cache.is_full() {
            if cancel.is_cancelled() || state.generation != generation {
                return false;
            }

            let cursor = state.cursor;
            let target = state.target;
            if let Some(eviction) = state.cache.relieve(cursor, target) {
                state.stats.groups_evicted += eviction.evicted as u64;
                match eviction.kind {
                    EvictionKind::Sweep => state.stats.sweeps += 1,
                    EvictionKind::Trim => state.stats.trims += 1,
                }
                continue;
            }

            self.changed.wait_for(&mut state, self.settings.poll_interval);
        }
        true
    }
}

fn run_producer(shared: Arc<Shared>, job: LoadJob, cancel: CancellationToken) {
    let _read_guard = loop {
        if cancel.is_cancelled() {
            shared.finish(job.generation);
            return;
        }
        if let Some(guard) = shared.read_handle.try_lock_for(shared.settings.poll_interval) {
            break guard;
        }
    };

    let messages = match shared
        .source
        .messages(&shared.video_topics, job.start_ns, job.end_ns)
    {
        Ok(messages) => messages,
        Err(e) => {
            error!(generation = job.generation, error = %e, "Failed to open read pass");
            shared.finish(job.generation);
            return;
        }
    };

    let mut sync = FrameSynchronizer::new(shared.settings.tolerance_ns, job.start_frame);
    let mut stopped = false;

    for message in messages {
        if cancel.is_cancelled() {
            stopped = true;
            break;
        }

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable message");
                shared.state.lock().stats.read_errors += 1;
                continue;
            }
        };

        let frame = shared
            .decoder
            .decode(&message.schema_name, &message.data)
            .map(Arc::new);

        if let Some(group) = sync.push(&message.topic, message.log_time, frame) {
            if !shared.store(group, job.generation, &cancel) {
                stopped = true;
                break;
            }
        }
    }

    if !stopped {
        if let Some(group) = sync.flush() {
            shared.store(group, job.generation, &cancel);
        }
        info!(
            generation = job.generation,
            next_index = sync.next_index(),
            "Producer reached end of recording"
        );
    } else {
        debug!(generation = job.generation, "Producer cancelled");
    }
    shared.finish(job.generation);
}

/// Join `handle`, giving up after `timeout`.
fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> Result<(), PlaybackError> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(PlaybackError::SyncTimeout(timeout));
        }
        thread::sleep(JOIN_POLL);
    }

    if handle.join().is_err() {
        error!("Producer thread panicked");
    }
    Ok(())
}
