//! Fixtures shared by unit tests.

use crate::config::CacheConfig;
use crate::container::{
    ChannelStat, ClassifyRules, ContainerError, ContainerSummary, MessageFilter, MessageIter,
    MessageSource, RawMessage,
};
use crate::player::PlaybackSettings;
use crate::schema::{RawImage, RAW_IMAGE};
use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const FRAME_INTERVAL_NS: u64 = 33_000_000;

/// A 1x1 mono8 image whose single pixel is `value`.
pub fn mono_image(value: u8) -> Bytes {
    let image = RawImage {
        width: 1,
        height: 1,
        encoding: "mono8".to_string(),
        step: 1,
        data: vec![value],
        ..Default::default()
    };
    Bytes::from(image.encode_to_vec())
}

pub fn image_message(topic: &str, log_time: u64, value: u8) -> RawMessage {
    RawMessage {
        topic: topic.to_string(),
        schema_name: RAW_IMAGE.to_string(),
        log_time,
        data: mono_image(value),
    }
}

/// `count` frames on one topic at 30 fps.
pub fn single_topic(topic: &str, count: u64) -> Vec<RawMessage> {
    (0..count)
        .map(|i| image_message(topic, i * FRAME_INTERVAL_NS, (i % 251) as u8))
        .collect()
}

pub fn summary_for(messages: &[RawMessage]) -> ContainerSummary {
    let mut stats: Vec<ChannelStat> = Vec::new();
    for message in messages {
        match stats.iter_mut().find(|s| s.topic == message.topic) {
            Some(stat) => stat.message_count += 1,
            None => stats.push(ChannelStat {
                id: stats.len() as u16,
                topic: message.topic.clone(),
                schema_name: message.schema_name.clone(),
                message_count: 1,
            }),
        }
    }
    let start = messages.iter().map(|m| m.log_time).min().unwrap_or(0);
    let end = messages.iter().map(|m| m.log_time).max().unwrap_or(0);
    ContainerSummary::build(&stats, start, end, &ClassifyRules::default(), Vec::new(), None)
}

pub fn source_with(messages: Vec<RawMessage>) -> (MemorySource, ContainerSummary) {
    let summary = summary_for(&messages);
    (MemorySource::new(messages), summary)
}

/// Playback settings with short waits.
pub fn fast_settings(max_cache_count: usize, eviction_ratio: f64) -> PlaybackSettings {
    let config = CacheConfig {
        max_cache_count,
        eviction_ratio,
        poll_interval_ms: 2,
        join_timeout_ms: 1000,
        frame_wait_timeout_ms: 5000,
        ..CacheConfig::default()
    };
    PlaybackSettings::from(&config)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// An in-memory message source with read accounting and failure injection.
#[derive(Default)]
pub struct MemorySource {
    messages: Vec<RawMessage>,
    read_delay: Option<Duration>,
    reads_opened: AtomicUsize,
    active_reads: AtomicUsize,
    max_active_reads: AtomicUsize,
    failing_reads: Mutex<usize>,
}

impl MemorySource {
    pub fn new(mut messages: Vec<RawMessage>) -> Self {
        messages.sort_by_key(|m| m.log_time);
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Sleep before yielding each message, simulating slow storage.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Make the next `count` reads fail to open.
    pub fn fail_next_reads(&self, count: usize) {
        *self.failing_reads.lock() = count;
    }

    pub fn reads_opened(&self) -> usize {
        self.reads_opened.load(Ordering::SeqCst)
    }

    /// Highest number of read passes that were open at the same time.
    pub fn max_concurrent_reads(&self) -> usize {
        self.max_active_reads.load(Ordering::SeqCst)
    }
}

struct TrackedRead<'a, I> {
    inner: I,
    active: &'a AtomicUsize,
}

impl<I: Iterator> Iterator for TrackedRead<'_, I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl<I> Drop for TrackedRead<'_, I> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MessageSource for MemorySource {
    fn messages(
        &self,
        topics: &[String],
        start_ns: Option<u64>,
        end_ns: Option<u64>,
    ) -> Result<MessageIter<'_>, ContainerError> {
        {
            let mut failing = self.failing_reads.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(ContainerError::MissingSummary);
            }
        }
        self.reads_opened.fetch_add(1, Ordering::SeqCst);
        let active = self.active_reads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_reads.fetch_max(active, Ordering::SeqCst);

        let filter = MessageFilter::new(topics, start_ns, end_ns);
        let delay = self.read_delay;
        let inner = self
            .messages
            .iter()
            .filter(move |m| filter.accepts(&m.topic, m.log_time))
            .map(move |m| {
                if let Some(delay) = delay {
                    std::thread::sleep(delay);
                }
                Ok(m.clone())
            });
        Ok(Box::new(TrackedRead {
            inner,
            active: &self.active_reads,
        }))
    }
}
