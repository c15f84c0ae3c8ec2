//! Recording container access.
//!
//! Opens MCAP recordings, summarises their channels from the summary section
//! and exposes time-ranged, per-topic message iteration through the
//! [`MessageSource`] trait. Consumers never touch the file format directly.

use crate::config::ContainerConfig;
use crate::schema::{TextAnnotation, CALIBRATION_SCHEMAS, VIDEO_SCHEMAS};
use bytes::Bytes;
use memmap2::Mmap;
use prost::Message as _;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised while opening or reading a container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Failed to open container {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Container format error: {0}")]
    Format(#[from] mcap::McapError),

    #[error("Container has no summary section")]
    MissingSummary,
}

/// One message read from the container, detached from the file mapping.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub schema_name: String,
    /// Log time in nanoseconds
    pub log_time: u64,
    pub data: Bytes,
}

/// Iterator over messages of one read pass.
pub type MessageIter<'a> = Box<dyn Iterator<Item = Result<RawMessage, ContainerError>> + 'a>;

/// A source of time-ordered messages.
///
/// Every call to [`MessageSource::messages`] opens an independent read
/// cursor; callers that must not read concurrently serialise themselves.
pub trait MessageSource: Send + Sync {
    /// Iterate messages on `topics` with `start_ns <= log_time <= end_ns`.
    fn messages(
        &self,
        topics: &[String],
        start_ns: Option<u64>,
        end_ns: Option<u64>,
    ) -> Result<MessageIter<'_>, ContainerError>;
}

/// Topic and time-window predicate shared by all sources.
#[derive(Debug, Clone)]
pub(crate) struct MessageFilter {
    topics: HashSet<String>,
    start_ns: u64,
    end_ns: u64,
}

impl MessageFilter {
    pub(crate) fn new(topics: &[String], start_ns: Option<u64>, end_ns: Option<u64>) -> Self {
        Self {
            topics: topics.iter().cloned().collect(),
            start_ns: start_ns.unwrap_or(0),
            end_ns: end_ns.unwrap_or(u64::MAX),
        }
    }

    pub(crate) fn accepts(&self, topic: &str, log_time: u64) -> bool {
        log_time >= self.start_ns && log_time <= self.end_ns && self.topics.contains(topic)
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        end >= self.start_ns && start <= self.end_ns
    }
}

/// Classification of a channel by its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Video,
    Calibration,
    Other,
}

/// Rules used to classify channels and locate annotations.
#[derive(Debug, Clone)]
pub struct ClassifyRules {
    pub excluded_video_topics: Vec<String>,
    pub annotation_topic: String,
}

impl From<&ContainerConfig> for ClassifyRules {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            excluded_video_topics: config.excluded_video_topics.clone(),
            annotation_topic: config.annotation_topic.clone(),
        }
    }
}

impl Default for ClassifyRules {
    fn default() -> Self {
        Self::from(&ContainerConfig::default())
    }
}

impl ClassifyRules {
    pub fn classify(&self, schema_name: &str, topic: &str) -> ChannelKind {
        if VIDEO_SCHEMAS.contains(&schema_name) {
            if self.excluded_video_topics.iter().any(|t| t == topic) {
                ChannelKind::Other
            } else {
                ChannelKind::Video
            }
        } else if CALIBRATION_SCHEMAS.contains(&schema_name) {
            ChannelKind::Calibration
        } else {
            ChannelKind::Other
        }
    }
}

/// Per-channel counters as read from the summary section.
#[derive(Debug, Clone)]
pub struct ChannelStat {
    pub id: u16,
    pub topic: String,
    pub schema_name: String,
    pub message_count: u64,
}

/// A summarised channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub topic: String,
    pub message_count: u64,
    pub schema_name: String,
    pub fps: f64,
    pub kind: ChannelKind,
}

/// A pre-existing annotation stored in the recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub timestamp_ns: u64,
    pub text: String,
}

/// Recording-session metadata embedded in the container.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetadata {
    pub session_id: Option<String>,
    pub operator: Option<String>,
    pub station: Option<String>,
    pub instruction: Option<String>,
    /// All merged key/value pairs
    pub entries: BTreeMap<String, String>,
}

impl SessionMetadata {
    /// Map merged metadata records; `None` when the container has none.
    pub fn from_entries(entries: BTreeMap<String, String>) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }

        Some(Self {
            session_id: entries.get("session-metadata.session-uuid").cloned(),
            operator: entries.get("session-metadata.operator-id").cloned(),
            station: entries.get("session-metadata.station_id").cloned(),
            instruction: entries.get("session-metadata.instruction").cloned(),
            entries,
        })
    }
}

/// Summary of a recording, computed once at ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSummary {
    pub start_ns: u64,
    pub end_ns: u64,
    pub duration_sec: f64,
    pub channels: Vec<ChannelInfo>,
    pub video_topics: Vec<String>,
    pub calibration_topics: Vec<String>,
    pub video_fps: f64,
    pub video_frame_count: u64,
    pub annotations: Vec<Annotation>,
    pub metadata: Option<SessionMetadata>,
}

impl ContainerSummary {
    /// Build a summary from channel counters.
    ///
    /// `stats` must be in channel-id order; the nominal fps is taken from the
    /// last video channel.
    pub fn build(
        stats: &[ChannelStat],
        start_ns: u64,
        end_ns: u64,
        rules: &ClassifyRules,
        annotations: Vec<Annotation>,
        metadata: Option<SessionMetadata>,
    ) -> Self {
        let duration_sec = end_ns.saturating_sub(start_ns) as f64 / 1e9;

        let mut channels = Vec::with_capacity(stats.len());
        let mut video_topics = Vec::new();
        let mut calibration_topics = Vec::new();
        let mut video_fps = 0.0;
        let mut min_video_count: Option<u64> = None;

        for stat in stats {
            let fps = channel_fps(stat.message_count, duration_sec);
            let kind = rules.classify(&stat.schema_name, &stat.topic);
            info!(
                topic = %stat.topic,
                fps = fps,
                schema = %stat.schema_name,
                kind = ?kind,
                "Channel summarised"
            );

            match kind {
                ChannelKind::Video => {
                    video_topics.push(stat.topic.clone());
                    video_fps = fps;
                    min_video_count = Some(
                        min_video_count.map_or(stat.message_count, |m| m.min(stat.message_count)),
                    );
                }
                ChannelKind::Calibration => calibration_topics.push(stat.topic.clone()),
                ChannelKind::Other => {}
            }

            channels.push(ChannelInfo {
                topic: stat.topic.clone(),
                message_count: stat.message_count,
                schema_name: stat.schema_name.clone(),
                fps,
                kind,
            });
        }

        Self {
            start_ns,
            end_ns,
            duration_sec,
            channels,
            video_topics,
            calibration_topics,
            video_fps,
            video_frame_count: min_video_count.map_or(0, |m| m.saturating_sub(1)),
            annotations,
            metadata,
        }
    }
}

fn channel_fps(message_count: u64, duration_sec: f64) -> f64 {
    if message_count <= 1 || duration_sec <= 0.0 {
        return 0.0;
    }
    (message_count as f64 / duration_sec * 100.0).round() / 100.0
}

/// Read every annotation on `topic`. Failures degrade to what was read so far.
pub fn load_annotations(source: &dyn MessageSource, topic: &str) -> Vec<Annotation> {
    let mut annotations = Vec::new();
    let messages = match source.messages(&[topic.to_string()], None, None) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Failed to read annotations");
            return annotations;
        }
    };

    for message in messages {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Annotation read failed");
                break;
            }
        };
        match TextAnnotation::decode(message.data.as_ref()) {
            Ok(annotation) => {
                debug!(timestamp_ns = message.log_time, "Loaded annotation");
                annotations.push(Annotation {
                    timestamp_ns: message.log_time,
                    text: annotation.data,
                });
            }
            Err(e) => {
                warn!(timestamp_ns = message.log_time, error = %e, "Malformed annotation skipped");
            }
        }
    }

    annotations
}

/// A memory-mapped MCAP recording.
pub struct McapContainer {
    path: PathBuf,
    mmap: Mmap,
}

impl McapContainer {
    /// Map the recording at `path` for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ContainerError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| ContainerError::Open {
            path: path.clone(),
            source,
        })?;

        // The mapping is read-only and the recording is not modified while open.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| ContainerError::Open {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), bytes = mmap.len(), "Container opened");
        Ok(Self { path, mmap })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Summarise the recording from its summary section.
    pub fn summary(&self, rules: &ClassifyRules) -> Result<ContainerSummary, ContainerError> {
        let summary = mcap::Summary::read(&self.mmap)
            .map_err(|e| {
                error!(path = %self.path.display(), error = %e, "Unreadable container summary");
                ContainerError::from(e)
            })?
            .ok_or(ContainerError::MissingSummary)?;

        let (start_ns, end_ns, counts) = match &summary.stats {
            Some(stats) => (
                stats.message_start_time,
                stats.message_end_time,
                stats.channel_message_counts.clone(),
            ),
            None => {
                warn!(path = %self.path.display(), "Container has no statistics record");
                (0, 0, BTreeMap::new())
            }
        };

        let mut stats: Vec<ChannelStat> = summary
            .channels
            .iter()
            .map(|(id, channel)| ChannelStat {
                id: *id,
                topic: channel.topic.clone(),
                schema_name: channel
                    .schema
                    .as_ref()
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                message_count: counts.get(id).copied().unwrap_or(0),
            })
            .collect();
        stats.sort_by_key(|s| s.id);

        let mut entries = BTreeMap::new();
        for index in &summary.metadata_indexes {
            match mcap::read::metadata(&self.mmap, index) {
                Ok(record) => entries.extend(record.metadata),
                Err(e) => warn!(name = %index.name, error = %e, "Failed to read metadata record"),
            }
        }

        let annotations = load_annotations(self, &rules.annotation_topic);
        info!(count = annotations.len(), "Annotations loaded");

        Ok(ContainerSummary::build(
            &stats,
            start_ns,
            end_ns,
            rules,
            annotations,
            SessionMetadata::from_entries(entries),
        ))
    }
}

impl MessageSource for McapContainer {
    fn messages(
        &self,
        topics: &[String],
        start_ns: Option<u64>,
        end_ns: Option<u64>,
    ) -> Result<MessageIter<'_>, ContainerError> {
        let filter = MessageFilter::new(topics, start_ns, end_ns);
        let summary = mcap::Summary::read(&self.mmap)?;

        let summary = match summary {
            Some(summary) if !summary.chunk_indexes.is_empty() => summary,
            _ => {
                debug!(path = %self.path.display(), "No chunk index, reading linearly");
                let stream = mcap::MessageStream::new(&self.mmap)?;
                return Ok(Box::new(stream.filter_map(move |item| match item {
                    Ok(message) if filter.accepts(&message.channel.topic, message.log_time) => {
                        Some(Ok(raw_message(message)))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                })));
            }
        };

        let channel_ids: HashSet<u16> = summary
            .channels
            .iter()
            .filter(|(_, channel)| filter.topics.contains(&channel.topic))
            .map(|(id, _)| *id)
            .collect();

        let mut chunks: Vec<mcap::records::ChunkIndex> = summary
            .chunk_indexes
            .iter()
            .filter(|chunk| filter.overlaps(chunk.message_start_time, chunk.message_end_time))
            .filter(|chunk| {
                chunk.message_index_offsets.is_empty()
                    || chunk
                        .message_index_offsets
                        .keys()
                        .any(|id| channel_ids.contains(id))
            })
            .cloned()
            .collect();
        chunks.sort_by_key(|chunk| chunk.message_start_time);

        debug!(
            path = %self.path.display(),
            chunks = chunks.len(),
            topics = ?topics,
            "Chunked read planned"
        );

        Ok(Box::new(ChunkedMessages {
            mcap: &self.mmap,
            summary,
            chunks: chunks.into_iter().peekable(),
            pending: BinaryHeap::new(),
            errors: VecDeque::new(),
            loaded: 0,
            filter,
        }))
    }
}

fn raw_message(message: mcap::Message<'_>) -> RawMessage {
    RawMessage {
        topic: message.channel.topic.clone(),
        schema_name: message
            .channel
            .schema
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default(),
        log_time: message.log_time,
        data: Bytes::from(message.data.into_owned()),
    }
}

/// Chunk-indexed reader yielding messages in log-time order.
///
/// Chunks are planned by start time. A chunk is decoded once the earliest
/// pending message is not older than its start, so overlapping chunks are
/// merged.
struct ChunkedMessages<'a> {
    mcap: &'a [u8],
    summary: mcap::Summary<'a>,
    chunks: std::iter::Peekable<std::vec::IntoIter<mcap::records::ChunkIndex>>,
    pending: BinaryHeap<Reverse<Pending>>,
    errors: VecDeque<ContainerError>,
    loaded: u64,
    filter: MessageFilter,
}

/// A decoded message waiting to be yielded; ties keep decode order.
struct Pending {
    log_time: u64,
    sequence: u64,
    message: RawMessage,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.log_time, self.sequence).cmp(&(other.log_time, other.sequence))
    }
}

impl ChunkedMessages<'_> {
    fn load_chunk(&mut self, index: &mcap::records::ChunkIndex) -> Result<(), ContainerError> {
        for message in self.summary.stream_chunk(self.mcap, index)? {
            match message {
                Ok(message) if self.filter.accepts(&message.channel.topic, message.log_time) => {
                    self.loaded += 1;
                    self.pending.push(Reverse(Pending {
                        log_time: message.log_time,
                        sequence: self.loaded,
                        message: raw_message(message),
                    }));
                }
                Ok(_) => {}
                Err(e) => self.errors.push_back(e.into()),
            }
        }
        Ok(())
    }

    /// Whether the next planned chunk may hold a message due before the pending ones.
    fn next_chunk_due(&mut self) -> bool {
        let earliest = self.pending.peek().map(|Reverse(p)| p.log_time);
        match (self.chunks.peek(), earliest) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(chunk), Some(earliest)) => chunk.message_start_time <= earliest,
        }
    }
}

impl Iterator for ChunkedMessages<'_> {
    type Item = Result<RawMessage, ContainerError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_chunk_due() {
            let index = self.chunks.next()?;
            if let Err(e) = self.load_chunk(&index) {
                self.errors.push_back(e);
            }
        }
        if let Some(e) = self.errors.pop_front() {
            return Some(Err(e));
        }
        self.pending.pop().map(|Reverse(p)| Ok(p.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{COMPRESSED_VIDEO, RAW_IMAGE};
    use crate::test_support::MemorySource;
    use std::borrow::Cow;
    use std::io::{BufWriter, Write};
    use std::sync::Arc;

    /// `(topic, schema, log_time, payload)`
    type Entry = (&'static str, &'static str, u64, Vec<u8>);

    /// Write `chunks` to an MCAP file, closing a chunk after each group.
    fn write_recording(
        path: &Path,
        use_chunks: bool,
        chunks: &[Vec<Entry>],
        metadata: &[(&str, &str)],
    ) {
        let file = BufWriter::new(File::create(path).unwrap());
        let mut writer = mcap::WriteOptions::new()
            .compression(None)
            .chunk_size(None)
            .use_chunks(use_chunks)
            .create(file)
            .unwrap();

        let mut sequence = 0;
        for chunk in chunks {
            for (topic, schema, log_time, data) in chunk {
                let channel = Arc::new(mcap::Channel {
                    topic: topic.to_string(),
                    schema: Some(Arc::new(mcap::Schema {
                        name: schema.to_string(),
                        encoding: "protobuf".to_string(),
                        data: Cow::Owned(Vec::new()),
                    })),
                    message_encoding: "protobuf".to_string(),
                    metadata: BTreeMap::new(),
                });
                sequence += 1;
                writer
                    .write(&mcap::Message {
                        channel,
                        sequence,
                        log_time: *log_time,
                        publish_time: *log_time,
                        data: Cow::Owned(data.clone()),
                    })
                    .unwrap();
            }
            writer.flush().unwrap();
        }

        if !metadata.is_empty() {
            writer
                .write_metadata(&mcap::records::Metadata {
                    name: "session-metadata".to_string(),
                    metadata: metadata
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                })
                .unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_all(
        container: &McapContainer,
        topics: &[&str],
        start_ns: Option<u64>,
        end_ns: Option<u64>,
    ) -> Vec<(String, u64)> {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        container
            .messages(&topics, start_ns, end_ns)
            .unwrap()
            .map(|m| {
                let m = m.unwrap();
                (m.topic, m.log_time)
            })
            .collect()
    }

    fn stat(id: u16, topic: &str, schema: &str, count: u64) -> ChannelStat {
        ChannelStat {
            id,
            topic: topic.to_string(),
            schema_name: schema.to_string(),
            message_count: count,
        }
    }

    fn message(topic: &str, log_time: u64, data: Vec<u8>) -> RawMessage {
        RawMessage {
            topic: topic.to_string(),
            schema_name: "test".to_string(),
            log_time,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn test_classification() {
        let rules = ClassifyRules::default();
        assert_eq!(rules.classify(RAW_IMAGE, "/camera/front"), ChannelKind::Video);
        assert_eq!(rules.classify(COMPRESSED_VIDEO, "/camera/rear"), ChannelKind::Video);
        assert_eq!(rules.classify(RAW_IMAGE, "/camera/depth/depth"), ChannelKind::Other);
        assert_eq!(
            rules.classify("robot_data.CameraParameters", "/camera/params"),
            ChannelKind::Calibration
        );
        assert_eq!(rules.classify("foxglove.Log", "/log"), ChannelKind::Other);
    }

    #[test]
    fn test_summary_counts_and_fps() {
        let stats = vec![
            stat(1, "/camera/front", RAW_IMAGE, 300),
            stat(2, "/camera/rear", COMPRESSED_VIDEO, 290),
            stat(3, "/camera/depth/depth", RAW_IMAGE, 100),
            stat(4, "/camera/calib", "foxglove.CameraCalibration", 1),
            stat(5, "/imu", "robot_data.Imu", 1000),
        ];
        let summary = ContainerSummary::build(
            &stats,
            1_000_000_000,
            11_000_000_000,
            &ClassifyRules::default(),
            Vec::new(),
            None,
        );

        assert_eq!(summary.duration_sec, 10.0);
        assert_eq!(summary.video_topics, vec!["/camera/front", "/camera/rear"]);
        assert_eq!(summary.calibration_topics, vec!["/camera/calib"]);
        assert_eq!(summary.video_frame_count, 289);
        assert_eq!(summary.video_fps, 29.0);
        assert_eq!(summary.channels[0].fps, 30.0);
        // a single message has no rate
        assert_eq!(summary.channels[3].fps, 0.0);
        assert_eq!(summary.channels[4].kind, ChannelKind::Other);
    }

    #[test]
    fn test_summary_without_video_or_duration() {
        let stats = vec![stat(1, "/imu", "robot_data.Imu", 5)];
        let summary =
            ContainerSummary::build(&stats, 5, 5, &ClassifyRules::default(), Vec::new(), None);
        assert_eq!(summary.video_frame_count, 0);
        assert_eq!(summary.channels[0].fps, 0.0);
        assert!(summary.video_topics.is_empty());
    }

    #[test]
    fn test_metadata_mapping() {
        let mut entries = BTreeMap::new();
        entries.insert("session-metadata.session-uuid".to_string(), "abc".to_string());
        entries.insert("session-metadata.operator-id".to_string(), "op-7".to_string());
        entries.insert("session-metadata.instruction".to_string(), "pick cup".to_string());
        entries.insert("other".to_string(), "x".to_string());

        let metadata = SessionMetadata::from_entries(entries).unwrap();
        assert_eq!(metadata.session_id.as_deref(), Some("abc"));
        assert_eq!(metadata.operator.as_deref(), Some("op-7"));
        assert_eq!(metadata.station, None);
        assert_eq!(metadata.instruction.as_deref(), Some("pick cup"));
        assert_eq!(metadata.entries.len(), 4);

        assert!(SessionMetadata::from_entries(BTreeMap::new()).is_none());
    }

    #[test]
    fn test_load_annotations_skips_malformed() {
        let good = TextAnnotation {
            data: "grasp".to_string(),
        }
        .encode_to_vec();
        let source = MemorySource::new(vec![
            message("/subtask-annotation", 20, good),
            message("/subtask-annotation", 30, vec![0xff, 0xff, 0xff]),
            message("/camera/front", 25, vec![1, 2, 3]),
        ]);

        let annotations = load_annotations(&source, "/subtask-annotation");
        assert_eq!(
            annotations,
            vec![Annotation {
                timestamp_ns: 20,
                text: "grasp".to_string()
            }]
        );
    }

    #[test]
    fn test_load_annotations_open_failure_is_empty() {
        let source = MemorySource::new(Vec::new());
        source.fail_next_reads(1);
        assert!(load_annotations(&source, "/subtask-annotation").is_empty());
    }

    #[test]
    fn test_memory_source_filters_topic_and_window() {
        let source = MemorySource::new(vec![
            message("/a", 30, vec![]),
            message("/a", 10, vec![]),
            message("/b", 20, vec![]),
            message("/a", 50, vec![]),
        ]);

        let times: Vec<u64> = source
            .messages(&["/a".to_string()], Some(10), Some(30))
            .unwrap()
            .map(|m| m.unwrap().log_time)
            .collect();
        assert_eq!(times, vec![10, 30]);
        assert_eq!(source.reads_opened(), 1);
    }

    #[test]
    fn test_recording_summary() {
        const MS: u64 = 1_000_000;
        let annotation = |text: &str| TextAnnotation { data: text.to_string() }.encode_to_vec();

        let mut entries: Vec<Entry> = Vec::new();
        for i in 0..30 {
            entries.push(("/camera/front", RAW_IMAGE, i * 33 * MS, vec![]));
            entries.push(("/camera/depth/depth", RAW_IMAGE, i * 33 * MS, vec![]));
        }
        entries.push(("/camera/calib", "foxglove.CameraCalibration", 0, vec![]));
        for i in 0..29 {
            entries.push(("/camera/rear", COMPRESSED_VIDEO, i * 33 * MS + MS, vec![]));
        }
        entries.push(("/subtask-annotation", "foxglove.TextAnnotation", 100 * MS, annotation("reach")));
        entries.push(("/subtask-annotation", "foxglove.TextAnnotation", 500 * MS, annotation("place")));
        // stable: channel ids follow first appearance
        entries.sort_by_key(|e| e.2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.mcap");
        write_recording(
            &path,
            true,
            &[entries],
            &[
                ("session-metadata.session-uuid", "uuid-1"),
                ("session-metadata.operator-id", "op-3"),
                ("session-metadata.station_id", "st-9"),
            ],
        );

        let container = McapContainer::open(&path).unwrap();
        let summary = container.summary(&ClassifyRules::default()).unwrap();

        assert_eq!(summary.start_ns, 0);
        assert_eq!(summary.end_ns, 29 * 33 * MS);
        let topics: Vec<&str> = summary.channels.iter().map(|c| c.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "/camera/front",
                "/camera/depth/depth",
                "/camera/calib",
                "/camera/rear",
                "/subtask-annotation"
            ]
        );
        assert_eq!(summary.video_topics, vec!["/camera/front", "/camera/rear"]);
        assert_eq!(summary.calibration_topics, vec!["/camera/calib"]);
        assert_eq!(summary.channels[1].kind, ChannelKind::Other);
        assert_eq!(summary.channels[0].message_count, 30);
        assert_eq!(summary.channels[0].fps, channel_fps(30, summary.duration_sec));
        assert_eq!(summary.video_fps, summary.channels[3].fps);
        assert_eq!(summary.video_frame_count, 28);

        let texts: Vec<&str> = summary.annotations.iter().map(|a| a.text.as_str()).collect();
        assert_eq!(texts, vec!["reach", "place"]);
        assert_eq!(summary.annotations[1].timestamp_ns, 500 * MS);

        let metadata = summary.metadata.unwrap();
        assert_eq!(metadata.session_id.as_deref(), Some("uuid-1"));
        assert_eq!(metadata.operator.as_deref(), Some("op-3"));
        assert_eq!(metadata.station.as_deref(), Some("st-9"));
        assert_eq!(metadata.instruction, None);
    }

    #[test]
    fn test_chunked_reads_filter_window_and_topic() {
        let chunks: Vec<Vec<Entry>> = (0..5u64)
            .map(|chunk| {
                (chunk * 10..chunk * 10 + 10)
                    .flat_map(|i| {
                        vec![
                            ("/cam/a", RAW_IMAGE, i * 10, vec![]),
                            ("/cam/b", RAW_IMAGE, i * 10 + 5, vec![]),
                        ]
                    })
                    .collect()
            })
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunked.mcap");
        write_recording(&path, true, &chunks, &[]);
        let container = McapContainer::open(&path).unwrap();

        let read = read_all(&container, &["/cam/a"], Some(120), Some(340));
        let expected: Vec<(String, u64)> = (12..=34).map(|i| ("/cam/a".to_string(), i * 10)).collect();
        assert_eq!(read, expected);

        let everything = read_all(&container, &["/cam/a", "/cam/b"], None, None);
        assert_eq!(everything.len(), 100);
        assert!(everything.windows(2).all(|w| w[0].1 < w[1].1));

        assert!(read_all(&container, &["/cam/c"], None, None).is_empty());
    }

    #[test]
    fn test_overlapping_chunks_merge_in_time_order() {
        const MS: u64 = 1_000_000;
        let chunks = vec![
            vec![
                ("/cam/a", RAW_IMAGE, 0, vec![]),
                ("/cam/a", RAW_IMAGE, 33 * MS, vec![]),
            ],
            vec![
                ("/cam/b", RAW_IMAGE, MS, vec![]),
                ("/cam/b", RAW_IMAGE, 34 * MS, vec![]),
            ],
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlap.mcap");
        write_recording(&path, true, &chunks, &[]);
        let container = McapContainer::open(&path).unwrap();

        let read = read_all(&container, &["/cam/a", "/cam/b"], None, None);
        assert_eq!(
            read,
            vec![
                ("/cam/a".to_string(), 0),
                ("/cam/b".to_string(), MS),
                ("/cam/a".to_string(), 33 * MS),
                ("/cam/b".to_string(), 34 * MS),
            ]
        );
    }

    #[test]
    fn test_unchunked_recording_reads_linearly() {
        let entries: Vec<Entry> = (0..20u64)
            .map(|i| {
                let topic = if i % 2 == 0 { "/cam/a" } else { "/cam/b" };
                (topic, RAW_IMAGE, i * 10, vec![i as u8])
            })
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.mcap");
        write_recording(&path, false, &[entries], &[]);
        let container = McapContainer::open(&path).unwrap();

        let read = read_all(&container, &["/cam/b"], Some(50), Some(150));
        let times: Vec<u64> = read.iter().map(|(_, t)| *t).collect();
        assert_eq!(times, vec![50, 70, 90, 110, 130, 150]);

        let first = container
            .messages(&["/cam/a".to_string()], None, None)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(first.schema_name, RAW_IMAGE);
        assert_eq!(first.data.as_ref(), &[0]);
    }

    #[test]
    fn test_recording_without_summary_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.mcap");

        // magic, footer record pointing at no summary, magic
        let mut bytes = mcap::MAGIC.to_vec();
        bytes.push(0x02);
        bytes.extend_from_slice(&20u64.to_le_bytes());
        bytes.extend_from_slice(&[0; 20]);
        bytes.extend_from_slice(mcap::MAGIC);
        File::create(&path).unwrap().write_all(&bytes).unwrap();

        let container = McapContainer::open(&path).unwrap();
        assert!(matches!(
            container.summary(&ClassifyRules::default()),
            Err(ContainerError::MissingSummary)
        ));
    }

    #[test]
    fn test_open_missing_file() {
        let result = McapContainer::open("/nonexistent/recording.mcap");
        assert!(matches!(result, Err(ContainerError::Open { .. })));
    }
}
