//! Live frame streaming to remote subscribers.
//!
//! A [`StreamDispatcher`] belongs to one connection and runs one task per
//! subscribed topic. Each task re-reads the recording for its topic, decodes
//! and JPEG-encodes frames on a blocking worker, and paces them out at the
//! requested rate through the connection's outbound queue. Streaming never
//! touches the playback cache.

use crate::config::StreamingConfig;
use crate::container::{ContainerError, MessageSource};
use crate::decoder::FrameDecoder;
use crate::encoder::{EncodedFrame, FrameEncoder};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Outbound channel closed")]
    Closed,

    #[error("Invalid control message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}

/// Control messages sent by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartStream {
        topic: String,
        #[serde(default)]
        fps: Option<f64>,
        #[serde(default)]
        max_frames: Option<u64>,
        #[serde(default)]
        max_duration_seconds: Option<f64>,
    },
    StopStream {
        #[serde(default)]
        topic: Option<String>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Why a stream ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteReason {
    MaxFrames,
    MaxDuration,
    EndOfStream,
}

/// Messages sent to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Frame {
        topic: String,
        frame_index: u64,
        /// Log time in nanoseconds
        timestamp: u64,
        #[serde(with = "base64_serde")]
        data: Bytes,
        shape: [usize; 3],
        encoding: String,
    },
    Started {
        topic: String,
        fps: f64,
    },
    Stopped {
        topic: String,
        frames_sent: u64,
    },
    Complete {
        topic: String,
        frames_sent: u64,
        reason: CompleteReason,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(topic: Option<&str>, message: impl Into<String>) -> Self {
        Self::Error {
            topic: topic.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Streaming limits shared by every task of a dispatcher.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub default_fps: f64,
    pub max_fps: f64,
    pub max_frames: u64,
    pub duration_check_interval: u64,
    pub prefetch_frames: usize,
    pub stop_timeout: Duration,
    pub encoder: FrameEncoder,
}

impl From<&StreamingConfig> for StreamSettings {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            default_fps: config.default_fps,
            max_fps: config.max_fps,
            max_frames: config.default_max_frames,
            duration_check_interval: config.duration_check_interval.max(1),
            prefetch_frames: config.prefetch_frames.max(1),
            stop_timeout: config.stop_timeout(),
            encoder: FrameEncoder::from(config),
        }
    }
}

/// A validated subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub topic: String,
    pub fps: f64,
    pub max_frames: u64,
    pub max_duration: Option<Duration>,
}

impl StreamRequest {
    /// Apply defaults and limits to a subscriber's request.
    pub fn resolve(
        settings: &StreamSettings,
        topic: String,
        fps: Option<f64>,
        max_frames: Option<u64>,
        max_duration_seconds: Option<f64>,
    ) -> Self {
        let fps = match fps {
            Some(fps) if fps.is_finite() && fps > 0.0 => fps.min(settings.max_fps),
            _ => settings.default_fps,
        };

        Self {
            topic,
            fps,
            max_frames: max_frames.unwrap_or(settings.max_frames).min(settings.max_frames),
            max_duration: max_duration_seconds
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(Duration::from_secs_f64),
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

struct StreamTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything a stream task needs, cloned per task.
#[derive(Clone)]
struct StreamContext {
    source: Arc<dyn MessageSource>,
    decoder: Arc<FrameDecoder>,
    settings: StreamSettings,
    outbound: mpsc::Sender<ServerMessage>,
}

/// Per-connection set of topic streams.
pub struct StreamDispatcher {
    context: StreamContext,
    cancel: CancellationToken,
    tasks: HashMap<String, StreamTask>,
}

impl StreamDispatcher {
    /// `cancel` is the connection's token; every stream runs on a child of it.
    pub fn new(
        source: Arc<dyn MessageSource>,
        decoder: Arc<FrameDecoder>,
        settings: StreamSettings,
        outbound: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context: StreamContext {
                source,
                decoder,
                settings,
                outbound,
            },
            cancel,
            tasks: HashMap::new(),
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::StartStream {
                topic,
                fps,
                max_frames,
                max_duration_seconds,
            } => {
                let request = StreamRequest::resolve(
                    &self.context.settings,
                    topic,
                    fps,
                    max_frames,
                    max_duration_seconds,
                );
                self.start_stream(request).await;
            }
            ClientMessage::StopStream { topic } => self.stop_stream(topic.as_deref()).await,
        }
    }

    /// Start streaming a topic, replacing any stream already running for it.
    pub async fn start_stream(&mut self, request: StreamRequest) {
        self.tasks.retain(|_, task| !task.handle.is_finished());
        if let Some(task) = self.tasks.remove(&request.topic) {
            debug!(topic = %request.topic, "Replacing running stream");
            stop_task(&request.topic, task, self.context.settings.stop_timeout).await;
        }

        info!(
            topic = %request.topic,
            fps = request.fps,
            max_frames = request.max_frames,
            max_duration = ?request.max_duration,
            "Starting stream"
        );

        let cancel = self.cancel.child_token();
        let topic = request.topic.clone();
        let handle = tokio::spawn(run_stream(self.context.clone(), request, cancel.clone()));
        self.tasks.insert(topic, StreamTask { cancel, handle });
    }

    /// Stop one topic, or every topic when `topic` is `None`.
    pub async fn stop_stream(&mut self, topic: Option<&str>) {
        let timeout = self.context.settings.stop_timeout;
        match topic {
            Some(topic) => match self.tasks.remove(topic) {
                Some(task) => stop_task(topic, task, timeout).await,
                None => debug!(topic = %topic, "No stream to stop"),
            },
            None => {
                for (topic, task) in self.tasks.drain() {
                    stop_task(&topic, task, timeout).await;
                }
            }
        }
    }

    /// Topics with a running stream.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .tasks
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    pub async fn shutdown(&mut self) {
        self.stop_stream(None).await;
    }
}

async fn stop_task(topic: &str, mut task: StreamTask, timeout: Duration) {
    task.cancel.cancel();
    if tokio::time::timeout(timeout, &mut task.handle).await.is_err() {
        warn!(topic = %topic, timeout = ?timeout, "Stream task did not stop in time, aborting");
        task.handle.abort();
    }
}

/// A frame produced by the worker.
struct StreamedFrame {
    frame_index: u64,
    timestamp_ns: u64,
    frame: EncodedFrame,
}

enum Outcome {
    Complete(CompleteReason),
    Cancelled,
    Failed(String),
    Disconnected,
}

async fn run_stream(context: StreamContext, request: StreamRequest, cancel: CancellationToken) {
    let topic = request.topic.clone();
    let (tx, mut rx) = mpsc::channel(context.settings.prefetch_frames);

    let worker = {
        let source = context.source.clone();
        let decoder = context.decoder.clone();
        let encoder = context.settings.encoder.clone();
        let topic = topic.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            produce_frames(source.as_ref(), &decoder, &encoder, &topic, tx, &cancel)
        })
    };

    let started = ServerMessage::Started {
        topic: topic.clone(),
        fps: request.fps,
    };
    let Paced {
        frames_sent,
        outcome,
    } = tokio::select! {
        _ = cancel.cancelled() => Paced {
            frames_sent: 0,
            outcome: Outcome::Cancelled,
        },
        sent = context.outbound.send(started) => match sent {
            Ok(()) => pace_frames(&context, &request, &mut rx, &cancel).await,
            Err(_) => Paced {
                frames_sent: 0,
                outcome: Outcome::Disconnected,
            },
        },
    };

    // dropping the receiver stops the worker
    drop(rx);
    if let Err(e) = worker.await {
        error!(topic = %topic, error = %e, "Stream worker panicked");
    }

    let closing = match outcome {
        Outcome::Complete(reason) => {
            info!(topic = %topic, frames_sent = frames_sent, reason = ?reason, "Stream complete");
            Some(ServerMessage::Complete {
                topic: topic.clone(),
                frames_sent,
                reason,
            })
        }
        Outcome::Cancelled => {
            info!(topic = %topic, frames_sent = frames_sent, "Stream stopped");
            Some(ServerMessage::Stopped {
                topic: topic.clone(),
                frames_sent,
            })
        }
        Outcome::Failed(message) => Some(ServerMessage::error(Some(&topic), message)),
        Outcome::Disconnected => {
            debug!(topic = %topic, error = %TransportError::Closed, "Subscriber gone, cleaning up");
            None
        }
    };

    if let Some(message) = closing {
        deliver_closing(&context, &topic, message, &cancel).await;
    }
}

/// Send the final status. Once cancelled, waiting on a full queue is bounded
/// by half the stop timeout.
async fn deliver_closing(
    context: &StreamContext,
    topic: &str,
    message: ServerMessage,
    cancel: &CancellationToken,
) {
    let send = context.outbound.send(message);
    tokio::pin!(send);

    let sent = tokio::select! {
        sent = &mut send => Some(sent),
        _ = cancel.cancelled() => None,
    };
    let sent = match sent {
        Some(sent) => sent,
        None => match tokio::time::timeout(context.settings.stop_timeout / 2, &mut send).await {
            Ok(sent) => sent,
            Err(_) => {
                warn!(topic = %topic, "Outbound queue full, final stream status dropped");
                return;
            }
        },
    };
    if sent.is_err() {
        debug!(topic = %topic, "Could not deliver final stream status");
    }
}

struct Paced {
    frames_sent: u64,
    outcome: Outcome,
}

async fn pace_frames(
    context: &StreamContext,
    request: &StreamRequest,
    rx: &mut mpsc::Receiver<Result<StreamedFrame, ContainerError>>,
    cancel: &CancellationToken,
) -> Paced {
    let interval = request.frame_interval();
    let check_every = context.settings.duration_check_interval;
    let started = Instant::now();
    let mut frames_sent = 0u64;

    let outcome = loop {
        if frames_sent >= request.max_frames {
            break Outcome::Complete(CompleteReason::MaxFrames);
        }
        if let Some(max_duration) = request.max_duration {
            if frames_sent > 0 && frames_sent % check_every == 0 && started.elapsed() >= max_duration {
                break Outcome::Complete(CompleteReason::MaxDuration);
            }
        }

        let tick = Instant::now();
        let next = tokio::select! {
            _ = cancel.cancelled() => break Outcome::Cancelled,
            next = rx.recv() => next,
        };

        let streamed = match next {
            Some(Ok(streamed)) => streamed,
            Some(Err(e)) => break Outcome::Failed(format!("Failed to read recording: {}", e)),
            None => break Outcome::Complete(CompleteReason::EndOfStream),
        };

        let shape = streamed.frame.shape();
        let message = ServerMessage::Frame {
            topic: request.topic.clone(),
            frame_index: streamed.frame_index,
            timestamp: streamed.timestamp_ns,
            data: streamed.frame.data,
            shape,
            encoding: "jpeg".to_string(),
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => break Outcome::Cancelled,
            sent = context.outbound.send(message) => sent,
        };
        if sent.is_err() {
            break Outcome::Disconnected;
        }
        frames_sent += 1;

        let elapsed = tick.elapsed();
        if elapsed < interval {
            tokio::select! {
                _ = cancel.cancelled() => break Outcome::Cancelled,
                _ = tokio::time::sleep(interval - elapsed) => {}
            }
        }
    };

    Paced {
        frames_sent,
        outcome,
    }
}

/// Read, decode and encode one topic into `tx` until the receiver goes away.
fn produce_frames(
    source: &dyn MessageSource,
    decoder: &FrameDecoder,
    encoder: &FrameEncoder,
    topic: &str,
    tx: mpsc::Sender<Result<StreamedFrame, ContainerError>>,
    cancel: &CancellationToken,
) {
    let messages = match source.messages(&[topic.to_string()], None, None) {
        Ok(messages) => messages,
        Err(e) => {
            error!(topic = %topic, error = %e, "Failed to open stream read pass");
            let _ = tx.blocking_send(Err(e));
            return;
        }
    };

    for (ordinal, message) in messages.enumerate() {
        if cancel.is_cancelled() || tx.is_closed() {
            break;
        }

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Skipping unreadable message");
                continue;
            }
        };

        let Some(frame) = decoder.decode(&message.schema_name, &message.data) else {
            continue;
        };
        let encoded = match encoder.encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(topic = %topic, frame_index = ordinal, error = %e, "Frame dropped");
                continue;
            }
        };

        let streamed = StreamedFrame {
            frame_index: ordinal as u64,
            timestamp_ns: message.log_time,
            frame: encoded,
        };
        if tx.blocking_send(Ok(streamed)).is_err() {
            break;
        }
    }
}
