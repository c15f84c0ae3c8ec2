//! Configuration management for the replay engine.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the replay engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Frame cache and producer configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Container reading and decoding configuration
    #[serde(default)]
    pub container: ContainerConfig,

    /// Live streaming configuration
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// HTTP/websocket listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bounded frame cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of frame groups held in memory
    #[serde(default = "default_max_cache_count")]
    pub max_cache_count: usize,

    /// Share of the capacity evicted per steady-state trim
    #[serde(default = "default_eviction_ratio")]
    pub eviction_ratio: f64,

    /// Timestamp window (milliseconds) for frames considered simultaneous
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: f64,

    /// Poll interval for the producer while the cache is full
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bounded wait for a cancelled producer to exit
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,

    /// Maximum time a playback caller waits for a frame to be produced
    #[serde(default = "default_frame_wait_timeout_ms")]
    pub frame_wait_timeout_ms: u64,
}

/// Container classification and decoding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerConfig {
    /// Video-schema topics that are never treated as video (e.g. depth)
    #[serde(default = "default_excluded_video_topics")]
    pub excluded_video_topics: Vec<String>,

    /// Topic holding pre-existing text annotations
    #[serde(default = "default_annotation_topic")]
    pub annotation_topic: String,

    /// Maximum time to wait for the H.264 decoder to emit a frame
    #[serde(default = "default_h264_timeout_ms")]
    pub h264_timeout_ms: u64,
}

/// Live streaming configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Frame rate used when a subscriber does not ask for one
    #[serde(default = "default_stream_fps")]
    pub default_fps: f64,

    /// Highest frame rate a subscriber may request
    #[serde(default = "default_max_fps")]
    pub max_fps: f64,

    /// Frame cap used when a subscriber does not set one
    #[serde(default = "default_max_frames")]
    pub default_max_frames: u64,

    /// JPEG quality for streamed frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Raw frames larger than this are downscaled before encoding
    #[serde(default = "default_downscale_above_bytes")]
    pub downscale_above_bytes: usize,

    /// Raw frames larger than this are dropped
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Number of sent frames between max-duration checks
    #[serde(default = "default_duration_check_interval")]
    pub duration_check_interval: u64,

    /// Decoded frames buffered ahead of the sender
    #[serde(default = "default_prefetch_frames")]
    pub prefetch_frames: usize,

    /// Outbound message queue size per connection
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Bounded wait for a cancelled stream task
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

/// HTTP/websocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_max_cache_count() -> usize {
    300
}
fn default_eviction_ratio() -> f64 {
    0.3
}
fn default_tolerance_ms() -> f64 {
    3.0
}
fn default_poll_interval_ms() -> u64 {
    20
}
fn default_join_timeout_ms() -> u64 {
    1000
}
fn default_frame_wait_timeout_ms() -> u64 {
    30_000
}
fn default_excluded_video_topics() -> Vec<String> {
    vec!["/camera/depth/depth".to_string()]
}
fn default_annotation_topic() -> String {
    "/subtask-annotation".to_string()
}
fn default_h264_timeout_ms() -> u64 {
    500
}
fn default_stream_fps() -> f64 {
    10.0
}
fn default_max_fps() -> f64 {
    60.0
}
fn default_max_frames() -> u64 {
    100_000
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_downscale_above_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_duration_check_interval() -> u64 {
    10
}
fn default_prefetch_frames() -> usize {
    4
}
fn default_outbound_queue() -> usize {
    32
}
fn default_stop_timeout_ms() -> u64 {
    1000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_count: default_max_cache_count(),
            eviction_ratio: default_eviction_ratio(),
            tolerance_ms: default_tolerance_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
            frame_wait_timeout_ms: default_frame_wait_timeout_ms(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            excluded_video_topics: default_excluded_video_topics(),
            annotation_topic: default_annotation_topic(),
            h264_timeout_ms: default_h264_timeout_ms(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            default_fps: default_stream_fps(),
            max_fps: default_max_fps(),
            default_max_frames: default_max_frames(),
            jpeg_quality: default_jpeg_quality(),
            downscale_above_bytes: default_downscale_above_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            duration_check_interval: default_duration_check_interval(),
            prefetch_frames: default_prefetch_frames(),
            outbound_queue: default_outbound_queue(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            container: ContainerConfig::default(),
            streaming: StreamingConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with REPLAY_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. REPLAY_CACHE__MAX_CACHE_COUNT=600
            .add_source(
                Environment::with_prefix("REPLAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("REPLAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.cache.max_cache_count == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "cache.max_cache_count".to_string(),
                message: "Cache capacity must be greater than 0".to_string(),
            });
        }

        if !(self.cache.eviction_ratio > 0.0 && self.cache.eviction_ratio <= 1.0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "cache.eviction_ratio".to_string(),
                message: "Ratio must be in (0, 1]".to_string(),
            });
        }

        if self.cache.tolerance_ms < 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "cache.tolerance_ms".to_string(),
                message: "Tolerance cannot be negative".to_string(),
            });
        }

        if self.cache.poll_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "cache.poll_interval_ms".to_string(),
                message: "Poll interval must be greater than 0".to_string(),
            });
        }

        if self.container.annotation_topic.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "container.annotation_topic".to_string(),
            ));
        }

        if self.streaming.default_fps <= 0.0 || self.streaming.max_fps <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "streaming.default_fps/max_fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }

        if self.streaming.jpeg_quality == 0 || self.streaming.jpeg_quality > 100 {
            return Err(ConfigValidationError::InvalidValue {
                field: "streaming.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.streaming.downscale_above_bytes > self.streaming.max_frame_bytes {
            return Err(ConfigValidationError::InvalidValue {
                field: "streaming.downscale_above_bytes".to_string(),
                message: "Downscale threshold must not exceed max_frame_bytes".to_string(),
            });
        }

        if self.streaming.prefetch_frames == 0 || self.streaming.outbound_queue == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "streaming.prefetch_frames/outbound_queue".to_string(),
                message: "Queue sizes must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl CacheConfig {
    /// Number of entries dropped per steady-state trim.
    pub fn eviction_batch_size(&self) -> usize {
        ((self.max_cache_count as f64 * self.eviction_ratio) as usize).max(1)
    }

    /// Tolerance window in nanoseconds.
    pub fn tolerance_ns(&self) -> u64 {
        (self.tolerance_ms * 1_000_000.0) as u64
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn frame_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_wait_timeout_ms)
    }
}

impl ContainerConfig {
    pub fn h264_timeout(&self) -> Duration {
        Duration::from_millis(self.h264_timeout_ms)
    }
}

impl StreamingConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
