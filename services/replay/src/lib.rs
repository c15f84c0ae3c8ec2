//! Nier Replay Engine
//!
//! Synchronized playback and live streaming of multi-camera sensor
//! recordings stored as MCAP files.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!  recording ────▶│ Container    │── summary ──▶ ingestion
//!                 └──────────────┘
//!                    │        │
//!          per topic │        │ video topics
//!                    ▼        ▼
//!         ┌──────────────┐  ┌──────────────┐   ┌──────────────┐
//!         │ Stream       │  │ Producer     │──▶│ Frame        │──▶ playback
//!         │ Dispatcher   │  │ (decode+sync)│   │ Cache        │    get/seek
//!         └──────────────┘  └──────────────┘   └──────────────┘
//!                │
//!                ▼
//!           websocket
//! ```
//!
//! A [`session::SessionRegistry`] gives every session its own
//! [`player::Player`] and temporary source file.
//!
//! # Example
//!
//! ```rust,no_run
//! use replay_engine::{Player, ReplayConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ReplayConfig::default();
//!     let player = Player::open("recording.mcap", &config)?;
//!     println!("{} video topics", player.summary().video_topics.len());
//!
//!     player.start_load(None, None, 0)?;
//!     while let Some(group) = player.get_next_frame() {
//!         println!("frame {} at {} ns", group.frame_index, group.base_timestamp_ns);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod container;
pub mod decoder;
pub mod encoder;
pub mod player;
pub mod schema;
pub mod server;
pub mod session;
pub mod streaming;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types
pub use cache::{Eviction, EvictionKind, FrameCache};
pub use config::{ConfigValidationError, ReplayConfig};
pub use container::{
    ChannelInfo, ChannelKind, ContainerError, ContainerSummary, McapContainer, MessageSource,
    RawMessage,
};
pub use decoder::{DecodeError, Frame, FrameDecoder, PixelFormat};
pub use encoder::{EncodedFrame, FrameEncoder};
pub use player::{PlaybackError, PlaybackSettings, Player, PlayerStats};
pub use session::{SessionError, SessionRegistry};
pub use streaming::{ClientMessage, ServerMessage, StreamDispatcher, TransportError};
pub use sync::{FrameGroup, FrameSynchronizer};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ReplayConfig;
    pub use crate::container::{ContainerSummary, MessageSource};
    pub use crate::player::{PlaybackError, Player};
    pub use crate::session::SessionRegistry;
    pub use crate::streaming::{ClientMessage, ServerMessage, StreamDispatcher};
    pub use crate::sync::FrameGroup;
}
