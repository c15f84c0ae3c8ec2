//! Per-session ownership of players and temporary source files.

use crate::config::ReplayConfig;
use crate::container::{ContainerError, ContainerSummary, MessageSource};
use crate::decoder::FrameDecoder;
use crate::player::Player;
use crate::streaming::{ServerMessage, StreamDispatcher, StreamSettings};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Unknown session {0}")]
    NotFound(String),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

struct Session {
    player: Arc<Player>,
    /// File deleted when the session lets go of it
    temp_source: Option<PathBuf>,
    cancel: CancellationToken,
}

impl Session {
    fn release(self, session_id: &str) {
        self.cancel.cancel();
        self.player.close();

        if let Some(path) = self.temp_source {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(session_id = %session_id, path = %path.display(), "Temporary source removed"),
                Err(e) => warn!(
                    session_id = %session_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove temporary source"
                ),
            }
        }
    }
}

/// Maps session ids to their isolated playback resources.
pub struct SessionRegistry {
    config: ReplayConfig,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Open a recording for `session_id`, replacing whatever it had open.
    ///
    /// A `temporary` file belongs to the session from here on and is deleted
    /// when replaced, torn down, or when it fails to open.
    pub fn open_source(
        &self,
        session_id: &str,
        path: impl AsRef<Path>,
        temporary: bool,
    ) -> Result<Arc<Player>, SessionError> {
        let path = path.as_ref();
        self.teardown(session_id);

        let player = match Player::open(path, &self.config) {
            Ok(player) => player,
            Err(e) => {
                warn!(session_id = %session_id, path = %path.display(), error = %e, "Failed to open source");
                if temporary {
                    if let Err(e) = std::fs::remove_file(path) {
                        warn!(path = %path.display(), error = %e, "Failed to remove temporary source");
                    }
                }
                return Err(e.into());
            }
        };

        info!(
            session_id = %session_id,
            path = %path.display(),
            video_topics = player.summary().video_topics.len(),
            duration_sec = player.summary().duration_sec,
            "Source opened"
        );
        let temp_source = temporary.then(|| path.to_path_buf());
        Ok(self.attach(session_id, player, temp_source))
    }

    /// Install an already opened player, releasing the session's previous one.
    pub fn attach(&self, session_id: &str, player: Player, temp_source: Option<PathBuf>) -> Arc<Player> {
        let player = Arc::new(player);
        let session = Session {
            player: player.clone(),
            temp_source,
            cancel: CancellationToken::new(),
        };

        let previous = self.sessions.write().insert(session_id.to_string(), session);
        if let Some(previous) = previous {
            previous.release(session_id);
        }
        player
    }

    /// Release everything the session owns. Returns whether it existed.
    pub fn teardown(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        match removed {
            Some(session) => {
                session.release(session_id);
                info!(session_id = %session_id, "Session torn down");
                true
            }
            None => false,
        }
    }

    pub fn player(&self, session_id: &str) -> Option<Arc<Player>> {
        self.sessions.read().get(session_id).map(|s| s.player.clone())
    }

    pub fn source(&self, session_id: &str) -> Option<Arc<dyn MessageSource>> {
        self.player(session_id).map(|player| player.source())
    }

    pub fn summary(&self, session_id: &str) -> Option<ContainerSummary> {
        self.player(session_id).map(|player| player.summary().clone())
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A token cancelled when the session is replaced or torn down.
    pub fn stream_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.cancel.child_token())
    }

    /// Build a streaming dispatcher for one connection of `session_id`.
    pub fn dispatcher(
        &self,
        session_id: &str,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<StreamDispatcher, SessionError> {
        let (source, cancel) = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            (session.player.source(), session.cancel.child_token())
        };

        Ok(StreamDispatcher::new(
            source,
            Arc::new(FrameDecoder::new(&self.config.container)),
            StreamSettings::from(&self.config.streaming),
            outbound,
            cancel,
        ))
    }

    pub fn shutdown(&self) {
        let sessions: Vec<(String, Session)> = self.sessions.write().drain().collect();
        for (session_id, session) in sessions {
            session.release(&session_id);
        }
        info!("All sessions released");
    }
}
