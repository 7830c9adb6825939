//! Ownership of segment-mode encoder processes.
//!
//! The supervisor keeps at most one session per [`ContentKey`]. Every
//! registry mutation goes through one mutex: starts and stops from request
//! handlers, and deregistration after a process exits. Exits do not touch
//! the map directly. The task awaiting a process sends a [`SessionExit`]
//! message to the supervisor's exit loop, which only removes the entry if it
//! still carries the exited session's id. A restart that already replaced
//! the entry is therefore never undone by the old process going away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::args::{hls_args, EncoderSettings};
use crate::catalog::ContentKey;
use crate::error::StreamError;
use crate::metrics::{ACTIVE_SESSIONS, SESSION_STARTS};
use crate::process::{EncoderCommand, ExitOutcome, Launcher};
use crate::probe::MediaInfo;
use crate::segments::SegmentStore;

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Exited(ExitOutcome),
}

/// Read-only view of a registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub key: ContentKey,
    /// Segment index the encoder was started at.
    pub start_segment: usize,
    pub started_at: SystemTime,
    pub state: watch::Receiver<SessionState>,
}

impl SessionInfo {
    pub fn has_exited(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Exited(_))
    }
}

/// Registry entry. Dropping it signals the process to terminate.
struct Session {
    info: SessionInfo,
    stop: watch::Sender<bool>,
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

#[derive(Debug)]
struct SessionExit {
    key: ContentKey,
    id: SessionId,
    outcome: ExitOutcome,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Mutex<HashMap<ContentKey, Session>>,
    launcher: Arc<dyn Launcher>,
    store: SegmentStore,
    settings: EncoderSettings,
    exits: mpsc::UnboundedSender<SessionExit>,
    next_id: AtomicU64,
}

impl Supervisor {
    /// Must be called from within a tokio runtime; spawns the exit loop.
    pub fn new(launcher: Arc<dyn Launcher>, store: SegmentStore, settings: EncoderSettings) -> Self {
        let (exits, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry: Mutex::new(HashMap::new()),
            launcher,
            store,
            settings,
            exits,
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(exit_loop(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.inner.settings
    }

    /// Takes the registry lock. Hold it across a read-decide-start sequence
    /// so concurrent requests for one key cannot both start an encoder, and
    /// release it before waiting on any output.
    pub async fn lock(&self) -> Registry<'_> {
        Registry {
            sessions: self.inner.registry.lock().await,
            inner: &self.inner,
        }
    }

    pub async fn start_session(
        &self,
        key: &ContentKey,
        media: &MediaInfo,
        start_segment: usize,
    ) -> Result<SessionInfo, StreamError> {
        self.lock().await.start(key, media, start_segment).await
    }

    /// Returns whether a session was registered. Does not wait for the
    /// process to exit.
    pub async fn stop_session(&self, key: &ContentKey) -> bool {
        self.lock().await.stop(key)
    }

    pub async fn current_session(&self, key: &ContentKey) -> Option<SessionInfo> {
        self.lock().await.current(key)
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let registry = self.lock().await;
        let mut list: Vec<_> = registry.sessions.values().map(|s| s.info.clone()).collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    pub async fn stop_all(&self) {
        let mut registry = self.lock().await;
        let count = registry.sessions.len();
        for (_, session) in registry.sessions.drain() {
            drop(session);
            ACTIVE_SESSIONS.dec();
        }
        if count > 0 {
            info!("Stopped {} transcode session(s)", count);
        }
    }
}

pub struct Registry<'a> {
    sessions: MutexGuard<'a, HashMap<ContentKey, Session>>,
    inner: &'a Inner,
}

impl Registry<'_> {
    /// The live session for `key`. A session whose process has exited but
    /// whose exit has not been processed yet counts as absent.
    pub fn current(&self, key: &ContentKey) -> Option<SessionInfo> {
        self.sessions
            .get(key)
            .map(|s| s.info.clone())
            .filter(|info| !info.has_exited())
    }

    /// Replaces any session for `key` with a new encoder starting at
    /// `start_segment`. Returns once the process is spawned.
    pub async fn start(
        &mut self,
        key: &ContentKey,
        media: &MediaInfo,
        start_segment: usize,
    ) -> Result<SessionInfo, StreamError> {
        self.stop(key);

        let dir = self.inner.store.prepare_dir(key).await.map_err(|e| {
            StreamError::ProcessSpawn(format!(
                "cannot prepare output directory for {key}: {e}"
            ))
        })?;

        let settings = &self.inner.settings;
        let command = EncoderCommand::new(
            settings.ffmpeg_path.clone(),
            hls_args(settings, media, &dir, start_segment),
        );
        debug!("running {}", command.command_line());

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let started_at = SystemTime::now();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Running);

        let exit = self.inner.launcher.launch(key.as_str(), &command, stop_rx)?;

        let exits = self.inner.exits.clone();
        let exit_key = key.clone();
        tokio::spawn(async move {
            let outcome = exit.await;
            let _ = state_tx.send(SessionState::Exited(outcome.clone()));
            let _ = exits.send(SessionExit {
                key: exit_key,
                id,
                outcome,
            });
        });

        let info = SessionInfo {
            id,
            key: key.clone(),
            start_segment,
            started_at,
            state: state_rx,
        };
        self.sessions.insert(
            key.clone(),
            Session {
                info: info.clone(),
                stop: stop_tx,
            },
        );
        ACTIVE_SESSIONS.inc();
        SESSION_STARTS.inc();
        info!(
            "Started transcode session {} for {} at segment {}",
            id, key, start_segment
        );
        Ok(info)
    }

    /// Signals termination and removes the entry.
    pub fn stop(&mut self, key: &ContentKey) -> bool {
        match self.sessions.remove(key) {
            Some(session) => {
                info!(
                    "Stopping transcode session {} for {}",
                    session.info.id, key
                );
                drop(session);
                ACTIVE_SESSIONS.dec();
                true
            }
            None => false,
        }
    }
}

async fn exit_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<SessionExit>) {
    while let Some(exit) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut sessions = inner.registry.lock().await;
        let current = sessions.get(&exit.key).map(|s| s.info.id);
        if current == Some(exit.id) {
            sessions.remove(&exit.key);
            ACTIVE_SESSIONS.dec();
            debug!(
                "Deregistered session {} for {} ({})",
                exit.id, exit.key, exit.outcome
            );
        } else {
            // Already stopped or replaced by a restart.
            debug!(
                "Ignoring exit of superseded session {} for {} ({})",
                exit.id, exit.key, exit.outcome
            );
        }
    }
}
