//! On-demand HLS: decides, per segment request, whether the running encoder
//! will produce the segment soon or has to be restarted at the requested
//! position, and then waits for the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::catalog::ContentKey;
use crate::error::StreamError;
use crate::metrics::{SEGMENT_TIMEOUTS, SESSION_RESTARTS};
use crate::playlist::{build_playlist, Playlist};
use crate::process::ExitOutcome;
use crate::probe::{MediaInfo, MediaProber};
use crate::segments::{AccessTracker, SegmentStore};
use crate::supervisor::{Registry, SessionInfo, SessionState, Supervisor};

/// Filesystem timestamps can trail the session's own clock reading.
const MTIME_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HlsOptions {
    /// How many segments ahead of the encoder a request may be and still be
    /// served by it.
    pub gap_threshold: usize,
    pub segment_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for HlsOptions {
    fn default() -> Self {
        Self {
            gap_threshold: 10,
            segment_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Whether an encoder whose last written segment is `last` will reach
/// `requested` soon enough. `last` may be -1 for a session starting at 0
/// that has not written anything yet.
pub fn within_reach(last: i64, requested: usize, gap_threshold: usize) -> bool {
    let requested = requested as i64;
    last <= requested && requested - last <= gap_threshold as i64
}

#[derive(Clone)]
pub struct HlsOrchestrator {
    supervisor: Supervisor,
    store: SegmentStore,
    access: AccessTracker,
    prober: Arc<dyn MediaProber>,
    options: HlsOptions,
}

impl HlsOrchestrator {
    pub fn new(
        supervisor: Supervisor,
        store: SegmentStore,
        prober: Arc<dyn MediaProber>,
        options: HlsOptions,
    ) -> Self {
        Self {
            supervisor,
            store,
            access: AccessTracker::default(),
            prober,
            options,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn access(&self) -> &AccessTracker {
        &self.access
    }

    fn segment_length(&self) -> u32 {
        self.supervisor.settings().segment_length
    }

    /// Full VOD playlist for `source`, with segment URIs from `url_template`.
    pub async fn playlist(
        &self,
        key: &ContentKey,
        source: &Path,
        url_template: &str,
    ) -> Result<Playlist, StreamError> {
        let media = self.prober.probe(source).await?;
        self.access.touch(key).await;
        Ok(build_playlist(
            media.duration,
            self.segment_length() as f64,
            url_template,
        ))
    }

    /// Returns the path of segment `index` once it exists on disk, starting
    /// or restarting the encoder for `key` as needed.
    pub async fn request_segment(
        &self,
        key: &ContentKey,
        source: &Path,
        index: usize,
    ) -> Result<PathBuf, StreamError> {
        let path = self.store.segment_path(key, index);
        self.access.touch(key).await;
        if self.store.segment_exists(&path).await {
            return Ok(path);
        }

        // Probe before taking the registry lock; the result is cached.
        let media = self.prober.probe(source).await?;
        let segment_length = self.segment_length() as f64;
        if index as f64 * segment_length >= media.duration {
            return Err(StreamError::NotFound(format!(
                "segment {index} of {key} (duration {:.1}s)",
                media.duration
            )));
        }

        let state = {
            let mut registry = self.supervisor.lock().await;
            // Another request may have been waiting on the lock while it landed.
            if self.store.segment_exists(&path).await {
                return Ok(path);
            }
            self.ensure_session(&mut registry, key, &media, index).await?
        };

        self.wait_for_segment(key, path, index, state).await
    }

    /// Reads segment `index`, going through [`request_segment`] again if the
    /// file vanished after it was found, e.g. because the reaper took the
    /// directory in between.
    ///
    /// [`request_segment`]: HlsOrchestrator::request_segment
    pub async fn read_segment(
        &self,
        key: &ContentKey,
        source: &Path,
        index: usize,
    ) -> Result<Vec<u8>, StreamError> {
        let path = self.request_segment(key, source, index).await?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Segment {} disappeared before it was read", path.display());
                let path = self.request_segment(key, source, index).await?;
                Ok(tokio::fs::read(&path).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_session(
        &self,
        registry: &mut Registry<'_>,
        key: &ContentKey,
        media: &MediaInfo,
        index: usize,
    ) -> Result<watch::Receiver<SessionState>, StreamError> {
        let Some(session) = registry.current(key) else {
            info!("Starting transcode for {} at segment #{}", key, index);
            return Ok(registry.start(key, media, index).await?.state);
        };

        let last = self.last_written(&session).await;
        if within_reach(last, index, self.options.gap_threshold) {
            debug!(
                "Segment #{} of {} is within reach of session {} (last #{})",
                index, key, session.id, last
            );
            return Ok(session.state);
        }

        info!(
            "Restarting transcode for {}: segment #{} requested, encoder is at #{}",
            key, index, last
        );
        SESSION_RESTARTS.inc();
        Ok(registry.start(key, media, index).await?.state)
    }

    /// Newest segment this session wrote, judged by modification time. Files
    /// left by earlier sessions do not count; before the first segment lands
    /// the encoder is considered to be just before its start segment.
    async fn last_written(&self, session: &SessionInfo) -> i64 {
        let since = session
            .started_at
            .checked_sub(MTIME_SLACK)
            .unwrap_or(session.started_at);
        match self.store.last_written_segment(&session.key, since).await {
            Some(index) => index as i64,
            None => session.start_segment as i64 - 1,
        }
    }

    async fn wait_for_segment(
        &self,
        key: &ContentKey,
        path: PathBuf,
        index: usize,
        mut state: watch::Receiver<SessionState>,
    ) -> Result<PathBuf, StreamError> {
        let written = self.store.written();
        let deadline = Instant::now() + self.options.segment_wait;
        let mut watching_state = true;
        debug!("Waiting for segment {}", path.display());

        loop {
            // Register for the wake-up before checking, so a segment landing
            // between the check and the await is not missed.
            let notified = written.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.store.segment_exists(&path).await {
                self.access.touch(key).await;
                return Ok(path);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Gave up on segment #{} of {} after {:?}",
                    index, key, self.options.segment_wait
                );
                SEGMENT_TIMEOUTS.inc();
                return Err(StreamError::SegmentTimeout {
                    key: key.to_string(),
                    segment: index,
                });
            }
            let nap = self.options.poll_interval.min(deadline - now);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(nap) => {}
                changed = state.changed(), if watching_state => {
                    if changed.is_err() {
                        watching_state = false;
                        continue;
                    }
                    let exited = match &*state.borrow_and_update() {
                        SessionState::Exited(outcome) => Some(outcome.clone()),
                        SessionState::Running => None,
                    };
                    let Some(outcome) = exited else { continue };
                    watching_state = false;
                    if let ExitOutcome::Failed { status, .. } = outcome {
                        if !self.store.segment_exists(&path).await {
                            return Err(StreamError::ProcessRuntime(format!(
                                "encoder for {key} exited with {status} before segment {index}"
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Deletes cached segments of content nobody has requested for
    /// `max_idle` and that has no running session. Returns how many content
    /// directories were removed.
    pub async fn reap_stale(&self, max_idle: Duration) -> usize {
        let stale = self.access.stale(max_idle, SystemTime::now()).await;
        self.reap(stale, max_idle).await
    }

    async fn reap(&self, candidates: Vec<ContentKey>, max_idle: Duration) -> usize {
        let mut removed = 0;
        for key in candidates {
            // Only the rename happens under the lock, so no session can start
            // writing into a directory that is about to go.
            let detached = {
                let registry = self.supervisor.lock().await;
                if registry.current(&key).is_some() {
                    continue;
                }
                if !self.access.forget_idle(&key, max_idle, SystemTime::now()).await {
                    debug!("{} was requested again, keeping its segments", key);
                    continue;
                }
                self.store.detach_content(&key).await
            };

            match detached {
                Ok(Some(trash)) => {
                    if let Err(e) = self.store.purge(&trash).await {
                        warn!("Failed to delete {}: {}", trash.display(), e);
                    }
                    info!("Removed cached segments of {} (idle > {:?})", key, max_idle);
                    removed += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to remove cached segments of {}: {}", key, e),
            }
        }
        removed
    }

    pub fn spawn_reaper(&self, max_idle: Duration, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = this.reap_stale(max_idle).await;
                if removed > 0 {
                    debug!("Reaper pass removed {} content directories", removed);
                }
            }
        })
    }
}
