//! Test doubles for the encoder seams.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{oneshot, watch};

use crate::error::StreamError;
use crate::probe::{MediaInfo, MediaProber};
use crate::process::{EncoderCommand, ExitFuture, ExitOutcome, Launcher};

pub fn sample_media() -> MediaInfo {
    MediaInfo {
        path: PathBuf::from("/media/movie.mkv"),
        duration: 600.0,
        width: 1920,
        height: 1080,
        video_codec: Some("h264".into()),
        audio_codec: Some("aac".into()),
        format_name: Some("matroska,webm".into()),
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Records launches instead of spawning anything. Each launched "process"
/// runs until stopped or until the test calls [`SpyLauncher::finish`].
#[derive(Default)]
pub struct SpyLauncher {
    launches: AtomicUsize,
    fail_next: AtomicBool,
    commands: Mutex<Vec<EncoderCommand>>,
    exits: Mutex<Vec<Option<oneshot::Sender<ExitOutcome>>>>,
}

impl SpyLauncher {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn last_command(&self) -> Option<EncoderCommand> {
        self.commands.lock().unwrap().last().cloned()
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Makes the `nth` launched process exit with `outcome`.
    pub fn finish(&self, nth: usize, outcome: ExitOutcome) {
        if let Some(tx) = self.exits.lock().unwrap().get_mut(nth).and_then(Option::take) {
            let _ = tx.send(outcome);
        }
    }
}

impl Launcher for SpyLauncher {
    fn launch(
        &self,
        _label: &str,
        command: &EncoderCommand,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ExitFuture, StreamError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StreamError::ProcessSpawn("spy: refused".into()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(command.clone());
        let (tx, rx) = oneshot::channel();
        self.exits.lock().unwrap().push(Some(tx));

        Ok(async move {
            tokio::select! {
                outcome = rx => outcome.unwrap_or(ExitOutcome::Stopped),
                _ = stop_requested(&mut stop) => ExitOutcome::Stopped,
            }
        }
        .boxed())
    }
}

/// Answers every probe with [`sample_media`] at the requested path.
#[derive(Default)]
pub struct StaticProber {
    pub probes: AtomicUsize,
    pub duration: Mutex<Option<f64>>,
}

#[async_trait]
impl MediaProber for StaticProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, StreamError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let mut media = sample_media();
        media.path = path.to_path_buf();
        if let Some(duration) = *self.duration.lock().unwrap() {
            media.duration = duration;
        }
        Ok(media)
    }
}
