//! On-disk segment cache.
//!
//! Layout: `<root>/<content key>/<index>.ts`, plus the encoder's own
//! `playlist.m3u8`. Files are written by exactly one encoder and only read
//! afterwards. The encoder writes `<index>.ts.tmp` and renames on completion,
//! so a segment path that exists is always complete.
//!
//! Content directories being deleted are first renamed to
//! `<root>/.reap-<key>-<pid>-<n>`. Content keys never contain a dot, so these
//! names cannot clash with live content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::catalog::ContentKey;
use crate::error::StreamError;

const SEGMENT_EXT: &str = ".ts";
const TRASH_PREFIX: &str = ".reap-";

/// Parses `<index>.ts`. Temp files and the playlist yield `None`.
pub fn parse_segment_name(name: &str) -> Option<usize> {
    let digits = name.strip_suffix(SEGMENT_EXT)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Clone)]
pub struct SegmentStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    written: Arc<Notify>,
    watcher: StdMutex<Option<RecommendedWatcher>>,
    detached: AtomicU64,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: root.into(),
                written: Arc::new(Notify::new()),
                watcher: StdMutex::new(None),
                detached: AtomicU64::new(0),
            }),
        }
    }

    pub fn content_dir(&self, key: &ContentKey) -> PathBuf {
        self.inner.root.join(key.as_str())
    }

    pub fn segment_path(&self, key: &ContentKey, index: usize) -> PathBuf {
        self.content_dir(key).join(format!("{index}{SEGMENT_EXT}"))
    }

    /// Woken whenever the watcher sees a segment land on disk.
    pub fn written(&self) -> Arc<Notify> {
        self.inner.written.clone()
    }

    /// Starts watching the cache root so waiters are woken as soon as a
    /// segment is renamed into place. Without a watcher waiters still poll.
    pub fn watch(&self) -> Result<(), StreamError> {
        std::fs::create_dir_all(&self.inner.root)?;

        let written = self.inner.written.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let is_segment = event.paths.iter().any(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_segment_name)
                    .is_some()
            });
            if is_segment {
                written.notify_waiters();
            }
        })
        .map_err(|e| StreamError::Io(std::io::Error::other(e)))?;

        watcher
            .watch(&self.inner.root, RecursiveMode::Recursive)
            .map_err(|e| StreamError::Io(std::io::Error::other(e)))?;

        if let Ok(mut slot) = self.inner.watcher.lock() {
            *slot = Some(watcher);
        }
        info!("Watching segment cache {}", self.inner.root.display());
        Ok(())
    }

    /// Creates the content directory and drops partial files left behind by
    /// a killed encoder.
    pub async fn prepare_dir(&self, key: &ContentKey) -> Result<PathBuf, StreamError> {
        let dir = self.content_dir(key);
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                debug!("Removing partial segment {}", path.display());
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(dir)
    }

    pub async fn segment_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Index of the most recently modified segment written at or after
    /// `since`. Ties go to the higher index.
    pub async fn last_written_segment(&self, key: &ContentKey, since: SystemTime) -> Option<usize> {
        let mut entries = tokio::fs::read_dir(self.content_dir(key)).await.ok()?;
        let mut latest: Option<(SystemTime, usize)> = None;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(index) = entry.file_name().to_str().and_then(parse_segment_name) else {
                continue;
            };
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if modified < since {
                continue;
            }
            if latest.map_or(true, |best| (modified, index) > best) {
                latest = Some((modified, index));
            }
        }
        latest.map(|(_, index)| index)
    }

    /// Moves the content directory of `key` out of the way with a single
    /// rename. The returned path must be handed to [`SegmentStore::purge`].
    /// `None` if there was nothing cached.
    pub async fn detach_content(&self, key: &ContentKey) -> Result<Option<PathBuf>, StreamError> {
        let n = self.inner.detached.fetch_add(1, Ordering::Relaxed);
        let trash = self
            .inner
            .root
            .join(format!("{TRASH_PREFIX}{key}-{}-{n}", std::process::id()));
        match tokio::fs::rename(self.content_dir(key), &trash).await {
            Ok(()) => Ok(Some(trash)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn purge(&self, detached: &Path) -> Result<(), StreamError> {
        match tokio::fs::remove_dir_all(detached).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes detached directories a previous run did not get to.
    pub async fn purge_leftovers(&self) -> usize {
        let Ok(mut entries) = tokio::fs::read_dir(&self.inner.root).await else {
            return 0;
        };
        let mut purged = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with(TRASH_PREFIX) {
                continue;
            }
            match self.purge(&entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to purge {}: {}", entry.path().display(), e),
            }
        }
        purged
    }
}

/// Last client access per content key.
#[derive(Clone, Default)]
pub struct AccessTracker {
    last: Arc<Mutex<HashMap<ContentKey, SystemTime>>>,
}

impl AccessTracker {
    pub async fn touch(&self, key: &ContentKey) {
        self.last.lock().await.insert(key.clone(), SystemTime::now());
    }

    pub async fn last_access(&self, key: &ContentKey) -> Option<SystemTime> {
        self.last.lock().await.get(key).copied()
    }

    /// Keys not accessed within `max_idle` of `now`.
    pub async fn stale(&self, max_idle: Duration, now: SystemTime) -> Vec<ContentKey> {
        self.last
            .lock()
            .await
            .iter()
            .filter(|(_, at)| now.duration_since(**at).map(|d| d > max_idle).unwrap_or(false))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Drops the record of `key` if it is still older than `max_idle`.
    /// Returns false when the key was touched in the meantime.
    pub async fn forget_idle(&self, key: &ContentKey, max_idle: Duration, now: SystemTime) -> bool {
        let mut last = self.last.lock().await;
        let idle = last
            .get(key)
            .is_some_and(|at| now.duration_since(*at).map(|d| d > max_idle).unwrap_or(false));
        if idle {
            last.remove(key);
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ContentKey {
        ContentKey::parse(raw).unwrap()
    }

    fn touch_at(path: &Path, at: SystemTime) {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .unwrap();
        file.set_modified(at).unwrap();
    }

    #[test]
    fn segment_names() {
        assert_eq!(parse_segment_name("0.ts"), Some(0));
        assert_eq!(parse_segment_name("42.ts"), Some(42));
        assert_eq!(parse_segment_name("42.ts.tmp"), None);
        assert_eq!(parse_segment_name("playlist.m3u8"), None);
        assert_eq!(parse_segment_name(".ts"), None);
        assert_eq!(parse_segment_name("-1.ts"), None);
    }

    #[test]
    fn paths_follow_layout() {
        let store = SegmentStore::new("/cache");
        assert_eq!(store.segment_path(&key("abc"), 7), PathBuf::from("/cache/abc/7.ts"));
    }

    #[tokio::test]
    async fn last_written_uses_mtime_not_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let k = key("movie");
        let content = store.prepare_dir(&k).await.unwrap();
        let base = SystemTime::now();

        touch_at(&content.join("9.ts"), base);
        touch_at(&content.join("3.ts"), base + Duration::from_secs(5));
        touch_at(&content.join("4.ts.tmp"), base + Duration::from_secs(9));

        assert_eq!(store.last_written_segment(&k, base).await, Some(3));
    }

    #[tokio::test]
    async fn last_written_ignores_older_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let k = key("movie");
        let content = store.prepare_dir(&k).await.unwrap();
        let base = SystemTime::now();

        touch_at(&content.join("20.ts"), base - Duration::from_secs(60));
        assert_eq!(store.last_written_segment(&k, base).await, None);

        touch_at(&content.join("51.ts"), base + Duration::from_secs(1));
        assert_eq!(store.last_written_segment(&k, base).await, Some(51));
    }

    #[tokio::test]
    async fn missing_directory_has_no_segments() {
        let store = SegmentStore::new("/nonexistent/vodstream-cache");
        assert_eq!(store.last_written_segment(&key("x"), SystemTime::UNIX_EPOCH).await, None);
        assert!(!store.segment_exists(&store.segment_path(&key("x"), 0)).await);
    }

    #[tokio::test]
    async fn prepare_removes_partial_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let k = key("movie");
        let content = store.prepare_dir(&k).await.unwrap();
        std::fs::write(content.join("5.ts.tmp"), b"partial").unwrap();
        std::fs::write(content.join("4.ts"), b"done").unwrap();

        store.prepare_dir(&k).await.unwrap();
        assert!(!content.join("5.ts.tmp").exists());
        assert!(content.join("4.ts").exists());
    }

    #[tokio::test]
    async fn detach_moves_content_aside_until_purged() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        let k = key("movie");
        let content = store.prepare_dir(&k).await.unwrap();
        std::fs::write(content.join("0.ts"), b"ts").unwrap();

        let trash = store.detach_content(&k).await.unwrap().unwrap();
        assert!(!content.exists());
        assert!(trash.join("0.ts").exists());
        assert!(trash.starts_with(dir.path()));

        // A new session gets a clean directory right away.
        store.prepare_dir(&k).await.unwrap();
        assert!(!store.segment_path(&k, 0).exists());

        store.purge(&trash).await.unwrap();
        assert!(!trash.exists());
        store.purge(&trash).await.unwrap();

        std::fs::remove_dir(&content).unwrap();
        assert_eq!(store.detach_content(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn leftovers_from_earlier_runs_are_purged() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join(".reap-old-1-0/sub")).unwrap();
        std::fs::write(dir.path().join(".reap-old-1-0/3.ts"), b"ts").unwrap();
        store.prepare_dir(&key("live")).await.unwrap();

        assert_eq!(store.purge_leftovers().await, 1);
        assert!(!dir.path().join(".reap-old-1-0").exists());
        assert!(store.content_dir(&key("live")).exists());
    }

    #[tokio::test]
    async fn access_tracker_reports_stale_keys() {
        let tracker = AccessTracker::default();
        tracker.touch(&key("a")).await;
        assert!(tracker.last_access(&key("a")).await.is_some());

        let now = SystemTime::now();
        assert!(tracker.stale(Duration::from_secs(60), now).await.is_empty());
        let later = now + Duration::from_secs(120);
        assert_eq!(tracker.stale(Duration::from_secs(60), later).await, vec![key("a")]);

        // Still fresh at `now`, so it stays.
        assert!(!tracker.forget_idle(&key("a"), Duration::from_secs(60), now).await);
        assert!(tracker.last_access(&key("a")).await.is_some());

        assert!(tracker.forget_idle(&key("a"), Duration::from_secs(60), later).await);
        assert!(tracker.last_access(&key("a")).await.is_none());
        assert!(!tracker.forget_idle(&key("a"), Duration::from_secs(60), later).await);
    }
}
