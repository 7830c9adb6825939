use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::StreamError;

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mkv", "webm", "avi", "mov", "wmv", "flv", "mpg", "mpeg", "ts", "m2ts", "ogv",
];

const MAX_KEY_LEN: usize = 128;

/// Stable identifier for a source video.
///
/// Used as the name of the per-content segment directory, so only
/// `[A-Za-z0-9_-]` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentKey(String);

impl ContentKey {
    pub fn parse(raw: &str) -> Result<Self, StreamError> {
        if raw.is_empty() || raw.len() > MAX_KEY_LEN {
            return Err(StreamError::invalid("content key must be 1-128 characters"));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(StreamError::invalid("content key contains invalid characters"));
        }
        Ok(Self(raw.to_string()))
    }

    /// Derives the key for a source from its name relative to the media root.
    pub fn for_relative_path(relative: &str) -> Self {
        let digest = Sha256::digest(relative.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentKey {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentKey::parse(&value)
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        key.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaEntry {
    pub key: ContentKey,
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Resolves content keys to source files.
#[derive(Debug, Clone, Default)]
pub struct MediaCatalog {
    entries: Vec<MediaEntry>,
    by_key: HashMap<ContentKey, usize>,
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl MediaCatalog {
    pub fn from_entries(entries: Vec<MediaEntry>) -> Self {
        let mut catalog = MediaCatalog::default();
        for entry in entries {
            catalog.insert(entry);
        }
        catalog
    }

    /// Lists the video files directly inside `dir`.
    pub async fn load(dir: &Path) -> Result<Self, StreamError> {
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || !is_video(&path) {
                debug!("Skipping non-video entry {}", path.display());
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            entries.push(MediaEntry {
                key: ContentKey::for_relative_path(&name),
                name,
                path,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        info!("Catalog loaded from {}: {} entries", dir.display(), entries.len());
        Ok(Self::from_entries(entries))
    }

    fn insert(&mut self, entry: MediaEntry) {
        if let Some(&idx) = self.by_key.get(&entry.key) {
            self.entries[idx] = entry;
        } else {
            self.by_key.insert(entry.key.clone(), self.entries.len());
            self.entries.push(entry);
        }
    }

    pub fn get(&self, key: &ContentKey) -> Option<&MediaEntry> {
        self.by_key.get(key).map(|&idx| &self.entries[idx])
    }

    /// Parses `raw` and looks it up, distinguishing malformed from unknown keys.
    pub fn resolve(&self, raw: &str) -> Result<&MediaEntry, StreamError> {
        let key = ContentKey::parse(raw)?;
        self.get(&key)
            .ok_or_else(|| StreamError::NotFound(format!("media {key}")))
    }

    pub fn entries(&self) -> &[MediaEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_path_tricks() {
        assert!(ContentKey::parse("abc123_-X").is_ok());
        assert!(ContentKey::parse("").is_err());
        assert!(ContentKey::parse("../etc").is_err());
        assert!(ContentKey::parse("a/b").is_err());
        assert!(ContentKey::parse(&"a".repeat(129)).is_err());
    }

    #[test]
    fn derived_keys_are_stable() {
        let a = ContentKey::for_relative_path("movie.mkv");
        let b = ContentKey::for_relative_path("movie.mkv");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, ContentKey::for_relative_path("other.mkv"));
        assert!(ContentKey::parse(a.as_str()).is_ok());
    }

    #[tokio::test]
    async fn load_lists_only_videos() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("a.MP4"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub.mkv")).unwrap();

        let catalog = MediaCatalog::load(dir.path()).await.unwrap();
        let names: Vec<_> = catalog.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.MP4", "b.mkv"]);

        let key = ContentKey::for_relative_path("b.mkv");
        assert_eq!(catalog.resolve(key.as_str()).unwrap().name, "b.mkv");
    }

    #[test]
    fn resolve_distinguishes_malformed_and_unknown() {
        let catalog = MediaCatalog::default();
        assert!(matches!(catalog.resolve("bad/key"), Err(StreamError::InvalidRequest(_))));
        assert!(matches!(catalog.resolve("deadbeef"), Err(StreamError::NotFound(_))));
    }
}
