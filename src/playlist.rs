//! VOD playlist for a whole source, generated from its duration alone.
//!
//! The playlist lists every segment up front so players can seek anywhere;
//! the segments themselves are produced on demand when requested.

use std::fmt::Write;

/// Placeholder in segment URL templates replaced by the segment index.
pub const INDEX_PLACEHOLDER: &str = "%d";

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    pub index: usize,
    /// Seconds.
    pub duration: f64,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub target_duration: u64,
    pub entries: Vec<PlaylistEntry>,
}

/// Splits `total_duration` into `segment_length` chunks. The last chunk
/// carries the remainder. A non-positive segment length or duration yields
/// no entries.
pub fn build_playlist(total_duration: f64, segment_length: f64, url_template: &str) -> Playlist {
    let usable = segment_length > 0.0 && total_duration > 0.0 && total_duration.is_finite();
    if !usable {
        return Playlist {
            target_duration: segment_length.max(0.0).ceil() as u64,
            entries: Vec::new(),
        };
    }

    let count = (total_duration / segment_length).ceil() as usize;
    let entries = (0..count)
        .map(|index| {
            let start = index as f64 * segment_length;
            PlaylistEntry {
                index,
                duration: segment_length.min(total_duration - start),
                uri: url_template.replace(INDEX_PLACEHOLDER, &index.to_string()),
            }
        })
        .filter(|entry| entry.duration > 0.0)
        .collect();

    Playlist {
        target_duration: segment_length.ceil() as u64,
        entries,
    }
}

impl Playlist {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(64 + self.entries.len() * 32);
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration);
        out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
        for entry in &self.entries {
            let _ = writeln!(out, "#EXTINF:{:.6},", entry.duration);
            out.push_str(&entry.uri);
            out.push('\n');
        }
        out.push_str("#EXT-X-ENDLIST\n");
        out
    }
}
