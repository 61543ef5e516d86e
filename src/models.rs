//! Core value types shared across the playback core (§3).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Immutable track identity and descriptive metadata. Equality is structural over all fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_id: String,
    pub cover_art_id: Option<String>,
    pub duration_s: u32,
    pub track_number: Option<u32>,
    pub mime: String,
    pub track_gain_db: Option<f32>,
    pub album_gain_db: Option<f32>,
    pub track_peak: Option<f32>,
    pub album_peak: Option<f32>,
}

/// Ordered sequence of tracks plus a playback cursor. Mutated only by the `PlaybackController`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Playlist {
    tracks: Vec<Track>,
    current_index: usize,
}

impl Playlist {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            current_index: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn track_at(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.tracks.get(self.current_index)
    }

    /// Sets the cursor, clamped into bounds. Returns the resulting index.
    pub fn set_current_index(&mut self, index: usize) -> usize {
        self.current_index = index.min(self.tracks.len().saturating_sub(1));
        self.current_index
    }

    pub fn has_next(&self) -> bool {
        !self.tracks.is_empty() && self.current_index + 1 < self.tracks.len()
    }

    pub fn has_previous(&self) -> bool {
        self.current_index > 0
    }
}

/// Playback state machine states (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Loading,
    Playing,
    Paused,
}

/// Linear ReplayGain application mode (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GainMode {
    Off,
    Track,
    Album,
}

/// `(key, value, expires_at)` entry held by the ApiCache (§3).
#[derive(Debug, Clone)]
pub struct ApiCacheEntry<T> {
    pub key: String,
    pub value: T,
    pub expires_at: Instant,
}

impl<T> ApiCacheEntry<T> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Scrobble event kind (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrobbleKind {
    NowPlaying,
    Submission,
}

/// A durable outbox entry for a play event (§3, §4.B).
#[derive(Debug, Clone, PartialEq)]
pub struct ScrobbleRecord {
    pub id: String,
    pub track_id: String,
    pub kind: ScrobbleKind,
    pub played_at: Option<Instant>,
    pub queued_at: Instant,
    pub retry_count: u32,
}

impl ScrobbleRecord {
    pub const MAX_RETRIES: u32 = 5;
    pub const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    pub fn is_prunable(&self, now: Instant) -> bool {
        self.retry_count >= Self::MAX_RETRIES
            || now.saturating_duration_since(self.queued_at) >= Self::MAX_AGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track {
            track_id: id.to_string(),
            title: "Title".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            album_id: "album-1".into(),
            cover_art_id: None,
            duration_s: 200,
            track_number: Some(1),
            mime: "audio/flac".into(),
            track_gain_db: None,
            album_gain_db: None,
            track_peak: None,
            album_peak: None,
        }
    }

    #[test]
    fn test_track_equality_is_structural() {
        assert_eq!(track("t1"), track("t1"));
        assert_ne!(track("t1"), track("t2"));
    }

    #[test]
    fn test_playlist_next_previous_bounds() {
        let mut playlist = Playlist::new(vec![track("t1"), track("t2"), track("t3")]);
        assert!(playlist.has_next());
        assert!(!playlist.has_previous());
        playlist.set_current_index(2);
        assert!(!playlist.has_next());
        assert!(playlist.has_previous());
    }

    #[test]
    fn test_scrobble_record_prunable_by_retry_count() {
        let now = Instant::now();
        let record = ScrobbleRecord {
            id: "r1".into(),
            track_id: "t1".into(),
            kind: ScrobbleKind::Submission,
            played_at: Some(now),
            queued_at: now,
            retry_count: 5,
        };
        assert!(record.is_prunable(now));
    }
}
