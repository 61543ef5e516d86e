//! Bounded look-ahead buffer of prepared audio sources (§4.C).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use tokio::sync::{Mutex, Semaphore};

use crate::api::client::ServerApi;
use crate::decoder::{DecoderFactory, PreparedSource};
use crate::models::Playlist;

/// Maximum concurrent preparations in flight (§4.C).
const MAX_CONCURRENT_PREPARATIONS: usize = 3;
/// Preload window extends this many tracks ahead of the current index.
const LOOKAHEAD: usize = 3;
/// Exactly one prepared entry is retained behind the current index for back-skip resilience.
const LOOKBEHIND: usize = 1;

/// One playlist position's prepared, not-yet-bound source (§3, §4.C).
pub struct PreloadEntry {
    pub index: usize,
    pub source: Box<dyn PreparedSource>,
    pub prepared_at: Instant,
}

/// Maintains prepared sources for `[current_index - 1, current_index + 3]` (§4.C).
pub struct PreloadCache {
    server: Arc<dyn ServerApi>,
    decoder_factory: Arc<dyn DecoderFactory>,
    entries: Mutex<HashMap<usize, PreloadEntry>>,
    in_progress: Mutex<HashSet<usize>>,
    semaphore: Arc<Semaphore>,
}

impl PreloadCache {
    pub fn new(server: Arc<dyn ServerApi>, decoder_factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            server,
            decoder_factory,
            entries: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(HashSet::new()),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_PREPARATIONS)),
        }
    }

    /// Recomputes the desired window, evicts anything outside it, and kicks off preparation for
    /// every missing slot (§4.C).
    pub async fn on_current_index_changed(self: &Arc<Self>, playlist: &Playlist, new_index: usize) {
        self.evict_outside_window(new_index).await;

        let lower = new_index.saturating_sub(LOOKBEHIND);
        let upper = (new_index + LOOKAHEAD).min(playlist.len().saturating_sub(1));
        if playlist.is_empty() {
            return;
        }

        for index in lower..=upper {
            if index == new_index {
                continue;
            }
            let Some(track) = playlist.track_at(index) else {
                continue;
            };
            let already_have = self.entries.lock().await.contains_key(&index);
            if already_have {
                continue;
            }
            let mut in_progress = self.in_progress.lock().await;
            if in_progress.contains(&index) {
                continue;
            }
            in_progress.insert(index);
            drop(in_progress);

            let cache = self.clone();
            let track_id = track.track_id.clone();
            tokio::spawn(async move {
                cache.prepare_slot(index, &track_id).await;
            });
        }
    }

    async fn prepare_slot(&self, index: usize, track_id: &str) {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let stream_url = self.server.stream_url(track_id);
        let result = self.decoder_factory.prepare(&stream_url).await;
        self.in_progress.lock().await.remove(&index);

        match result {
            Ok(source) => {
                debug!("PreloadCache: prepared slot {index}");
                self.entries.lock().await.insert(
                    index,
                    PreloadEntry {
                        index,
                        source,
                        prepared_at: Instant::now(),
                    },
                );
            }
            Err(err) => {
                // Isolated failure: one failed preload never aborts the others (§4.C).
                warn!("PreloadCache: failed to prepare slot {index}: {err}");
            }
        }
    }

    async fn evict_outside_window(&self, new_index: usize) {
        let lower = new_index.saturating_sub(LOOKBEHIND);
        let mut entries = self.entries.lock().await;
        let stale: Vec<usize> = entries
            .keys()
            .copied()
            .filter(|index| *index < lower)
            .collect();
        for index in stale {
            if let Some(entry) = entries.remove(&index) {
                entry.source.release();
            }
        }
    }

    /// Removes and returns the entry for `index` if ready. Destructive: a second call for the
    /// same index returns `None` (§4.C invariant).
    pub async fn take(&self, index: usize) -> Option<PreloadEntry> {
        self.entries.lock().await.remove(&index)
    }

    /// Offline fallback: searches forward then backward from `index` for any ready entry.
    pub async fn peek_nearest(&self, index: usize, playlist_len: usize) -> Option<PreloadEntry> {
        let mut entries = self.entries.lock().await;
        for forward in index..playlist_len {
            if entries.contains_key(&forward) {
                return entries.remove(&forward);
            }
        }
        for backward in (0..index).rev() {
            if entries.contains_key(&backward) {
                return entries.remove(&backward);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::SubsonicServerApi;
    use crate::config::NetworkConfig;
    use crate::credentials::Credentials;
    use crate::decoder::simulated::arc_factory;
    use crate::models::Track;

    fn track(id: &str) -> Track {
        Track {
            track_id: id.to_string(),
            title: "Title".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            album_id: "a1".into(),
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

    fn server() -> Arc<dyn ServerApi> {
        Arc::new(
            SubsonicServerApi::new(
                Credentials {
                    server_url: "https://music.example.com".into(),
                    username: "alice".into(),
                    password: "pw".into(),
                },
                NetworkConfig::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_on_index_changed_prepares_lookahead_window() {
        let cache = Arc::new(PreloadCache::new(server(), arc_factory()));
        let playlist = Playlist::new((0..6).map(|i| track(&format!("t{i}"))).collect());
        cache.on_current_index_changed(&playlist, 2).await;

        // Give the spawned preparation tasks a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        for index in [1usize, 3, 4, 5] {
            assert!(
                cache.entries.lock().await.contains_key(&index),
                "slot {index} should be prepared"
            );
        }
        assert!(!cache.entries.lock().await.contains_key(&2), "current index is never preloaded");
    }

    #[tokio::test]
    async fn test_take_is_destructive() {
        let cache = PreloadCache::new(server(), arc_factory());
        cache.entries.lock().await.insert(
            3,
            PreloadEntry {
                index: 3,
                source: Box::new(crate::decoder::simulated::SimulatedSource::new("u")),
                prepared_at: Instant::now(),
            },
        );
        assert!(cache.take(3).await.is_some());
        assert!(cache.take(3).await.is_none());
    }

    #[tokio::test]
    async fn test_eviction_drops_entries_before_lookbehind_window() {
        let cache = std::sync::Arc::new(PreloadCache::new(server(), arc_factory()));
        {
            let mut entries = cache.entries.lock().await;
            entries.insert(
                1,
                PreloadEntry {
                    index: 1,
                    source: Box::new(crate::decoder::simulated::SimulatedSource::new("u1")),
                    prepared_at: Instant::now(),
                },
            );
        }
        let playlist = Playlist::new((0..6).map(|i| track(&format!("t{i}"))).collect());
        // Current index moves to 5; slot 1 is now outside [4, 8] and must be evicted.
        cache.on_current_index_changed(&playlist, 5).await;
        assert!(!cache.entries.lock().await.contains_key(&1));
    }

    #[tokio::test]
    async fn test_peek_nearest_searches_forward_then_backward() {
        let cache = PreloadCache::new(server(), arc_factory());
        cache.entries.lock().await.insert(
            0,
            PreloadEntry {
                index: 0,
                source: Box::new(crate::decoder::simulated::SimulatedSource::new("u0")),
                prepared_at: Instant::now(),
            },
        );
        let found = cache.peek_nearest(2, 5).await;
        assert_eq!(found.unwrap().index, 0);
    }
}
