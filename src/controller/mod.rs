//! `PlaybackController`: the state machine at the heart of the core (§4.F).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{broadcast, Mutex};

use crate::api::cache::ApiCache;
use crate::api::client::ServerApi;
use crate::config::ReplayGainSettings;
use crate::decoder::{DecoderEvent, DecoderFactory, PreparedSource};
use crate::error::{PlaybackError, Result};
use crate::focus::AudioFocusBridge;
use crate::gain::GainProvider;
use crate::models::{GainMode, Playlist, PlaybackState, ScrobbleKind, Track};
use crate::preload::PreloadCache;
use crate::scrobble::ScrobbleQueue;

/// A point-in-time view of the controller published after every state change, consumed by the
/// `SystemSessionAdapter` for skip-state masking (§4.G).
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub track: Option<Track>,
    pub state: PlaybackState,
    pub skip_in_progress: bool,
    pub actual_playing: bool,
    /// Set only on the snapshot published right after a new source reports ready, so the
    /// adapter knows to refresh media metadata exactly once per bind (§4.G).
    pub freshly_bound: bool,
}

struct ControllerState {
    playlist: Playlist,
    playback_state: PlaybackState,
    bound_source: Option<Box<dyn PreparedSource>>,
    skip_in_progress: bool,
    pending_skip_target: Option<usize>,
    /// The index the controller is heading towards, including requests made while a skip is
    /// still in flight. `playlist.current_index()` only catches up once a skip actually commits
    /// (step 3 of the protocol), so `next()`/`previous()` must derive their target from this
    /// field rather than from the committed index, or rapid presses would all recompute the same
    /// frozen target instead of accumulating (§4.F "Concurrency of skip").
    intended_index: usize,
    track_started_at: Option<Instant>,
    listened_accum: Duration,
}

impl ControllerState {
    fn empty() -> Self {
        Self {
            playlist: Playlist::default(),
            playback_state: PlaybackState::Stopped,
            bound_source: None,
            skip_in_progress: false,
            pending_skip_target: None,
            intended_index: 0,
            track_started_at: None,
            listened_accum: Duration::ZERO,
        }
    }

    fn listened_so_far(&self) -> Duration {
        let running = self
            .track_started_at
            .map(|started| Instant::now().saturating_duration_since(started))
            .unwrap_or(Duration::ZERO);
        self.listened_accum + running
    }
}

pub struct PlaybackController {
    server: Arc<dyn ServerApi>,
    cache: Arc<ApiCache>,
    decoder_factory: Arc<dyn DecoderFactory>,
    preload: Arc<PreloadCache>,
    scrobble: Arc<ScrobbleQueue>,
    gain_provider: Arc<dyn GainProvider>,
    focus: Arc<AudioFocusBridge>,
    replay_gain: Mutex<ReplayGainSettings>,
    state: Mutex<ControllerState>,
    snapshots: broadcast::Sender<ControllerSnapshot>,
}

impl PlaybackController {
    pub fn new(
        server: Arc<dyn ServerApi>,
        cache: Arc<ApiCache>,
        decoder_factory: Arc<dyn DecoderFactory>,
        preload: Arc<PreloadCache>,
        scrobble: Arc<ScrobbleQueue>,
        gain_provider: Arc<dyn GainProvider>,
        focus: Arc<AudioFocusBridge>,
        replay_gain: ReplayGainSettings,
    ) -> Arc<Self> {
        let (snapshots, _) = broadcast::channel(32);
        Arc::new(Self {
            server,
            cache,
            decoder_factory,
            preload,
            scrobble,
            gain_provider,
            focus,
            replay_gain: Mutex::new(replay_gain),
            state: Mutex::new(ControllerState::empty()),
            snapshots,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerSnapshot> {
        self.snapshots.subscribe()
    }

    pub async fn playback_state(&self) -> PlaybackState {
        self.state.lock().await.playback_state
    }

    pub async fn current_track(&self) -> Option<Track> {
        self.state.lock().await.playlist.current_track().cloned()
    }

    pub async fn update_replay_gain_settings(&self, settings: ReplayGainSettings) {
        *self.replay_gain.lock().await = settings;
    }

    /// Fetches the album (via `ApiCache`), replaces the playlist, and starts at index 0.
    pub async fn play_album(self: &Arc<Self>, album_id: &str) -> Result<()> {
        let server = self.server.clone();
        let album_id_owned = album_id.to_string();
        let detail = self
            .cache
            .get_or_fetch("getAlbum", &[("id", album_id)], move || {
                let server = server.clone();
                let album_id = album_id_owned.clone();
                async move { server.get_album(&album_id).await }
            })
            .await?;
        if detail.tracks.is_empty() {
            return Err(PlaybackError::EmptyResult);
        }
        self.replace_playlist(Playlist::new(detail.tracks)).await
    }

    /// Fetches `n` random songs and starts at index 0.
    pub async fn play_random(self: &Arc<Self>, n: u32) -> Result<()> {
        let tracks = self.server.get_random_songs(n).await?;
        if tracks.is_empty() {
            return Err(PlaybackError::EmptyResult);
        }
        self.replace_playlist(Playlist::new(tracks)).await
    }

    async fn replace_playlist(self: &Arc<Self>, playlist: Playlist) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.playlist = playlist;
            state.intended_index = 0;
            state.listened_accum = Duration::ZERO;
            state.track_started_at = None;
        }
        self.begin_skip(0).await
    }

    /// Resumes from Paused, or starts the current track from Stopped.
    pub async fn play(self: &Arc<Self>) -> Result<()> {
        let should_bind = {
            let state = self.state.lock().await;
            match state.playback_state {
                PlaybackState::Paused => {
                    if let Some(source) = &state.bound_source {
                        source.play().await?;
                    }
                    false
                }
                PlaybackState::Stopped => true,
                _ => false,
            }
        };
        if should_bind {
            self.focus.request_focus().await;
            let index = self.state.lock().await.playlist.current_index();
            return self.begin_skip(index).await;
        }
        self.focus.request_focus().await;
        self.set_playback_state(PlaybackState::Playing).await;
        let mut state = self.state.lock().await;
        state.track_started_at = Some(Instant::now());
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(source) = &state.bound_source {
            source.pause().await?;
        }
        state.listened_accum = state.listened_so_far();
        state.track_started_at = None;
        state.playback_state = PlaybackState::Paused;
        drop(state);
        self.publish_snapshot(false).await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(source) = state.bound_source.take() {
            source.release();
        }
        state.playback_state = PlaybackState::Stopped;
        state.track_started_at = None;
        state.listened_accum = Duration::ZERO;
        drop(state);
        self.publish_snapshot(false).await;
        Ok(())
    }

    /// Advances to the next track, or the next pending target if presses are still coalescing
    /// (§4.F "Concurrency of skip"). Bounds are checked against `intended_index`, not the
    /// committed `current_index`, so repeated rapid presses accumulate instead of stalling on a
    /// target frozen by an in-flight skip.
    pub async fn next(self: &Arc<Self>) -> Result<()> {
        let target = {
            let mut state = self.state.lock().await;
            if state.playlist.is_empty() || state.intended_index + 1 >= state.playlist.len() {
                return Ok(());
            }
            state.intended_index += 1;
            state.intended_index
        };
        self.request_skip(target).await
    }

    pub async fn previous(self: &Arc<Self>) -> Result<()> {
        let target = {
            let mut state = self.state.lock().await;
            if state.intended_index == 0 {
                return Ok(());
            }
            state.intended_index -= 1;
            state.intended_index
        };
        self.request_skip(target).await
    }

    pub async fn seek(&self, position_s: f32) -> Result<()> {
        let state = self.state.lock().await;
        if let Some(source) = &state.bound_source {
            source.seek(position_s).await?;
        }
        Ok(())
    }

    /// After `duration`, transitions to Paused. Fire-and-forget: spawns on the shared runtime.
    pub fn set_sleep_timer(self: &Arc<Self>, duration: Duration) {
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(err) = controller.pause().await {
                warn!("PlaybackController: sleep timer pause failed: {err}");
            }
        });
    }

    /// Auto-advance on `Completed`; propagates `Ready`/`Error` from a bound source.
    pub async fn handle_decoder_event(self: &Arc<Self>, event: DecoderEvent) {
        match event {
            DecoderEvent::Ready => {
                self.set_playback_state(PlaybackState::Playing).await;
            }
            DecoderEvent::Completed => {
                let has_next = self.state.lock().await.playlist.has_next();
                if has_next {
                    if let Err(err) = self.next().await {
                        warn!("PlaybackController: auto-advance failed: {err}");
                    }
                } else {
                    let _ = self.stop().await;
                }
            }
            DecoderEvent::Error(message) => {
                warn!("PlaybackController: decoder reported error: {message}");
                let _ = self.stop().await;
            }
        }
    }

    /// Requests a skip to `target`. While a skip is already in progress, further requests are
    /// coalesced to the latest target instead of queued (§4.F "Concurrency of skip").
    async fn request_skip(self: &Arc<Self>, target: usize) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.skip_in_progress {
                state.pending_skip_target = Some(target);
                return Ok(());
            }
        }
        self.begin_skip(target).await
    }

    /// Executes the eight-step skip protocol (§4.F), then drains any coalesced follow-up skip.
    async fn begin_skip(self: &Arc<Self>, target: usize) -> Result<()> {
        let mut current_target = target;
        loop {
            self.run_skip_once(current_target).await?;
            let next_target = {
                let mut state = self.state.lock().await;
                state.pending_skip_target.take()
            };
            match next_target {
                Some(next) => current_target = next,
                None => return Ok(()),
            }
        }
    }

    async fn run_skip_once(self: &Arc<Self>, target: usize) -> Result<()> {
        // 1. Mark a skip in progress.
        {
            let mut state = self.state.lock().await;
            state.skip_in_progress = true;
            state.playback_state = PlaybackState::Loading;
        }
        self.publish_snapshot(false).await;

        // 2. Abandon the currently bound source and record listened time for scrobble purposes.
        let previous_listened = {
            let mut state = self.state.lock().await;
            let listened = state.listened_so_far();
            if let Some(source) = state.bound_source.take() {
                source.release();
            }
            listened
        };
        let previous_track = self.state.lock().await.playlist.current_track().cloned();

        // 3. Compute new_index and move the cursor to the requested target.
        {
            let mut state = self.state.lock().await;
            state.playlist.set_current_index(target);
        }
        let requested_track = {
            let state = self.state.lock().await;
            state.playlist.current_track().cloned()
        };
        let Some(requested_track) = requested_track else {
            self.abort_skip().await;
            return Err(PlaybackError::NotFound {
                what: "track at target index".to_string(),
            });
        };

        // 4. Obtain a bound source: prefer the preload cache, else fetch fresh, else fall back to
        // the nearest preloaded entry. A fallback entry may sit at a different index than
        // requested, in which case the cursor is re-homed to wherever playback actually
        // continues from (§4.C "Fallback": "playback continues from it").
        let (new_index, track, source) = match self.preload.take(target).await {
            Some(entry) => (target, requested_track, entry.source),
            None => match self
                .decoder_factory
                .prepare(&self.server.stream_url(&requested_track.track_id))
                .await
            {
                Ok(source) => (target, requested_track, source),
                Err(err) => {
                    warn!("PlaybackController: fresh prepare failed for {}: {err}", requested_track.track_id);
                    let playlist_len = self.state.lock().await.playlist.len();
                    match self.preload.peek_nearest(target, playlist_len).await {
                        Some(entry) => {
                            let actual_index = entry.index;
                            let actual_track = {
                                let mut state = self.state.lock().await;
                                state.playlist.set_current_index(actual_index);
                                state.intended_index = actual_index;
                                state.playlist.current_track().cloned()
                            };
                            let Some(actual_track) = actual_track else {
                                self.abort_skip().await;
                                return Err(err);
                            };
                            warn!(
                                "PlaybackController: falling back to nearest preloaded entry at index {actual_index} (requested {target})"
                            );
                            (actual_index, actual_track, entry.source)
                        }
                        None => {
                            self.abort_skip().await;
                            return Err(err);
                        }
                    }
                }
            },
        };

        // 5. Apply the ReplayGain multiplier.
        let gain_settings = *self.replay_gain.lock().await;
        let multiplier = self.gain_provider.gain_multiplier(
            &track,
            gain_settings.mode,
            gain_settings.preamp_db,
            gain_settings.prevent_clip,
            gain_settings.fallback_gain_db,
        );
        source.set_volume(multiplier);

        // 6. Command play; treat the resolved future as the readiness signal for this core.
        if let Err(err) = source.play().await {
            self.abort_skip().await;
            return Err(err);
        }
        {
            let mut state = self.state.lock().await;
            state.bound_source = Some(source);
            state.playback_state = PlaybackState::Playing;
            state.skip_in_progress = false;
            state.track_started_at = Some(Instant::now());
            state.listened_accum = Duration::ZERO;
        }
        self.publish_snapshot(true).await;

        let playlist_snapshot = { self.state.lock().await.playlist.clone() };
        self.preload.on_current_index_changed(&playlist_snapshot, new_index).await;

        // 7. Enqueue NowPlaying for the new track.
        if let Err(err) = self.scrobble.enqueue(&track.track_id, ScrobbleKind::NowPlaying, None).await {
            warn!("PlaybackController: failed to enqueue NowPlaying: {err}");
        }

        // 8. Submission for the previous track if it was listened long enough.
        if let Some(previous_track) = previous_track {
            let threshold = Duration::from_secs(30).max(Duration::from_secs_f32(previous_track.duration_s as f32 * 0.5));
            if previous_listened >= threshold {
                if let Err(err) = self
                    .scrobble
                    .enqueue(&previous_track.track_id, ScrobbleKind::Submission, Some(Instant::now()))
                    .await
                {
                    warn!("PlaybackController: failed to enqueue Submission: {err}");
                }
            }
        }

        info!("PlaybackController: skip complete, now at index {new_index}");
        Ok(())
    }

    async fn abort_skip(&self) {
        let mut state = self.state.lock().await;
        state.skip_in_progress = false;
        state.playback_state = PlaybackState::Stopped;
        drop(state);
        self.publish_snapshot(false).await;
    }

    async fn set_playback_state(&self, new_state: PlaybackState) {
        self.state.lock().await.playback_state = new_state;
        self.publish_snapshot(false).await;
    }

    async fn publish_snapshot(&self, freshly_bound: bool) {
        let state = self.state.lock().await;
        let snapshot = ControllerSnapshot {
            track: state.playlist.current_track().cloned(),
            state: state.playback_state,
            skip_in_progress: state.skip_in_progress,
            actual_playing: state
                .bound_source
                .as_ref()
                .map(|source| source.is_playing())
                .unwrap_or(false),
            freshly_bound,
        };
        drop(state);
        let _ = self.snapshots.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::SubsonicServerApi;
    use crate::config::NetworkConfig;
    use crate::credentials::Credentials;
    use crate::decoder::simulated::arc_factory;
    use crate::focus::SimulatedAudioFocusPlatform;
    use crate::gain::ReplayGainProvider;
    use crate::persistence::Store;
    use crate::scrobble::ScrobbleStore;

    fn track(id: &str) -> Track {
        Track {
            track_id: id.to_string(),
            title: "Title".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            album_id: "a1".into(),
            cover_art_id: None,
            duration_s: 10,
            track_number: Some(1),
            mime: "audio/flac".into(),
            track_gain_db: None,
            album_gain_db: None,
            track_peak: None,
            album_peak: None,
        }
    }

    fn test_server() -> Arc<dyn ServerApi> {
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

    async fn test_controller() -> Arc<PlaybackController> {
        test_controller_with_factory().await.0
    }

    /// Like `test_controller`, but also hands back the concrete `SimulatedDecoderFactory` so a
    /// test can call `fail_next` to force a foreground prepare failure.
    async fn test_controller_with_factory(
    ) -> (Arc<PlaybackController>, Arc<crate::decoder::simulated::SimulatedDecoderFactory>) {
        let server = test_server();
        let cache = Arc::new(ApiCache::new(None));
        let decoder_factory = arc_factory();
        let preload = Arc::new(PreloadCache::new(server.clone(), decoder_factory.clone()));
        let scrobble_store = ScrobbleStore::new(Arc::new(Store::open_in_memory().unwrap()));
        let scrobble = Arc::new(ScrobbleQueue::load(scrobble_store, server.clone()).unwrap());
        let focus = Arc::new(AudioFocusBridge::new(Arc::new(SimulatedAudioFocusPlatform)));
        let controller = PlaybackController::new(
            server,
            cache,
            decoder_factory.clone(),
            preload,
            scrobble,
            Arc::new(ReplayGainProvider),
            focus,
            ReplayGainSettings::default(),
        );
        (controller, decoder_factory)
    }

    #[tokio::test]
    async fn test_play_album_starts_at_first_track() {
        let controller = test_controller().await;
        controller.replace_playlist(Playlist::new(vec![track("t1"), track("t2")])).await.unwrap();
        assert_eq!(controller.playback_state().await, PlaybackState::Playing);
        assert_eq!(controller.current_track().await.unwrap().track_id, "t1");
    }

    #[tokio::test]
    async fn test_next_advances_index_and_enqueues_now_playing() {
        let controller = test_controller().await;
        controller.replace_playlist(Playlist::new(vec![track("t1"), track("t2")])).await.unwrap();
        controller.next().await.unwrap();
        assert_eq!(controller.current_track().await.unwrap().track_id, "t2");
    }

    #[tokio::test]
    async fn test_next_at_last_track_is_noop() {
        let controller = test_controller().await;
        controller.replace_playlist(Playlist::new(vec![track("t1")])).await.unwrap();
        controller.next().await.unwrap();
        assert_eq!(controller.current_track().await.unwrap().track_id, "t1");
    }

    #[tokio::test]
    async fn test_pause_then_play_resumes_without_rebinding() {
        let controller = test_controller().await;
        controller.replace_playlist(Playlist::new(vec![track("t1")])).await.unwrap();
        controller.pause().await.unwrap();
        assert_eq!(controller.playback_state().await, PlaybackState::Paused);
        controller.play().await.unwrap();
        assert_eq!(controller.playback_state().await, PlaybackState::Playing);
    }

    #[tokio::test]
    async fn test_completed_event_auto_advances() {
        let controller = test_controller().await;
        controller.replace_playlist(Playlist::new(vec![track("t1"), track("t2")])).await.unwrap();
        controller.handle_decoder_event(DecoderEvent::Completed).await;
        assert_eq!(controller.current_track().await.unwrap().track_id, "t2");
    }

    #[tokio::test]
    async fn test_completed_event_on_last_track_stops() {
        let controller = test_controller().await;
        controller.replace_playlist(Playlist::new(vec![track("t1")])).await.unwrap();
        controller.handle_decoder_event(DecoderEvent::Completed).await;
        assert_eq!(controller.playback_state().await, PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn test_offline_fallback_uses_nearest_preloaded_entry_on_fresh_prepare_failure() {
        let (controller, decoder_factory) = test_controller_with_factory().await;
        let tracks = vec![track("t0"), track("t1"), track("t2"), track("t3"), track("t4")];
        controller.replace_playlist(Playlist::new(tracks)).await.unwrap();

        // Let the background preload window warm up indices 1, 2, 3 from index 0.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Drop the entry `next()` would normally take directly for index 1, and make the
        // foreground fetch for that same track fail, forcing the fallback path (§4.C
        // "Fallback"). Index 2 remains preloaded, so `peek_nearest` should find it.
        controller.preload.take(1).await;
        decoder_factory.fail_next(&controller.server.stream_url("t1"));

        controller.next().await.unwrap();

        assert_eq!(
            controller.current_track().await.unwrap().track_id,
            "t2",
            "falls back to the nearest preloaded entry when the fresh prepare fails"
        );
        assert_eq!(controller.playback_state().await, PlaybackState::Playing);
    }
}
