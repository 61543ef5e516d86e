//! Playback core for a Subsonic-compatible streaming music client.
//!
//! Four subsystems compose into one runtime: [`api::cache::ApiCache`] fronts every server call,
//! [`scrobble::ScrobbleQueue`] durably outboxes play events, [`preload::PreloadCache`] keeps the
//! next few tracks ready to bind, and [`controller::PlaybackController`] drives the state machine
//! that ties them together and mirrors itself onto the OS media session via
//! [`session::SystemSessionAdapter`].

pub mod api;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod decoder;
pub mod error;
pub mod focus;
pub mod gain;
pub mod models;
pub mod persistence;
pub mod preload;
pub mod scrobble;
pub mod session;

use std::path::Path;
use std::sync::Arc;

use api::cache::ApiCache;
use api::client::{ServerApi, SubsonicServerApi};
use config::Settings;
use controller::PlaybackController;
use credentials::Credentials;
use decoder::DecoderFactory;
use error::Result;
use focus::{AudioFocusBridge, AudioFocusPlatform};
use gain::{GainProvider, ReplayGainProvider};
use persistence::Store;
use preload::PreloadCache;
use scrobble::{ScrobbleQueue, ScrobbleStore};
use session::SystemSessionAdapter;

/// Assembles every subsystem described in the design into one running instance.
///
/// Construction wires dependencies bottom-up (store → cache/scrobble store → server → cache,
/// preload, scrobble queue → controller → session adapter) the way the reference client's
/// `app_bootstrap` builds its managers, minus the UI layer.
pub struct PlaybackCore {
    pub controller: Arc<PlaybackController>,
    pub session: Arc<SystemSessionAdapter>,
    pub cache: Arc<ApiCache>,
    settings: Settings,
}

impl PlaybackCore {
    /// Builds a core talking to a real Subsonic server over `ureq`, with SQLite-backed caching
    /// and scrobbling and a simulated audio focus platform (§9: real OS focus APIs are platform
    /// SDK surface outside this core).
    pub fn bootstrap(
        data_dir: &Path,
        credentials: Credentials,
        decoder_factory: Arc<dyn DecoderFactory>,
    ) -> Result<Self> {
        Self::bootstrap_with_focus_platform(
            data_dir,
            credentials,
            decoder_factory,
            Arc::new(focus::SimulatedAudioFocusPlatform),
        )
    }

    pub fn bootstrap_with_focus_platform(
        data_dir: &Path,
        credentials: Credentials,
        decoder_factory: Arc<dyn DecoderFactory>,
        focus_platform: Arc<dyn AudioFocusPlatform>,
    ) -> Result<Self> {
        let settings = Settings::load(data_dir);

        let db = Arc::new(
            Store::open(data_dir)
                .map_err(|err| error::PlaybackError::persistence(format!("failed to open store: {err}")))?,
        );

        let server: Arc<dyn ServerApi> = Arc::new(SubsonicServerApi::new(credentials, settings.network)?);
        let cache = Arc::new(ApiCache::new(Some(db.clone())));
        let preload = Arc::new(PreloadCache::new(server.clone(), decoder_factory.clone()));
        let scrobble = Arc::new(ScrobbleQueue::load(ScrobbleStore::new(db), server.clone())?);
        let focus = Arc::new(AudioFocusBridge::new(focus_platform));
        let gain_provider: Arc<dyn GainProvider> = Arc::new(ReplayGainProvider);

        let controller = PlaybackController::new(
            server,
            cache.clone(),
            decoder_factory,
            preload,
            scrobble.clone(),
            gain_provider,
            focus,
            settings.replay_gain,
        );

        let session = SystemSessionAdapter::attach(controller.clone());
        tokio::spawn(session.clone().run(controller.subscribe()));

        let scrobble_driver = scrobble.clone();
        tokio::spawn(async move { scrobble_driver.run().await });

        Ok(Self {
            controller,
            session,
            cache,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn persist_settings(&self, data_dir: &Path) {
        self.settings.save(data_dir);
    }
}
