//! Demo binary exercising the playback core end to end against a real Subsonic server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use playback_core::credentials::Credentials;
use playback_core::decoder::simulated::SimulatedDecoderFactory;
use playback_core::PlaybackCore;

fn main() -> Result<()> {
    initialize_logging();

    let mut args = std::env::args().skip(1);
    let server_url = args.next().context("usage: playback-core-demo <server-url> <username> <password> <album-id>")?;
    let username = args.next().context("missing username")?;
    let password = args.next().context("missing password")?;
    let album_id = args.next().context("missing album-id")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(server_url, username, password, album_id))
}

async fn run(server_url: String, username: String, password: String, album_id: String) -> Result<()> {
    let data_dir = data_dir();
    let credentials = Credentials {
        server_url,
        username,
        password,
    };

    // The decoder is out of scope (§1 Non-goals); the demo drives the core with a simulated
    // decoder factory that mimics a working source instead of touching real audio hardware.
    let decoder_factory = Arc::new(SimulatedDecoderFactory::new());
    let core = PlaybackCore::bootstrap(&data_dir, credentials, decoder_factory)
        .map_err(|err| anyhow::anyhow!("failed to bootstrap playback core: {err}"))?;

    log::info!("playback-core-demo: playing album {album_id}");
    core.controller
        .play_album(&album_id)
        .await
        .map_err(|err| anyhow::anyhow!("failed to play album: {err}"))?;

    if let Some(track) = core.controller.current_track().await {
        log::info!("now playing: {} - {} ({})", track.title, track.artist, track.album);
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    core.persist_settings(&data_dir);
    Ok(())
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .expect("could not find platform data directory")
        .join("subsonic-playback-core")
}

fn initialize_logging() {
    let mut clog = colog::basic_builder();
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        clog.parse_filters(&rust_log);
    } else {
        clog.filter(None, log::LevelFilter::Warn);
        clog.filter(Some("playback_core"), log::LevelFilter::Debug);
    }
    clog.init();
}
