//! Mirrors the controller's state onto the OS media session with skip-state masking (§4.G).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::{info, warn};
use souvlaki::{MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, PlatformConfig, SeekDirection};
use tokio::sync::{broadcast, mpsc};

use crate::controller::{ControllerSnapshot, PlaybackController};
use crate::models::PlaybackState;

const MEDIA_CONTROLS_DISPLAY_NAME: &str = "Subsonic Playback Core";
const MEDIA_CONTROLS_DBUS_NAME: &str = "subsonic-playback-core";
const SEEK_STEP_S: f32 = 10.0;

/// A `MediaControlEvent` translated into a controller-shaped intent (§4.G "Transport mapping").
#[derive(Debug, Clone, Copy)]
enum SessionCommand {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    SeekTo(f32),
    SeekBy(f32),
}

/// Bridges `PlaybackController` state to `souvlaki::MediaControls` and routes incoming remote
/// commands back to the controller (§4.G).
pub struct SystemSessionAdapter {
    controls: StdMutex<Option<MediaControls>>,
    last_known_playing: AtomicBool,
    last_bound_track_id: StdMutex<Option<String>>,
}

impl SystemSessionAdapter {
    /// Creates the adapter and, best-effort, the underlying platform media controls, wiring
    /// incoming remote commands to `controller`. Failure to attach is logged and non-fatal: the
    /// adapter degrades to a no-op sink.
    pub fn attach(controller: Arc<PlaybackController>) -> Arc<Self> {
        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<SessionCommand>();
        let controls = Self::create_controls(command_tx);
        let adapter = Arc::new(Self {
            controls: StdMutex::new(controls),
            last_known_playing: AtomicBool::new(false),
            last_bound_track_id: StdMutex::new(None),
        });

        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let result = match command {
                    SessionCommand::Play => controller.play().await,
                    SessionCommand::Pause => controller.pause().await,
                    SessionCommand::Toggle => {
                        if controller.playback_state().await == PlaybackState::Playing {
                            controller.pause().await
                        } else {
                            controller.play().await
                        }
                    }
                    SessionCommand::Next => controller.next().await,
                    SessionCommand::Previous => controller.previous().await,
                    SessionCommand::SeekTo(position) => controller.seek(position).await,
                    SessionCommand::SeekBy(_delta) => Ok(()),
                };
                if let Err(err) = result {
                    warn!("SystemSessionAdapter: command {command:?} failed: {err}");
                }
            }
        });

        adapter
    }

    fn create_controls(command_tx: mpsc::UnboundedSender<SessionCommand>) -> Option<MediaControls> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: MEDIA_CONTROLS_DISPLAY_NAME,
            dbus_name: MEDIA_CONTROLS_DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!("SystemSessionAdapter: failed to create media controls backend: {err}");
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            if let Some(command) = Self::map_control_event(event) {
                let _ = command_tx.send(command);
            }
        }) {
            warn!("SystemSessionAdapter: failed to attach media controls handler: {err}");
            return None;
        }

        info!("SystemSessionAdapter: attached to platform media session");
        Some(controls)
    }

    fn map_control_event(event: MediaControlEvent) -> Option<SessionCommand> {
        match event {
            MediaControlEvent::Play => Some(SessionCommand::Play),
            MediaControlEvent::Pause => Some(SessionCommand::Pause),
            MediaControlEvent::Toggle => Some(SessionCommand::Toggle),
            MediaControlEvent::Next => Some(SessionCommand::Next),
            MediaControlEvent::Previous => Some(SessionCommand::Previous),
            MediaControlEvent::Stop => Some(SessionCommand::Pause),
            MediaControlEvent::SetPosition(position) => {
                Some(SessionCommand::SeekTo(position.0.as_secs_f32()))
            }
            MediaControlEvent::SeekBy(direction, delta) => {
                let signed = match direction {
                    SeekDirection::Forward => delta.as_secs_f32(),
                    SeekDirection::Backward => -delta.as_secs_f32(),
                };
                Some(SessionCommand::SeekBy(signed))
            }
            MediaControlEvent::Seek(direction) => {
                let signed = match direction {
                    SeekDirection::Forward => SEEK_STEP_S,
                    SeekDirection::Backward => -SEEK_STEP_S,
                };
                Some(SessionCommand::SeekBy(signed))
            }
            MediaControlEvent::SetVolume(_)
            | MediaControlEvent::OpenUri(_)
            | MediaControlEvent::Raise
            | MediaControlEvent::Quit => None,
        }
    }

    /// Consumes controller snapshots for the lifetime of `receiver`, applying skip-state
    /// masking (§4.G) before mirroring each one onto the platform media session.
    pub async fn run(self: Arc<Self>, mut receiver: broadcast::Receiver<ControllerSnapshot>) {
        loop {
            match receiver.recv().await {
                Ok(snapshot) => self.apply_snapshot(&snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SystemSessionAdapter: lagged behind controller snapshots by {skipped}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn apply_snapshot(&self, snapshot: &ControllerSnapshot) {
        // Masking rule (§4.G): during a skip, a transient "not playing" decoder state is hidden
        // behind the last known non-skip value instead of leaking to the system session.
        let effective_playing = if snapshot.skip_in_progress && !snapshot.actual_playing {
            self.last_known_playing.load(Ordering::SeqCst)
        } else {
            if !snapshot.skip_in_progress {
                self.last_known_playing.store(snapshot.actual_playing, Ordering::SeqCst);
            }
            snapshot.actual_playing
        };

        // Processing-state normalisation: a skip never publishes anything but Playing/Paused,
        // never a transient loading/buffering hint that would read as "stopped" to remote peers.
        let playback = if snapshot.state == PlaybackState::Stopped && !snapshot.skip_in_progress {
            MediaPlayback::Stopped
        } else if effective_playing {
            MediaPlayback::Playing { progress: None }
        } else {
            MediaPlayback::Paused { progress: None }
        };

        let mut guard = self.controls.lock().expect("media controls lock poisoned");
        if let Some(controls) = guard.as_mut() {
            if let Err(err) = controls.set_playback(playback) {
                warn!("SystemSessionAdapter: failed to publish playback state: {err}");
            }
        }

        if snapshot.freshly_bound {
            self.publish_metadata(&mut guard, snapshot);
        }
    }

    fn publish_metadata(&self, guard: &mut Option<MediaControls>, snapshot: &ControllerSnapshot) {
        let Some(controls) = guard.as_mut() else {
            return;
        };
        let Some(track) = &snapshot.track else {
            return;
        };
        *self.last_bound_track_id.lock().expect("track id lock poisoned") = Some(track.track_id.clone());
        if let Err(err) = controls.set_metadata(MediaMetadata {
            title: Some(&track.title),
            artist: Some(&track.artist),
            album: Some(&track.album),
            duration: Some(std::time::Duration::from_secs(track.duration_s as u64)),
            cover_url: None,
        }) {
            warn!("SystemSessionAdapter: failed to publish metadata: {err}");
        }
    }
}
