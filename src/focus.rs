//! Audio focus request/grant debouncing (§4.E).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

/// Platform-reported focus transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusEvent {
    Gained,
    Lost,
    LostTransient,
    DuckRequest,
}

/// The narrow platform capability `AudioFocusBridge` drives (§4.E, §9). Real OS audio-focus
/// APIs are platform SDK surface outside a systems-language core; this crate ships only a
/// simulated implementation.
#[async_trait]
pub trait AudioFocusPlatform: Send + Sync {
    async fn request(&self) -> bool;
    async fn abandon(&self);
}

/// No-op/simulated `AudioFocusPlatform` suitable for the demo binary and tests.
pub struct SimulatedAudioFocusPlatform;

#[async_trait]
impl AudioFocusPlatform for SimulatedAudioFocusPlatform {
    async fn request(&self) -> bool {
        true
    }

    async fn abandon(&self) {}
}

const FOCUS_REQUEST_DELAY: Duration = Duration::from_millis(100);
const GRACE_WINDOW: Duration = Duration::from_millis(300);

/// Debounces the request/grant and loss/grant handshake race described in §4.E.
pub struct AudioFocusBridge {
    platform: Arc<dyn AudioFocusPlatform>,
    has_focus: AtomicBool,
    last_request_at: Mutex<Option<Instant>>,
    events: broadcast::Sender<FocusEvent>,
}

impl AudioFocusBridge {
    pub fn new(platform: Arc<dyn AudioFocusPlatform>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            platform,
            has_focus: AtomicBool::new(false),
            last_request_at: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FocusEvent> {
        self.events.subscribe()
    }

    pub fn has_focus(&self) -> bool {
        self.has_focus.load(Ordering::SeqCst)
    }

    /// Idempotent; returns `true` immediately without a platform call if focus is already held
    /// (§4.E contract). Otherwise waits out the mandatory 100 ms deferral before asking.
    pub async fn request_focus(&self) -> bool {
        if self.has_focus.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(FOCUS_REQUEST_DELAY).await;
        *self.last_request_at.lock().await = Some(Instant::now());
        let granted = self.platform.request().await;
        if granted {
            self.has_focus.store(true, Ordering::SeqCst);
            let _ = self.events.send(FocusEvent::Gained);
        }
        granted
    }

    pub async fn abandon_focus(&self) {
        if !self.has_focus.swap(false, Ordering::SeqCst) {
            return;
        }
        self.platform.abandon().await;
    }

    /// Feeds a platform-reported event through the grace-window filter (§4.E) before publishing
    /// it to subscribers and updating `has_focus`.
    pub async fn handle_platform_event(&self, event: FocusEvent) {
        if matches!(event, FocusEvent::Lost | FocusEvent::LostTransient) {
            let within_grace = match *self.last_request_at.lock().await {
                Some(requested_at) => Instant::now().duration_since(requested_at) < GRACE_WINDOW,
                None => false,
            };
            if within_grace {
                debug!("AudioFocusBridge: ignoring {event:?} within grace window of last request");
                return;
            }
            self.has_focus.store(false, Ordering::SeqCst);
        } else if event == FocusEvent::Gained {
            self.has_focus.store(true, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
    }
}
