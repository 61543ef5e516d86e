//! Narrow decoder capability interface (§4.C, §9). Audio decoding itself is out of scope; this
//! core only needs to command a decoder and observe its events.

use async_trait::async_trait;

use crate::error::PlaybackError;

/// Asynchronous events a bound source reports back to its owner (§4.F, §5).
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    Ready,
    Completed,
    Error(String),
}

/// A source bound to one track, ready (or preparing) to be handed to the decoder (§4.C).
#[async_trait]
pub trait PreparedSource: Send + Sync {
    /// Commands playback to start. Resolves once the decoder has accepted the command; actual
    /// readiness is reported asynchronously via `DecoderEvent::Ready`.
    async fn play(&self) -> Result<(), PlaybackError>;
    async fn pause(&self) -> Result<(), PlaybackError>;
    async fn seek(&self, position_s: f32) -> Result<(), PlaybackError>;
    fn set_volume(&self, multiplier: f32);
    fn is_playing(&self) -> bool;
    /// Releases any resources held by this source. Called on eviction or skip (§4.C, §4.F).
    fn release(&self);
}

/// Builds a `PreparedSource` bound to a signed, short-lived stream URL (§4.C step 2).
#[async_trait]
pub trait DecoderFactory: Send + Sync {
    async fn prepare(&self, stream_url: &str) -> Result<Box<dyn PreparedSource>, PlaybackError>;
}

/// A no-op/simulated decoder implementation (§9: real decoding is platform/codec SDK surface
/// outside a systems-language core), suitable for the demo binary and for controller/preload
/// tests alike. Mirrors how `focus::SimulatedAudioFocusPlatform` fills the same role for focus.
pub mod simulated {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// A `PreparedSource` that never touches real audio hardware; just tracks the calls a
    /// `PlaybackController` is expected to make.
    pub struct SimulatedSource {
        pub url: String,
        playing: AtomicBool,
        released: AtomicBool,
    }

    impl SimulatedSource {
        pub fn new(url: &str) -> Self {
            Self {
                url: url.to_string(),
                playing: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }
        }

        pub fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PreparedSource for SimulatedSource {
        async fn play(&self) -> Result<(), PlaybackError> {
            self.playing.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self) -> Result<(), PlaybackError> {
            self.playing.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn seek(&self, _position_s: f32) -> Result<(), PlaybackError> {
            Ok(())
        }

        fn set_volume(&self, _multiplier: f32) {}

        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// A `DecoderFactory` whose `prepare` calls can be made to fail for specific URLs, to
    /// exercise offline-fallback paths (§4.C "Fallback") in tests.
    pub struct SimulatedDecoderFactory {
        pub failing_urls: std::sync::Mutex<Vec<String>>,
        pub prepared_count: std::sync::atomic::AtomicU32,
    }

    impl SimulatedDecoderFactory {
        pub fn new() -> Self {
            Self {
                failing_urls: std::sync::Mutex::new(Vec::new()),
                prepared_count: std::sync::atomic::AtomicU32::new(0),
            }
        }

        pub fn fail_next(&self, url: &str) {
            self.failing_urls.lock().unwrap().push(url.to_string());
        }
    }

    impl Default for SimulatedDecoderFactory {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl DecoderFactory for SimulatedDecoderFactory {
        async fn prepare(&self, stream_url: &str) -> Result<Box<dyn PreparedSource>, PlaybackError> {
            self.prepared_count.fetch_add(1, Ordering::SeqCst);
            let mut failing = self.failing_urls.lock().unwrap();
            if let Some(pos) = failing.iter().position(|url| url == stream_url) {
                failing.remove(pos);
                return Err(PlaybackError::Decoder {
                    message: format!("simulated failure preparing {stream_url}"),
                });
            }
            Ok(Box::new(SimulatedSource::new(stream_url)))
        }
    }

    pub fn arc_factory() -> Arc<SimulatedDecoderFactory> {
        Arc::new(SimulatedDecoderFactory::new())
    }
}
