//! ReplayGain multiplier computation (§4.D). Pure and deterministic; metadata extraction from
//! audio files is out of scope, this only consumes what `Track` already carries.

use crate::models::{GainMode, Track};

/// Computes the linear gain multiplier to apply to a bound source before playback.
pub trait GainProvider: Send + Sync {
    fn gain_multiplier(
        &self,
        track: &Track,
        mode: GainMode,
        preamp_db: f32,
        prevent_clip: bool,
        fallback_gain_db: f32,
    ) -> f32;
}

/// Default `GainProvider`: reads `track_gain_db`/`album_gain_db` (and matching peak) straight
/// off the `Track`, falling back to `fallback_gain_db` and a peak of `1.0` when absent.
pub struct ReplayGainProvider;

impl GainProvider for ReplayGainProvider {
    fn gain_multiplier(
        &self,
        track: &Track,
        mode: GainMode,
        preamp_db: f32,
        prevent_clip: bool,
        fallback_gain_db: f32,
    ) -> f32 {
        if mode == GainMode::Off {
            return 1.0;
        }

        let (gain_db, peak) = match mode {
            GainMode::Track => (
                track.track_gain_db.unwrap_or(fallback_gain_db),
                track.track_peak.unwrap_or(1.0),
            ),
            GainMode::Album => (
                track.album_gain_db.unwrap_or(fallback_gain_db),
                track.album_peak.unwrap_or(1.0),
            ),
            GainMode::Off => unreachable!(),
        };

        let mut mult = 10f32.powf((gain_db + preamp_db) / 20.0);
        if prevent_clip && peak * mult > 1.0 {
            mult = 1.0 / peak;
        }
        mult
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_with_gain(track_gain_db: Option<f32>, track_peak: Option<f32>) -> Track {
        Track {
            track_id: "t1".into(),
            title: "Title".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            album_id: "a1".into(),
            cover_art_id: None,
            duration_s: 200,
            track_number: Some(1),
            mime: "audio/flac".into(),
            track_gain_db,
            album_gain_db: None,
            track_peak,
            album_peak: None,
        }
    }

    #[test]
    fn test_off_mode_returns_unity_gain() {
        let provider = ReplayGainProvider;
        let track = track_with_gain(Some(-6.0), Some(0.9));
        assert_eq!(provider.gain_multiplier(&track, GainMode::Off, 0.0, true, -6.0), 1.0);
    }

    #[test]
    fn test_track_mode_applies_db_to_linear_conversion() {
        let provider = ReplayGainProvider;
        let track = track_with_gain(Some(-6.0), Some(0.5));
        let mult = provider.gain_multiplier(&track, GainMode::Track, 0.0, true, -6.0);
        let expected = 10f32.powf(-6.0 / 20.0);
        assert!((mult - expected).abs() < 1e-5);
    }

    #[test]
    fn test_clip_prevention_clamps_to_inverse_peak() {
        let provider = ReplayGainProvider;
        // +6 dB with a peak of 0.9 would push the signal past digital full scale.
        let track = track_with_gain(Some(6.0), Some(0.9));
        let mult = provider.gain_multiplier(&track, GainMode::Track, 0.0, true, -6.0);
        assert!((mult - (1.0 / 0.9)).abs() < 1e-5);
    }

    #[test]
    fn test_missing_metadata_falls_back() {
        let provider = ReplayGainProvider;
        let track = track_with_gain(None, None);
        let mult = provider.gain_multiplier(&track, GainMode::Track, 0.0, true, -6.0);
        let expected = 10f32.powf(-6.0 / 20.0);
        assert!((mult - expected).abs() < 1e-5);
    }
}
