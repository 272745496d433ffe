use std::{
    f32::consts::PI,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AnalyzerConfig, AvatarError, PlaybackHandle, Result};

/// Lower edge of the band counted by [`AnalysisDomain::Frequency`].
const VOICE_BAND_LOW_HZ: f32 = 80.0;
/// Upper edge of the band counted by [`AnalysisDomain::Frequency`].
const VOICE_BAND_HIGH_HZ: f32 = 4_000.0;

/// How a snapshot window is reduced to a loudness value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDomain {
    /// RMS of the raw samples.
    #[default]
    TimeDomain,
    /// RMS of the Hann-windowed spectrum restricted to the voice band, so
    /// rumble and hiss move the jaw less.
    Frequency,
}

/// Anything that can report the current normalised loudness.
///
/// Implementations must be cheap and must never block on I/O: the animation
/// loop polls them once per frame.
pub trait AmplitudeSource: Send + Sync {
    fn amplitude(&self) -> f32;
}

/// Turns the active playback into a `[0, 1]` loudness signal.
///
/// The tap, the scratch buffers and the smoothing state live behind a single
/// lock, so swapping the active handle is one step for every reader.
pub struct AmplitudeAnalyzer {
    config: AnalyzerConfig,
    state: Mutex<AnalyzerState>,
}

struct AnalyzerState {
    tap: Option<AnalyserTap>,
    window: Vec<f32>,
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

struct AnalyserTap {
    handle: PlaybackHandle,
    smoothed: f32,
}

impl AmplitudeAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            state: Mutex::new(AnalyzerState {
                tap: None,
                window: vec![0.0; config.window_size],
                planner: RealFftPlanner::new(),
                fft: None,
            }),
            config,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Replaces the tap in one step and returns the handle it was bound to.
    pub fn set_active_handle(
        &self,
        handle: Option<PlaybackHandle>,
    ) -> Result<Option<PlaybackHandle>> {
        let mut state = self.lock_state()?;
        let next = handle.map(|handle| AnalyserTap {
            handle,
            smoothed: 0.0,
        });
        let previous = std::mem::replace(&mut state.tap, next);
        if let Some(tap) = &state.tap {
            debug!(handle = tap.handle.id(), "analyzer tap attached");
        }
        Ok(previous.map(|tap| tap.handle))
    }

    /// Unbinds the tap; amplitude reads zero afterwards.
    pub fn detach(&self) -> Result<Option<PlaybackHandle>> {
        self.set_active_handle(None)
    }

    /// The handle the tap is bound to.
    pub fn active_handle(&self) -> Option<PlaybackHandle> {
        self.lock_state()
            .ok()
            .and_then(|state| state.tap.as_ref().map(|tap| tap.handle.clone()))
    }

    pub fn is_attached(&self) -> bool {
        self.lock_state()
            .map(|state| state.tap.is_some())
            .unwrap_or(false)
    }

    /// Current loudness in `[0, 1]`. Returns `0` when nothing is attached,
    /// when the attached playback has finished, or when analysis fails.
    pub fn get_amplitude(&self) -> f32 {
        let Ok(mut state) = self.lock_state() else {
            return 0.0;
        };
        match measure(&mut state, &self.config) {
            Ok(value) if value.is_finite() => value.clamp(0.0, 1.0),
            Ok(_) => 0.0,
            Err(e) => {
                debug!(error = %e, "amplitude analysis failed");
                0.0
            }
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, AnalyzerState>> {
        self.state
            .lock()
            .map_err(|_| AvatarError::msg("amplitude analyzer has been poisoned"))
    }
}

impl AmplitudeSource for AmplitudeAnalyzer {
    fn amplitude(&self) -> f32 {
        self.get_amplitude()
    }
}

/// A fixed level, for stills.
impl AmplitudeSource for f32 {
    fn amplitude(&self) -> f32 {
        self.clamp(0.0, 1.0)
    }
}

impl<T: AmplitudeSource + ?Sized> AmplitudeSource for Arc<T> {
    fn amplitude(&self) -> f32 {
        (**self).amplitude()
    }
}

fn measure(state: &mut AnalyzerState, config: &AnalyzerConfig) -> Result<f32> {
    let AnalyzerState {
        tap,
        window,
        planner,
        fft,
    } = state;

    let Some(active) = tap.as_mut() else {
        return Ok(0.0);
    };
    if active.handle.is_finished() {
        debug!(handle = active.handle.id(), "analyzer tap detached at end of playback");
        *tap = None;
        return Ok(0.0);
    }

    let audio = active.handle.audio();
    let end = audio.frame_at(active.handle.current_time());
    window.resize(config.window_size, 0.0);
    audio.mono_window_into(end, window);

    let raw = match config.domain {
        AnalysisDomain::TimeDomain => compute_rms(window),
        AnalysisDomain::Frequency => {
            let resources = prepare_fft(planner, fft, window.len());
            voice_band_rms(resources, window, audio.sample_rate as f32)?
        }
    };

    let level = (raw * config.gain).clamp(0.0, 1.0);
    let smoothing = config.smoothing.clamp(0.0, 0.999);
    active.smoothed = smoothing * active.smoothed + (1.0 - smoothing) * level;
    Ok(active.smoothed)
}

fn prepare_fft<'a>(
    planner: &mut RealFftPlanner<f32>,
    slot: &'a mut Option<FftResources>,
    size: usize,
) -> &'a mut FftResources {
    if slot.as_ref().map(|fft| fft.size != size).unwrap_or(false) {
        *slot = None;
    }
    slot.get_or_insert_with(|| {
        let plan = planner.plan_fft_forward(size);
        FftResources {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    })
}

fn voice_band_rms(fft: &mut FftResources, samples: &[f32], sample_rate: f32) -> Result<f32> {
    let len = samples.len();
    let mut window_energy = 0.0;
    for (index, value) in samples.iter().enumerate() {
        let w = hann_value(index, len);
        fft.input[index] = *value * w;
        window_energy += w * w;
    }
    if window_energy <= f32::EPSILON {
        return Ok(0.0);
    }

    fft.plan
        .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
        .map_err(|e| AvatarError::msg(format!("fft failed: {e}")))?;

    // Parseval over the half spectrum: interior bins stand in for their
    // mirrored negative-frequency twins.
    let bin_hz = sample_rate / len as f32;
    let nyquist_bin = len / 2;
    let mut energy = 0.0;
    for (k, bin) in fft.spectrum.iter().enumerate() {
        let hz = k as f32 * bin_hz;
        if !(VOICE_BAND_LOW_HZ..=VOICE_BAND_HIGH_HZ).contains(&hz) {
            continue;
        }
        let weight = if k == 0 || k == nyquist_bin { 1.0 } else { 2.0 };
        energy += weight * bin.norm_sqr();
    }

    Ok((energy / (len as f32 * window_energy)).sqrt())
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for AmplitudeAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmplitudeAnalyzer")
            .field("config", &self.config)
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{decode, playback::SilentOutput, source::fixtures::tone_source, AudioOutput, PlaybackClock};

    fn handle(seconds: f32, level: f32) -> PlaybackHandle {
        let source = tone_source(seconds, level);
        let audio = Arc::new(decode(&source).unwrap());
        let output = SilentOutput.open(&source).unwrap();
        let handle = PlaybackHandle::start(source, audio, PlaybackClock::manual(), output);
        handle.clock().advance(Duration::from_millis(500));
        handle
    }

    fn analyzer(gain: f32, domain: AnalysisDomain) -> AmplitudeAnalyzer {
        AmplitudeAnalyzer::new(AnalyzerConfig {
            gain,
            domain,
            ..Default::default()
        })
    }

    #[test]
    fn reads_zero_when_detached() {
        let analyzer = analyzer(4.0, AnalysisDomain::TimeDomain);
        assert_eq!(analyzer.get_amplitude(), 0.0);
        assert!(!analyzer.is_attached());
    }

    #[test]
    fn time_domain_tracks_rms() {
        let analyzer = analyzer(1.0, AnalysisDomain::TimeDomain);
        analyzer.set_active_handle(Some(handle(2.0, 0.5))).unwrap();

        let value = analyzer.get_amplitude();
        assert!((value - 0.5 / 2.0_f32.sqrt()).abs() < 0.02, "{value}");
    }

    #[test]
    fn frequency_domain_agrees_for_voice_band_tone() {
        let analyzer = analyzer(1.0, AnalysisDomain::Frequency);
        analyzer.set_active_handle(Some(handle(2.0, 0.5))).unwrap();

        let value = analyzer.get_amplitude();
        assert!((value - 0.5 / 2.0_f32.sqrt()).abs() < 0.05, "{value}");
    }

    #[test]
    fn output_is_clamped() {
        let analyzer = analyzer(1_000.0, AnalysisDomain::TimeDomain);
        analyzer.set_active_handle(Some(handle(2.0, 0.9))).unwrap();

        for _ in 0..3 {
            let value = analyzer.get_amplitude();
            assert!((0.0..=1.0).contains(&value));
            assert_eq!(value, 1.0);
        }
    }

    #[test]
    fn swapping_handles_drops_previous_signal() {
        let analyzer = analyzer(4.0, AnalysisDomain::TimeDomain);
        let loud = handle(2.0, 0.8);
        analyzer.set_active_handle(Some(loud.clone())).unwrap();
        assert!(analyzer.get_amplitude() > 0.5);

        let previous = analyzer
            .set_active_handle(Some(handle(2.0, 0.0)))
            .unwrap();
        assert_eq!(previous, Some(loud));
        assert_eq!(analyzer.get_amplitude(), 0.0);
    }

    #[test]
    fn finished_playback_detaches_tap() {
        let analyzer = analyzer(4.0, AnalysisDomain::TimeDomain);
        let playing = handle(1.0, 0.8);
        analyzer.set_active_handle(Some(playing.clone())).unwrap();
        assert!(analyzer.get_amplitude() > 0.0);

        playing.clock().advance(Duration::from_secs(1));
        assert_eq!(analyzer.get_amplitude(), 0.0);
        assert!(!analyzer.is_attached());
    }

    #[test]
    fn smoothing_state_starts_fresh_per_tap() {
        let analyzer = AmplitudeAnalyzer::new(AnalyzerConfig {
            gain: 1.0,
            smoothing: 0.5,
            ..Default::default()
        });
        analyzer.set_active_handle(Some(handle(2.0, 0.5))).unwrap();
        let first = analyzer.get_amplitude();
        let second = analyzer.get_amplitude();

        assert!(second > first);
        assert!((first - 0.5 * 0.5 / 2.0_f32.sqrt()).abs() < 0.02);
    }
}
