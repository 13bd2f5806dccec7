//! Reference effects driven by the runtime
//!
//! This module provides:
//! - Amplifier with per-frame automated gain
//! - Biquad filter (low shelf, high shelf, peaking), optionally at its own rate
//! - Analyzer, an always-on level meter
//! - [`EffectKind`], the serializable description the chain is built from
//!
//! Every effect blends its own output with the coefficients the runtime hands
//! it, and none of them allocates in `run_dsp`.

use crate::domain::audio::{self, EffectError, Frame, Result};
use crate::domain::automation::{Parameter, ParameterHandle, ParameterSet, SineLfo};
use crate::domain::crossfade::Crossfade;
use crate::domain::runtime::AudioEffect;
use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Parameter limits shared by the reference effects
pub mod params {
    /// Linear gain range of the amplifier
    pub const GAIN_MIN: f32 = 0.0;
    pub const GAIN_MAX: f32 = 4.0;

    /// Filter boost/cut range in decibels
    pub const FILTER_DB_MIN: f32 = -12.0;
    pub const FILTER_DB_MAX: f32 = 12.0;

    pub const FREQ_MIN: f32 = 10.0;
    pub const Q_MIN: f32 = 0.1;
    pub const Q_MAX: f32 = 10.0;
}

// ============================================================================
// BIQUAD
// ============================================================================

/// Response shape of a [`BiquadCoeffs`] design
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterShape {
    LowShelf,
    HighShelf,
    Peaking,
}

/// Normalized biquad coefficients (`a0 == 1`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BiquadCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl BiquadCoeffs {
    /// Audio EQ cookbook design
    ///
    /// `freq` is kept below Nyquist and `gain_db` within +/- 12dB.
    #[must_use]
    pub fn design(shape: FilterShape, sample_rate: f32, freq: f32, gain_db: f32, q: f32) -> Self {
        let gain_db = gain_db.clamp(params::FILTER_DB_MIN, params::FILTER_DB_MAX);
        let freq = freq.clamp(params::FREQ_MIN, (sample_rate * 0.49).max(params::FREQ_MIN));
        let q = q.clamp(params::Q_MIN, params::Q_MAX);

        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = std::f32::consts::TAU * freq / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);
        let shelf = 2.0 * a.sqrt() * alpha;

        let (b0, b1, b2, a0, a1, a2) = match shape {
            FilterShape::LowShelf => (
                a * ((a + 1.0) - (a - 1.0) * cos_w0 + shelf),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
                a * ((a + 1.0) - (a - 1.0) * cos_w0 - shelf),
                (a + 1.0) + (a - 1.0) * cos_w0 + shelf,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
                (a + 1.0) + (a - 1.0) * cos_w0 - shelf,
            ),
            FilterShape::HighShelf => (
                a * ((a + 1.0) + (a - 1.0) * cos_w0 + shelf),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0),
                a * ((a + 1.0) + (a - 1.0) * cos_w0 - shelf),
                (a + 1.0) - (a - 1.0) * cos_w0 + shelf,
                2.0 * ((a - 1.0) - (a + 1.0) * cos_w0),
                (a + 1.0) - (a - 1.0) * cos_w0 - shelf,
            ),
            FilterShape::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos_w0,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w0,
                1.0 - alpha / a,
            ),
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Direct Form I state for one channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    #[inline]
    fn tick(&mut self, c: &BiquadCoeffs, x: f32) -> f32 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

// ============================================================================
// AMPLIFIER
// ============================================================================

/// Serializable amplifier settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmplifierParams {
    /// Linear gain
    pub gain: f32,
    /// Tremolo rate; 0 keeps the gain static
    pub lfo_rate_hz: f32,
    pub lfo_depth: f32,
}

impl Default for AmplifierParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            lfo_rate_hz: 0.0,
            lfo_depth: 0.0,
        }
    }
}

/// Gain stage; the gain is a smoothed, optionally LFO-driven parameter
#[derive(Debug)]
pub struct Amplifier {
    params: AmplifierParams,
    gain: Parameter,
}

impl Amplifier {
    pub fn new(params: AmplifierParams, sample_rate: u32, frames: usize) -> Self {
        let mut amplifier = Self {
            params,
            gain: Parameter::new("gain", params.gain, params::GAIN_MIN, params::GAIN_MAX, frames)
                .with_smoothing(true),
        };
        amplifier.attach_lfo(sample_rate);
        amplifier
    }

    fn attach_lfo(&mut self, sample_rate: u32) {
        if self.params.lfo_rate_hz > 0.0 && self.params.lfo_depth > 0.0 {
            self.gain.set_modulation(Some(Box::new(SineLfo::new(
                self.params.gain,
                self.params.lfo_depth,
                self.params.lfo_rate_hz,
                sample_rate,
            ))));
        }
    }

    /// Handle for automating the gain from a control thread
    pub fn gain_handle(&self) -> ParameterHandle {
        self.gain.handle()
    }
}

impl AudioEffect for Amplifier {
    fn name(&self) -> &str {
        "Amplifier"
    }

    fn run_dsp(&mut self, block: &mut [Frame], crossfade: &Crossfade<'_>) -> Result<bool> {
        for (f, frame) in block.iter_mut().enumerate() {
            let gain = self.gain.value_at(f);
            *frame = crossfade.mix(f, *frame, [frame[0] * gain, frame[1] * gain]);
        }
        Ok(true)
    }

    fn prepare(&mut self, sample_rate: u32, frames: usize) {
        self.gain.prepare(frames);
        self.attach_lfo(sample_rate);
    }

    fn parameters(&mut self) -> Option<&mut dyn ParameterSet> {
        Some(&mut self.gain)
    }
}

// ============================================================================
// FILTER
// ============================================================================

/// Serializable filter settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub shape: FilterShape,
    pub frequency: f32,
    #[serde(default)]
    pub gain_db: f32,
    #[serde(default = "FilterParams::default_q")]
    pub q: f32,
    /// Run the filter at this rate instead of the host rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_rate: Option<u32>,
}

impl FilterParams {
    fn default_q() -> f32 {
        0.707
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            shape: FilterShape::Peaking,
            frequency: 1000.0,
            gain_db: 0.0,
            q: Self::default_q(),
            internal_rate: None,
        }
    }
}

/// Stereo biquad
#[derive(Debug, Clone)]
pub struct Filter {
    params: FilterParams,
    coeffs: BiquadCoeffs,
    left: BiquadState,
    right: BiquadState,
}

impl Filter {
    pub fn new(params: FilterParams, sample_rate: u32) -> Self {
        let mut filter = Self {
            params,
            coeffs: BiquadCoeffs::default(),
            left: BiquadState::default(),
            right: BiquadState::default(),
        };
        filter.redesign(sample_rate);
        filter
    }

    pub fn params(&self) -> FilterParams {
        self.params
    }

    fn redesign(&mut self, sample_rate: u32) {
        self.coeffs = BiquadCoeffs::design(
            self.params.shape,
            sample_rate.max(1) as f32,
            self.params.frequency,
            self.params.gain_db,
            self.params.q,
        );
    }
}

impl AudioEffect for Filter {
    fn name(&self) -> &str {
        "Filter"
    }

    fn run_dsp(&mut self, block: &mut [Frame], crossfade: &Crossfade<'_>) -> Result<bool> {
        for (f, frame) in block.iter_mut().enumerate() {
            let wet = [
                self.left.tick(&self.coeffs, frame[0]),
                self.right.tick(&self.coeffs, frame[1]),
            ];
            *frame = crossfade.mix(f, *frame, wet);
        }
        Ok(true)
    }

    fn reset(&mut self) {
        self.left = BiquadState::default();
        self.right = BiquadState::default();
    }

    fn prepare(&mut self, sample_rate: u32, _frames: usize) {
        self.redesign(sample_rate);
        self.reset();
    }

    fn internal_sample_rate(&self, _host_rate: u32) -> Option<u32> {
        self.params.internal_rate
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerParams {
    /// Per-block decay of the held peak, in `[0, 1)`
    pub peak_decay: f32,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self { peak_decay: 0.9 }
    }
}

/// Latest analyzer measurements
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelReading {
    pub rms: f32,
    pub peak: f32,
}

/// Passes audio through unchanged and publishes levels
///
/// Never wants to auto-quit: a meter that sleeps shows stale levels.
#[derive(Debug)]
pub struct Analyzer {
    params: AnalyzerParams,
    held_peak: f32,
    reading: Arc<AtomicCell<LevelReading>>,
}

impl Analyzer {
    pub fn new(params: AnalyzerParams) -> Self {
        Self {
            params,
            held_peak: 0.0,
            reading: Arc::new(AtomicCell::new(LevelReading::default())),
        }
    }

    /// Shared cell the analyzer writes its readings to
    pub fn reading(&self) -> Arc<AtomicCell<LevelReading>> {
        Arc::clone(&self.reading)
    }
}

impl AudioEffect for Analyzer {
    fn name(&self) -> &str {
        "Analyzer"
    }

    fn run_dsp(&mut self, block: &mut [Frame], _crossfade: &Crossfade<'_>) -> Result<bool> {
        let rms = audio::rms(block);
        self.held_peak = audio::peak(block).max(self.held_peak * self.params.peak_decay);
        self.reading.store(LevelReading {
            rms,
            peak: self.held_peak,
        });
        trace!(rms, peak = self.held_peak, "analyzer reading");
        Ok(true)
    }

    fn reset(&mut self) {
        self.held_peak = 0.0;
        self.reading.store(LevelReading::default());
    }

    fn wants_auto_quit(&self) -> bool {
        false
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Serializable description of an effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum EffectKind {
    Amplifier(AmplifierParams),
    Filter(FilterParams),
    Analyzer(AnalyzerParams),
}

impl EffectKind {
    pub fn name(&self) -> &str {
        match self {
            EffectKind::Amplifier(_) => "Amplifier",
            EffectKind::Filter(_) => "Filter",
            EffectKind::Analyzer(_) => "Analyzer",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EffectError::InvalidConfiguration(msg));
        match self {
            EffectKind::Amplifier(p) => {
                if !(params::GAIN_MIN..=params::GAIN_MAX).contains(&p.gain) {
                    return invalid(format!("amplifier gain {} out of range", p.gain));
                }
                if p.lfo_rate_hz < 0.0 || p.lfo_depth < 0.0 {
                    return invalid("amplifier LFO rate and depth must be positive".to_string());
                }
            }
            EffectKind::Filter(p) => {
                if !(p.frequency.is_finite() && p.frequency >= params::FREQ_MIN) {
                    return invalid(format!("filter frequency {} too low", p.frequency));
                }
                if !(params::Q_MIN..=params::Q_MAX).contains(&p.q) {
                    return invalid(format!("filter q {} out of range", p.q));
                }
                if p.internal_rate == Some(0) {
                    return invalid("filter internal rate must be non-zero".to_string());
                }
            }
            EffectKind::Analyzer(p) => {
                if !(0.0..1.0).contains(&p.peak_decay) {
                    return invalid(format!("analyzer peak decay {} must be in [0, 1)", p.peak_decay));
                }
            }
        }
        Ok(())
    }
}

/// Builds boxed effects from their description
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectFactory;

impl EffectFactory {
    pub fn build(&self, kind: &EffectKind, sample_rate: u32, frames: usize) -> Result<Box<dyn AudioEffect>> {
        kind.validate()?;
        let effect: Box<dyn AudioEffect> = match kind {
            EffectKind::Amplifier(params) => Box::new(Amplifier::new(*params, sample_rate, frames)),
            EffectKind::Filter(params) => Box::new(Filter::new(*params, sample_rate)),
            EffectKind::Analyzer(params) => Box::new(Analyzer::new(*params)),
        };
        Ok(effect)
    }
}
