//! Audio block primitives shared by the runtime
//!
//! Frames, the mixer context every runtime is constructed with, the error
//! type of the real-time path and the level measurements used by the gate and
//! the auto-quit timer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while running an effect
#[derive(Debug, Error)]
pub enum EffectError {
    /// The effect's DSP hook reported a failure
    #[error("DSP fault in {effect}: {reason}")]
    DspFault { effect: String, reason: String },

    /// The effect's DSP hook panicked
    #[error("DSP panic in {0}")]
    DspPanic(String),

    /// The effect wrote NaN or infinity into the block
    #[error("Non-finite output from {0}")]
    NonFiniteOutput(String),

    /// Rate conversion failed
    #[error("Resampler error: {0}")]
    Resampler(String),

    /// A rate conversion was requested with a zero or negative ratio
    #[error("Degenerate resampling ratio: {src_rate}Hz -> {dst_rate}Hz")]
    DegenerateRatio { src_rate: u32, dst_rate: u32 },

    /// The host rate changed without a block-boundary notification
    #[error("Sample rate mismatch: runtime at {expected}Hz, resampler at {actual}Hz")]
    RateMismatch { expected: u32, actual: u32 },

    /// The block handed to the runtime does not have the period length
    #[error("Block size mismatch: expected {expected} frames, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    /// Invalid configuration for an effect or the runtime
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, EffectError>;

/// One stereo frame (left, right)
pub type Frame = [f32; 2];

/// A silent frame
pub const SILENCE: Frame = [0.0, 0.0];

/// Audio sample rate in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz22050,
    Hz44100,
    Hz48000,
    Hz88200,
    Hz96000,
    Hz192000,
    Custom(u32),
}

impl SampleRate {
    pub fn hz(&self) -> u32 {
        match self {
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Hz88200 => 88200,
            SampleRate::Hz96000 => 96000,
            SampleRate::Hz192000 => 192000,
            SampleRate::Custom(hz) => *hz,
        }
    }

    pub fn from_hz(hz: u32) -> Self {
        match hz {
            22050 => SampleRate::Hz22050,
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            88200 => SampleRate::Hz88200,
            96000 => SampleRate::Hz96000,
            192000 => SampleRate::Hz192000,
            hz => SampleRate::Custom(hz),
        }
    }
}

/// Processing parameters of the mixer that owns the chain
///
/// Injected into every runtime at construction and replaced only through an
/// explicit notification at a block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixerContext {
    pub processing_sample_rate: SampleRate,
    pub frames_per_period: usize,
}

impl MixerContext {
    pub fn new(processing_sample_rate: SampleRate, frames_per_period: usize) -> Self {
        Self {
            processing_sample_rate,
            frames_per_period,
        }
    }

    /// Processing rate in Hz
    pub fn sample_rate_hz(&self) -> u32 {
        self.processing_sample_rate.hz()
    }

    /// Convert a duration in milliseconds to a frame count at the processing rate
    pub fn ms_to_frames(&self, ms: u32) -> u64 {
        u64::from(ms) * u64::from(self.sample_rate_hz()) / 1000
    }
}

impl Default for MixerContext {
    fn default() -> Self {
        Self {
            processing_sample_rate: SampleRate::Hz48000,
            frames_per_period: 256,
        }
    }
}

/// Root-mean-square level over both channels of a block
pub fn rms(block: &[Frame]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = block.iter().map(|[l, r]| l * l + r * r).sum();
    (sum_sq / (block.len() * 2) as f32).sqrt()
}

/// Largest absolute sample value in a block
pub fn peak(block: &[Frame]) -> f32 {
    block
        .iter()
        .flat_map(|frame| frame.iter())
        .fold(0.0_f32, |acc, s| acc.max(s.abs()))
}

/// True when every sample in the block is finite
pub fn is_finite(block: &[Frame]) -> bool {
    block.iter().all(|[l, r]| l.is_finite() && r.is_finite())
}
