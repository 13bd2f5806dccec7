//! Windowed-sinc rate conversion via rubato
//!
//! [`SincConverter`] adapts rubato's fixed-output sinc resampler to the
//! block-synchronous [`RateConverter`] contract: every call consumes one host
//! block and yields exactly one block at the other rate. Input is staged in a
//! preallocated planar FIFO that starts pre-filled with silence, so the
//! resampler never starves and the converter never allocates after
//! construction.

use fxrack_core::domain::audio::{EffectError, Frame, Result};
use fxrack_core::domain::resampler::{ConverterFactory, RateConverter};
use rubato::{
    Resampler, SincFixedOut, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{debug, trace};

const CHANNELS: usize = 2;

/// Sinc kernel settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SincQuality {
    pub sinc_len: usize,
    pub f_cutoff: f32,
    pub oversampling_factor: usize,
}

impl Default for SincQuality {
    fn default() -> Self {
        Self {
            sinc_len: 128,
            f_cutoff: 0.95,
            oversampling_factor: 128,
        }
    }
}

impl SincQuality {
    fn parameters(&self) -> SincInterpolationParameters {
        SincInterpolationParameters {
            sinc_len: self.sinc_len,
            f_cutoff: self.f_cutoff,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: self.oversampling_factor,
            window: WindowFunction::BlackmanHarris2,
        }
    }
}

/// One direction of sinc conversion with a fixed block geometry
pub struct SincConverter {
    resampler: SincFixedOut<f32>,
    fifo: [Vec<f32>; CHANNELS],
    filled: usize,
    primed_frames: usize,
    staged: [Vec<f32>; CHANNELS],
    input_frames: usize,
    output_frames: usize,
}

impl std::fmt::Debug for SincConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SincConverter")
            .field("input_frames", &self.input_frames)
            .field("output_frames", &self.output_frames)
            .field("filled", &self.filled)
            .finish()
    }
}

impl SincConverter {
    /// Converter turning `input_frames` into `output_frames` per call
    ///
    /// The ratio is the block ratio, so the FIFO level stays bounded whatever
    /// rounding went into the block lengths.
    pub fn new(input_frames: usize, output_frames: usize, quality: SincQuality) -> Result<Self> {
        if input_frames == 0 || output_frames == 0 {
            return Err(EffectError::InvalidConfiguration(format!(
                "sinc converter needs non-empty blocks, got {input_frames} -> {output_frames}"
            )));
        }

        let ratio = output_frames as f64 / input_frames as f64;
        let resampler =
            SincFixedOut::<f32>::new(ratio, 1.1, quality.parameters(), output_frames, CHANNELS)
                .map_err(|e| EffectError::Resampler(e.to_string()))?;

        let primed_frames = resampler.input_frames_max();
        let capacity = primed_frames + 2 * input_frames.max(resampler.input_frames_max());
        let staged_len = resampler.output_frames_max();

        debug!(
            input_frames,
            output_frames,
            ratio,
            primed_frames,
            "sinc converter created"
        );

        Ok(Self {
            resampler,
            fifo: [vec![0.0; capacity], vec![0.0; capacity]],
            filled: primed_frames,
            primed_frames,
            staged: [vec![0.0; staged_len], vec![0.0; staged_len]],
            input_frames,
            output_frames,
        })
    }

    fn push(&mut self, input: &[Frame]) {
        let capacity = self.fifo[0].len();
        let overflow = (self.filled + input.len()).saturating_sub(capacity);
        if overflow > 0 {
            // Oldest frames go first
            for channel in self.fifo.iter_mut() {
                channel.copy_within(overflow..self.filled, 0);
            }
            self.filled -= overflow;
            trace!(overflow, "sinc FIFO overflow");
        }

        let start = self.filled;
        for (i, frame) in input.iter().enumerate() {
            self.fifo[0][start + i] = frame[0];
            self.fifo[1][start + i] = frame[1];
        }
        self.filled += input.len();
    }

    fn consume(&mut self, frames: usize) {
        let frames = frames.min(self.filled);
        for channel in self.fifo.iter_mut() {
            channel.copy_within(frames..self.filled, 0);
        }
        self.filled -= frames;
    }
}

impl RateConverter for SincConverter {
    fn process(&mut self, input: &[Frame], output: &mut [Frame]) -> Result<()> {
        self.push(input);

        let needed = self.resampler.input_frames_next();
        if self.filled < needed {
            trace!(filled = self.filled, needed, "sinc FIFO priming");
            output.fill([0.0, 0.0]);
            return Ok(());
        }

        let wave_in = [&self.fifo[0][..self.filled], &self.fifo[1][..self.filled]];
        let (used, written) = self
            .resampler
            .process_into_buffer(&wave_in, &mut self.staged, None)
            .map_err(|e| EffectError::Resampler(e.to_string()))?;
        self.consume(used);

        let frames = written.min(output.len());
        for (k, out) in output[..frames].iter_mut().enumerate() {
            *out = [self.staged[0][k], self.staged[1][k]];
        }
        output[frames..].fill([0.0, 0.0]);
        Ok(())
    }

    fn reset(&mut self) {
        self.resampler.reset();
        for channel in self.fifo.iter_mut() {
            channel.fill(0.0);
        }
        self.filled = self.primed_frames;
    }

    fn latency_frames(&self) -> usize {
        let ratio = self.output_frames as f64 / self.input_frames as f64;
        (self.primed_frames as f64 * ratio).round() as usize + self.resampler.output_delay()
    }
}

/// Builds [`SincConverter`]s for the resampler context
#[derive(Debug, Clone, Copy, Default)]
pub struct SincFactory {
    quality: SincQuality,
}

impl SincFactory {
    pub fn new(quality: SincQuality) -> Self {
        Self { quality }
    }
}

impl ConverterFactory for SincFactory {
    fn build(
        &self,
        _src_rate: u32,
        _dst_rate: u32,
        input_frames: usize,
        output_frames: usize,
    ) -> Result<Box<dyn RateConverter>> {
        Ok(Box::new(SincConverter::new(
            input_frames,
            output_frames,
            self.quality,
        )?))
    }

    fn name(&self) -> &str {
        "sinc"
    }
}
