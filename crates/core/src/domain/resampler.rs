//! Rate conversion between the mixer and an effect's internal rate
//!
//! Effects that want to run at their own rate get a [`ResamplerContext`]: a
//! down converter (host → internal), an up converter (internal → host) and a
//! preallocated internal block. Converter state persists from block to
//! block; only [`ResamplerContext::reinitialize`] (sent on a mixer rate
//! change) resets it.

use crate::domain::audio::{EffectError, Frame, Result, SILENCE};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stateful streaming converter for one direction
pub trait RateConverter: Send {
    /// Convert `input` into exactly `output.len()` frames
    ///
    /// Must not allocate; state carries over to the next call.
    fn process(&mut self, input: &[Frame], output: &mut [Frame]) -> Result<()>;

    /// Drop all history
    fn reset(&mut self);

    /// Delay introduced by the converter, in output frames
    fn latency_frames(&self) -> usize {
        0
    }
}

/// Builds converters for a given direction and block geometry
pub trait ConverterFactory: Send + Sync {
    fn build(
        &self,
        src_rate: u32,
        dst_rate: u32,
        input_frames: usize,
        output_frames: usize,
    ) -> Result<Box<dyn RateConverter>>;

    fn name(&self) -> &str;
}

/// Block-synchronous linear interpolation
///
/// Output frame `k` of an `n_in → n_out` call sits at input position
/// `(k + 1) * n_in / n_out - 1`, so the last output frame always lands on the
/// last input frame. Positions before the first input frame interpolate from
/// the previous call's last frame, which keeps consecutive blocks continuous.
#[derive(Debug, Clone, Default)]
pub struct LinearConverter {
    history: Frame,
}

impl LinearConverter {
    pub fn new() -> Self {
        Self { history: SILENCE }
    }
}

impl RateConverter for LinearConverter {
    fn process(&mut self, input: &[Frame], output: &mut [Frame]) -> Result<()> {
        if input.is_empty() {
            output.fill(self.history);
            return Ok(());
        }
        if output.is_empty() {
            self.history = input[input.len() - 1];
            return Ok(());
        }

        let last = input.len() - 1;
        let step = input.len() as f64 / output.len() as f64;

        for (k, out) in output.iter_mut().enumerate() {
            let pos = (k + 1) as f64 * step - 1.0;
            let (a, b, t) = if pos < 0.0 {
                (self.history, input[0], (pos + 1.0) as f32)
            } else {
                let i = (pos.floor() as usize).min(last);
                (input[i], input[(i + 1).min(last)], (pos - i as f64) as f32)
            };
            *out = [a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1])];
        }

        self.history = input[last];
        Ok(())
    }

    fn reset(&mut self) {
        self.history = SILENCE;
    }
}

/// Factory for [`LinearConverter`]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearFactory;

impl ConverterFactory for LinearFactory {
    fn build(
        &self,
        src_rate: u32,
        dst_rate: u32,
        _input_frames: usize,
        _output_frames: usize,
    ) -> Result<Box<dyn RateConverter>> {
        ResamplerContext::check_ratio(src_rate, dst_rate)?;
        Ok(Box::new(LinearConverter::new()))
    }

    fn name(&self) -> &str {
        "linear"
    }
}

/// Down/up converter pair plus the internal block of one effect
pub struct ResamplerContext {
    factory: Arc<dyn ConverterFactory>,
    host_rate: u32,
    internal_rate: u32,
    host_frames: usize,
    internal_frames: usize,
    okay: bool,
    down: Box<dyn RateConverter>,
    up: Box<dyn RateConverter>,
    internal: Vec<Frame>,
}

impl fmt::Debug for ResamplerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResamplerContext")
            .field("backend", &self.factory.name())
            .field("host_rate", &self.host_rate)
            .field("internal_rate", &self.internal_rate)
            .field("host_frames", &self.host_frames)
            .field("internal_frames", &self.internal_frames)
            .field("okay", &self.okay)
            .finish()
    }
}

impl ResamplerContext {
    /// Build a context; a degenerate ratio yields a not-okay passthrough context
    pub fn new(
        factory: Arc<dyn ConverterFactory>,
        host_rate: u32,
        internal_rate: u32,
        host_frames: usize,
    ) -> Self {
        let mut context = Self {
            factory,
            host_rate,
            internal_rate,
            host_frames,
            internal_frames: host_frames,
            okay: false,
            down: Box::new(LinearConverter::new()),
            up: Box::new(LinearConverter::new()),
            internal: Vec::new(),
        };
        context.build();
        context
    }

    /// Context using [`LinearConverter`] in both directions
    pub fn linear(host_rate: u32, internal_rate: u32, host_frames: usize) -> Self {
        Self::new(Arc::new(LinearFactory), host_rate, internal_rate, host_frames)
    }

    /// Internal block length for a host block: `round(n * internal / host)`, at least 1
    pub fn internal_frames_for(host_rate: u32, internal_rate: u32, host_frames: usize) -> usize {
        if host_rate == 0 || internal_rate == 0 {
            return host_frames;
        }
        let frames = (host_frames as f64 * f64::from(internal_rate) / f64::from(host_rate)).round();
        (frames as usize).max(1)
    }

    /// Reject a conversion between rates where either side is zero
    pub fn check_ratio(src_rate: u32, dst_rate: u32) -> Result<()> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(EffectError::DegenerateRatio { src_rate, dst_rate });
        }
        Ok(())
    }

    fn build(&mut self) {
        if let Err(e) = Self::check_ratio(self.host_rate, self.internal_rate) {
            warn!(error = %e, "effect will be bypassed");
            self.okay = false;
            self.internal_frames = self.host_frames;
            self.internal = vec![SILENCE; self.host_frames];
            return;
        }

        self.internal_frames =
            Self::internal_frames_for(self.host_rate, self.internal_rate, self.host_frames);
        self.internal = vec![SILENCE; self.internal_frames];

        let down = self.factory.build(
            self.host_rate,
            self.internal_rate,
            self.host_frames,
            self.internal_frames,
        );
        let up = self.factory.build(
            self.internal_rate,
            self.host_rate,
            self.internal_frames,
            self.host_frames,
        );

        match (down, up) {
            (Ok(down), Ok(up)) => {
                self.down = down;
                self.up = up;
                self.okay = true;
                info!(
                    backend = self.factory.name(),
                    host_rate = self.host_rate,
                    internal_rate = self.internal_rate,
                    host_frames = self.host_frames,
                    internal_frames = self.internal_frames,
                    "resampler initialized"
                );
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to build rate converters, effect will be bypassed");
                self.okay = false;
            }
        }
    }

    /// Rebuild both directions for a new host rate or period
    ///
    /// Allocates; only called from a rate-change notification, never from the
    /// audio callback.
    pub fn reinitialize(&mut self, host_rate: u32, host_frames: usize) {
        debug!(
            old_rate = self.host_rate,
            new_rate = host_rate,
            host_frames,
            "reinitializing resampler"
        );
        self.host_rate = host_rate;
        self.host_frames = host_frames;
        self.build();
    }

    pub fn is_okay(&self) -> bool {
        self.okay
    }

    pub fn host_rate(&self) -> u32 {
        self.host_rate
    }

    pub fn internal_rate(&self) -> u32 {
        self.internal_rate
    }

    pub fn internal_frames(&self) -> usize {
        self.internal_frames
    }

    /// `internal / host`, or 0 when degenerate
    pub fn ratio(&self) -> f64 {
        if self.host_rate == 0 || self.internal_rate == 0 {
            0.0
        } else {
            f64::from(self.internal_rate) / f64::from(self.host_rate)
        }
    }

    /// Round-trip delay in host frames
    pub fn latency_frames(&self) -> usize {
        let down = (self.down.latency_frames() as f64 / self.ratio().max(f64::MIN_POSITIVE)).round();
        down as usize + self.up.latency_frames()
    }

    /// Convert a host block into the internal block and return it
    ///
    /// `n` is the expected internal frame count. A not-okay context copies
    /// the input through unchanged.
    pub fn downsample(
        &mut self,
        src: &[Frame],
        src_rate: u32,
        dst_rate: u32,
        n: usize,
    ) -> Result<&mut [Frame]> {
        if !self.okay {
            let len = src.len().min(self.internal.len());
            self.internal[..len].copy_from_slice(&src[..len]);
            return Ok(&mut self.internal[..len]);
        }
        if src_rate != self.host_rate || dst_rate != self.internal_rate {
            return Err(EffectError::RateMismatch {
                expected: self.host_rate,
                actual: src_rate,
            });
        }
        if n != self.internal_frames || src.len() != self.host_frames {
            return Err(EffectError::BlockSizeMismatch {
                expected: self.host_frames,
                actual: src.len(),
            });
        }

        self.down.process(src, &mut self.internal)?;
        Ok(&mut self.internal)
    }

    /// Convert the internal block back into `dst` at the host rate
    pub fn upsample(&mut self, src_rate: u32, dst_rate: u32, dst: &mut [Frame]) -> Result<()> {
        if !self.okay {
            let len = dst.len().min(self.internal.len());
            dst[..len].copy_from_slice(&self.internal[..len]);
            return Ok(());
        }
        if src_rate != self.internal_rate || dst_rate != self.host_rate {
            return Err(EffectError::RateMismatch {
                expected: self.internal_rate,
                actual: src_rate,
            });
        }
        if dst.len() != self.host_frames {
            return Err(EffectError::BlockSizeMismatch {
                expected: self.host_frames,
                actual: dst.len(),
            });
        }

        self.up.process(&self.internal, dst)
    }

    /// Clear converter history without changing the geometry
    pub fn reset(&mut self) {
        self.down.reset();
        self.up.reset();
        self.internal.fill(SILENCE);
    }
}
