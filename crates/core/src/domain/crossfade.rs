//! Wet/dry crossfade coefficients
//!
//! Every block carries at most one ramp: a ramp-in on the first active block
//! (`smooth_begin`) or a ramp-out on the last one (`smooth_end`). The ramp is
//! linear over the block so the transition never produces a step.

use crate::domain::audio::Frame;
use crate::domain::automation::Parameter;

/// Ramp flags of one block; never both set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmoothingFlags {
    smooth_begin: bool,
    smooth_end: bool,
}

impl SmoothingFlags {
    /// No ramp
    pub const NONE: Self = Self {
        smooth_begin: false,
        smooth_end: false,
    };

    /// Ramp the wet signal in across the block
    pub const BEGIN: Self = Self {
        smooth_begin: true,
        smooth_end: false,
    };

    /// Ramp the wet signal out across the block
    pub const END: Self = Self {
        smooth_begin: false,
        smooth_end: true,
    };

    pub fn smooth_begin(&self) -> bool {
        self.smooth_begin
    }

    pub fn smooth_end(&self) -> bool {
        self.smooth_end
    }

    pub fn is_ramp(&self) -> bool {
        self.smooth_begin || self.smooth_end
    }
}

/// Per-frame mix coefficients; `dry + wet == 1` on each side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixCoefficients {
    pub dry_left: f32,
    pub wet_left: f32,
    pub dry_right: f32,
    pub wet_right: f32,
}

impl MixCoefficients {
    /// Dry signal only
    pub const DRY: Self = Self {
        dry_left: 1.0,
        wet_left: 0.0,
        dry_right: 1.0,
        wet_right: 0.0,
    };

    /// Blend a dry and a processed frame
    #[inline]
    pub fn apply(&self, dry: Frame, wet: Frame) -> Frame {
        [
            self.dry_left * dry[0] + self.wet_left * wet[0],
            self.dry_right * dry[1] + self.wet_right * wet[1],
        ]
    }
}

/// Computes coefficients for one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossfadeComputer {
    frames: usize,
    flags: SmoothingFlags,
    forced_dry: bool,
}

impl CrossfadeComputer {
    pub fn new(frames: usize, flags: SmoothingFlags) -> Self {
        Self {
            frames,
            flags,
            forced_dry: false,
        }
    }

    /// Computer that yields dry-only coefficients (disabled or gate closed)
    pub fn forced_dry(frames: usize) -> Self {
        Self {
            frames,
            flags: SmoothingFlags::NONE,
            forced_dry: true,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn flags(&self) -> SmoothingFlags {
        self.flags
    }

    pub fn is_forced_dry(&self) -> bool {
        self.forced_dry
    }

    /// Ramp factor in `[0, 1]` for frame `frame`
    #[inline]
    pub fn ramp(&self, frame: usize) -> f32 {
        if self.frames == 0 {
            return 1.0;
        }
        let n = self.frames as f32;
        if self.flags.smooth_begin {
            (frame + 1) as f32 / n
        } else if self.flags.smooth_end {
            (self.frames.saturating_sub(frame)) as f32 / n
        } else {
            1.0
        }
    }

    /// Coefficients for frame `frame` given the wet level of each side
    #[inline]
    pub fn coefficients(&self, frame: usize, wet_left: f32, wet_right: f32) -> MixCoefficients {
        if self.forced_dry {
            return MixCoefficients::DRY;
        }
        let ramp = self.ramp(frame);
        let wet_left = (wet_left.clamp(0.0, 1.0) * ramp).clamp(0.0, 1.0);
        let wet_right = (wet_right.clamp(0.0, 1.0) * ramp).clamp(0.0, 1.0);
        MixCoefficients {
            dry_left: 1.0 - wet_left,
            wet_left,
            dry_right: 1.0 - wet_right,
            wet_right,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WetSource<'a> {
    Parameter(&'a Parameter),
    Fixed(f32),
}

/// What an effect's DSP hook receives to blend its output
///
/// Combines the block's ramp with the (possibly automated) wet level.
#[derive(Debug, Clone, Copy)]
pub struct Crossfade<'a> {
    computer: CrossfadeComputer,
    wet: WetSource<'a>,
}

impl<'a> Crossfade<'a> {
    pub fn new(computer: CrossfadeComputer, wet: &'a Parameter) -> Self {
        Self {
            computer,
            wet: WetSource::Parameter(wet),
        }
    }

    /// Constant wet level, no ramp
    pub fn with_level(frames: usize, wet: f32) -> Self {
        Self {
            computer: CrossfadeComputer::new(frames, SmoothingFlags::NONE),
            wet: WetSource::Fixed(wet),
        }
    }

    /// Fully processed output, used when the runtime mixes after resampling
    pub fn fully_wet(frames: usize) -> Self {
        Self::with_level(frames, 1.0)
    }

    pub fn frames(&self) -> usize {
        self.computer.frames()
    }

    pub fn flags(&self) -> SmoothingFlags {
        self.computer.flags()
    }

    /// Wet level before the ramp is applied
    #[inline]
    pub fn wet_level(&self, frame: usize) -> f32 {
        match self.wet {
            WetSource::Parameter(parameter) => parameter.value_at(frame),
            WetSource::Fixed(level) => level,
        }
    }

    #[inline]
    pub fn at(&self, frame: usize) -> MixCoefficients {
        let wet = self.wet_level(frame);
        self.computer.coefficients(frame, wet, wet)
    }

    /// Blend `dry` and `wet` for frame `frame`
    #[inline]
    pub fn mix(&self, frame: usize, dry: Frame, wet: Frame) -> Frame {
        self.at(frame).apply(dry, wet)
    }
}
