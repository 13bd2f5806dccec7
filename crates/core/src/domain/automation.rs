//! Per-frame parameter values
//!
//! A [`Parameter`] yields either one scalar for the whole block or a
//! [`ValueBuffer`] with one value per frame. DSP code reads both through
//! [`Parameter::value_at`] and never needs to know which one it got.
//!
//! Values are published from control threads through a [`ParameterHandle`]
//! and latched by the audio thread in [`Parameter::begin_block`], so a block
//! always sees one consistent value set.

use crossbeam::atomic::AtomicCell;
use std::fmt;
use std::sync::Arc;

/// Fixed-length array of per-frame values for one block
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValueBuffer {
    values: Vec<f32>,
}

impl ValueBuffer {
    /// Create a buffer of `len` zeros
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    pub fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Value for frame `frame`, indexed modulo the buffer length
    #[inline]
    pub fn value(&self, frame: usize) -> f32 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values[frame % self.values.len()]
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fill(&mut self, value: f32) {
        self.values.fill(value);
    }

    /// Linear ramp that ends exactly on `end` at the last frame
    pub fn interpolate(&mut self, start: f32, end: f32) {
        let len = self.values.len() as f32;
        for (i, value) in self.values.iter_mut().enumerate() {
            *value = start + (end - start) * (i + 1) as f32 / len;
        }
    }

    /// Change the length; only called outside the audio callback
    pub fn resize(&mut self, len: usize) {
        self.values.resize(len, 0.0);
    }
}

/// Audio-rate value source driving a parameter (LFO, envelope follower, ...)
pub trait Modulation: Send {
    /// Write one value per frame into `out`
    fn fill(&mut self, out: &mut [f32]);
}

/// Sine LFO around a center value
#[derive(Debug, Clone)]
pub struct SineLfo {
    center: f32,
    depth: f32,
    phase: f32,
    increment: f32,
}

impl SineLfo {
    pub fn new(center: f32, depth: f32, rate_hz: f32, sample_rate: u32) -> Self {
        Self {
            center,
            depth,
            phase: 0.0,
            increment: std::f32::consts::TAU * rate_hz / sample_rate.max(1) as f32,
        }
    }
}

impl Modulation for SineLfo {
    fn fill(&mut self, out: &mut [f32]) {
        for value in out.iter_mut() {
            *value = self.center + self.depth * self.phase.sin();
            self.phase = (self.phase + self.increment) % std::f32::consts::TAU;
        }
    }
}

/// Control-thread side of a parameter
///
/// Cheap to clone, never blocks. Writes become visible to the audio thread at
/// its next block boundary.
#[derive(Debug, Clone)]
pub struct ParameterHandle {
    value: Arc<AtomicCell<f32>>,
    min: f32,
    max: f32,
}

impl ParameterHandle {
    /// Publish a new value (clamped to the parameter range)
    pub fn set(&self, value: f32) {
        self.value.store(value.clamp(self.min, self.max));
    }

    pub fn get(&self) -> f32 {
        self.value.load()
    }
}

/// Audio-thread side of an automatable parameter
pub struct Parameter {
    name: String,
    published: Arc<AtomicCell<f32>>,
    min: f32,
    max: f32,
    scalar: f32,
    buffer: ValueBuffer,
    buffer_valid: bool,
    smooth_changes: bool,
    modulation: Option<Box<dyn Modulation>>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("scalar", &self.scalar)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("buffer_valid", &self.buffer_valid)
            .field("modulated", &self.modulation.is_some())
            .finish()
    }
}

impl Parameter {
    /// Create a parameter; `frames` sizes its value buffer
    pub fn new(name: impl Into<String>, initial: f32, min: f32, max: f32, frames: usize) -> Self {
        let initial = initial.clamp(min, max);
        Self {
            name: name.into(),
            published: Arc::new(AtomicCell::new(initial)),
            min,
            max,
            scalar: initial,
            buffer: ValueBuffer::new(frames),
            buffer_valid: false,
            smooth_changes: false,
            modulation: None,
        }
    }

    /// Ramp across the block whenever the published value changes
    pub fn with_smoothing(mut self, smooth: bool) -> Self {
        self.smooth_changes = smooth;
        self
    }

    /// Drive this parameter from an audio-rate source
    pub fn with_modulation(mut self, modulation: Box<dyn Modulation>) -> Self {
        self.modulation = Some(modulation);
        self
    }

    /// Attach or detach an audio-rate source outside the audio callback
    pub fn set_modulation(&mut self, modulation: Option<Box<dyn Modulation>>) {
        self.modulation = modulation;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for publishing values from other threads
    pub fn handle(&self) -> ParameterHandle {
        ParameterHandle {
            value: Arc::clone(&self.published),
            min: self.min,
            max: self.max,
        }
    }

    /// Jump to `value` without a ramp, keeping existing handles connected
    ///
    /// Only called outside the audio callback.
    pub fn reset_to(&mut self, value: f32) {
        let value = value.clamp(self.min, self.max);
        self.published.store(value);
        self.scalar = value;
        self.buffer_valid = false;
    }

    /// Resize the value buffer after a period-size change
    pub fn prepare(&mut self, frames: usize) {
        self.buffer.resize(frames);
        self.buffer_valid = false;
    }

    /// Latch the published value and produce this block's per-frame values
    pub fn begin_block(&mut self) {
        let published = self.published.load();
        self.buffer_valid = false;

        if let Some(modulation) = self.modulation.as_mut() {
            modulation.fill(self.buffer.values_mut());
            let (min, max) = (self.min, self.max);
            for value in self.buffer.values_mut() {
                *value = value.clamp(min, max);
            }
            self.buffer_valid = true;
        } else if self.smooth_changes && published != self.scalar {
            self.buffer.interpolate(self.scalar, published);
            self.buffer_valid = true;
        }

        self.scalar = published;
    }

    /// Value for frame `frame` of the current block
    #[inline]
    pub fn value_at(&self, frame: usize) -> f32 {
        if self.buffer_valid {
            self.buffer.value(frame)
        } else {
            self.scalar
        }
    }

    /// Block-constant value latched at the last block boundary
    pub fn scalar_value(&self) -> f32 {
        self.scalar
    }

    /// Per-frame values, if this block has any
    pub fn value_buffer(&self) -> Option<&ValueBuffer> {
        self.buffer_valid.then_some(&self.buffer)
    }
}

/// Capability of an effect that owns automatable parameters
pub trait ParameterSet {
    /// Latch every parameter for the block about to run
    fn begin_block(&mut self);
}

impl ParameterSet for Parameter {
    fn begin_block(&mut self) {
        Parameter::begin_block(self);
    }
}

impl ParameterSet for [Parameter] {
    fn begin_block(&mut self) {
        for parameter in self.iter_mut() {
            parameter.begin_block();
        }
    }
}

impl ParameterSet for Vec<Parameter> {
    fn begin_block(&mut self) {
        self.as_mut_slice().begin_block();
    }
}
