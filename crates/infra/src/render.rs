//! Offline block renderer
//!
//! Drives an [`EffectChain`] over a buffer in mixer-sized periods, the way
//! a host audio callback would, and records every runtime event against the
//! block it happened in.

use crossbeam::channel::Receiver;
use fxrack_core::domain::audio::{self, Frame, MixerContext, SampleRate, SILENCE};
use fxrack_core::domain::config::{ConfigError, EngineConfig, ResamplerQuality};
use fxrack_core::domain::resampler::{ConverterFactory, LinearFactory};
use fxrack_core::domain::run_state::RunState;
use fxrack_core::domain::runtime::{event_channel, EffectId, RuntimeEvent};
use fxrack_core::domain::EffectChain;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::resample::SincFactory;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input is empty")]
    EmptyInput,
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Converter backend for a configured quality
pub fn converter_factory(quality: ResamplerQuality) -> Arc<dyn ConverterFactory> {
    match quality {
        ResamplerQuality::Linear => Arc::new(LinearFactory),
        ResamplerQuality::Sinc => Arc::new(SincFactory::default()),
    }
}

/// A state change or fault pinned to a point in the render
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub block: u64,
    pub time_ms: f64,
    pub effect: EffectId,
    #[serde(flatten)]
    pub kind: TimelineKind,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TimelineKind {
    StateChanged { from: RunState, to: RunState },
    Faulted,
}

/// Final counters for one effect
#[derive(Debug, Clone, Serialize)]
pub struct EffectSummary {
    pub effect: EffectId,
    pub name: String,
    pub state: RunState,
    pub processed_blocks: u64,
    pub skipped_blocks: u64,
    pub fault_count: u64,
    pub dropped_events: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderReport {
    pub sample_rate: u32,
    pub frames_per_period: usize,
    pub blocks: u64,
    pub active_blocks: u64,
    pub input_peak: f32,
    pub output_peak: f32,
    pub timeline: Vec<TimelineEntry>,
    pub effects: Vec<EffectSummary>,
}

/// Runs a chain over whole buffers, one period at a time
pub struct BlockRenderer {
    chain: EffectChain,
    events: Receiver<RuntimeEvent>,
    block: Vec<Frame>,
    blocks_rendered: u64,
}

impl BlockRenderer {
    pub fn new(chain: EffectChain, events: Receiver<RuntimeEvent>) -> Self {
        let frames = chain.context().frames_per_period;
        Self {
            chain,
            events,
            block: vec![SILENCE; frames],
            blocks_rendered: 0,
        }
    }

    /// Build the chain and its event channel from configuration
    #[instrument(skip(config))]
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let (tx, rx) = event_channel(config.engine.event_capacity);
        let converters = converter_factory(config.engine.resampler_quality);
        let chain = EffectChain::from_config(config, converters, Some(tx))?;
        Ok(Self::new(chain, rx))
    }

    pub fn chain(&self) -> &EffectChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut EffectChain {
        &mut self.chain
    }

    pub fn context(&self) -> MixerContext {
        self.chain.context()
    }

    /// Process `input` into a new buffer of the same length
    ///
    /// A trailing partial period is padded with silence for processing and
    /// truncated again on output.
    #[instrument(skip(self, input), fields(frames = input.len()))]
    pub fn render(&mut self, input: &[Frame]) -> Result<(Vec<Frame>, RenderReport)> {
        if input.is_empty() {
            return Err(RenderError::EmptyInput);
        }

        let context = self.chain.context();
        let period = context.frames_per_period;
        let rate = context.sample_rate_hz();
        let mut output = Vec::with_capacity(input.len());
        let mut timeline = Vec::new();
        let mut blocks = 0u64;
        let mut active_blocks = 0u64;

        for chunk in input.chunks(period) {
            self.block[..chunk.len()].copy_from_slice(chunk);
            self.block[chunk.len()..].fill(SILENCE);

            if self.chain.process_block(&mut self.block) {
                active_blocks += 1;
            }
            output.extend_from_slice(&self.block[..chunk.len()]);

            let block = self.blocks_rendered;
            let time_ms = (block * period as u64) as f64 * 1000.0 / rate as f64;
            for event in self.events.try_iter() {
                timeline.push(timeline_entry(block, time_ms, event));
            }

            self.blocks_rendered += 1;
            blocks += 1;
        }

        debug!(blocks, active_blocks, events = timeline.len(), "render finished");

        let report = RenderReport {
            sample_rate: rate,
            frames_per_period: period,
            blocks,
            active_blocks,
            input_peak: audio::peak(input),
            output_peak: audio::peak(&output),
            timeline,
            effects: self.summaries(),
        };
        Ok((output, report))
    }

    /// Switch the mixer context and resize the period buffer
    pub fn set_mixer_context(&mut self, context: MixerContext) -> Result<()> {
        self.chain
            .set_mixer_context(context)
            .map_err(|e| RenderError::Config(ConfigError::Invalid(e.to_string())))?;
        self.block.resize(context.frames_per_period, SILENCE);
        info!(
            sample_rate = context.sample_rate_hz(),
            frames = context.frames_per_period,
            "render context changed"
        );
        Ok(())
    }

    fn summaries(&self) -> Vec<EffectSummary> {
        self.chain
            .runtimes()
            .iter()
            .map(|runtime| {
                let status = runtime.status();
                EffectSummary {
                    effect: runtime.id(),
                    name: runtime.name().to_string(),
                    state: status.state(),
                    processed_blocks: status.processed_blocks(),
                    skipped_blocks: status.skipped_blocks(),
                    fault_count: status.fault_count(),
                    dropped_events: status.dropped_events(),
                }
            })
            .collect()
    }
}

fn timeline_entry(block: u64, time_ms: f64, event: RuntimeEvent) -> TimelineEntry {
    let (effect, kind) = match event {
        RuntimeEvent::StateChanged { effect, from, to } => {
            (effect, TimelineKind::StateChanged { from, to })
        }
        RuntimeEvent::Faulted { effect } => (effect, TimelineKind::Faulted),
    };
    TimelineEntry {
        block,
        time_ms,
        effect,
        kind,
    }
}

/// Stereo sine burst followed by silence
pub fn sine_burst(
    sample_rate: SampleRate,
    frequency: f32,
    level: f32,
    burst_secs: f32,
    total_secs: f32,
) -> Vec<Frame> {
    let rate = sample_rate.hz() as f32;
    let total = (total_secs.max(0.0) * rate) as usize;
    let burst = ((burst_secs.max(0.0) * rate) as usize).min(total);
    let step = std::f32::consts::TAU * frequency / rate;

    (0..total)
        .map(|i| {
            if i < burst {
                let s = (step * i as f32).sin() * level;
                [s, s]
            } else {
                SILENCE
            }
        })
        .collect()
}
