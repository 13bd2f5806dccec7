//! Ordered effect chain
//!
//! The chain is the boundary where DSP faults stop: an effect that fails is
//! stopped and bypassed, and the rest of the chain keeps playing.

use crate::domain::audio::{EffectError, Frame, MixerContext, Result};
use crate::domain::config::{ConfigError, EngineConfig};
use crate::domain::dsp::EffectFactory;
use crate::domain::resampler::{ConverterFactory, LinearFactory};
use crate::domain::runtime::{AudioEffect, EffectId, EffectRuntime, RuntimeEvent, RuntimeHandle};
use crossbeam::channel::Sender;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Effects applied in order to the same block
pub struct EffectChain {
    context: MixerContext,
    runtimes: Vec<EffectRuntime>,
    converters: Arc<dyn ConverterFactory>,
    events: Option<Sender<RuntimeEvent>>,
    next_id: u32,
}

impl std::fmt::Debug for EffectChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectChain")
            .field("context", &self.context)
            .field("converter", &self.converters.name())
            .field("runtimes", &self.runtimes)
            .finish()
    }
}

impl EffectChain {
    pub fn new(context: MixerContext) -> Self {
        Self::with_converters(context, Arc::new(LinearFactory))
    }

    pub fn with_converters(context: MixerContext, converters: Arc<dyn ConverterFactory>) -> Self {
        Self {
            context,
            runtimes: Vec::new(),
            converters,
            events: None,
            next_id: 0,
        }
    }

    /// Forward state changes of every runtime added from now on
    pub fn with_events(mut self, events: Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build a chain from a validated configuration
    #[instrument(skip(config, converters, events), fields(effects = config.chain.effects.len()))]
    pub fn from_config(
        config: &EngineConfig,
        converters: Arc<dyn ConverterFactory>,
        events: Option<Sender<RuntimeEvent>>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let context = config.engine.mixer_context();
        let factory = EffectFactory;
        let mut chain = Self::with_converters(context, converters);
        chain.events = events;

        for effect_config in &config.chain.effects {
            let build = || -> Result<EffectRuntime> {
                let effect = factory.build(
                    &effect_config.kind,
                    context.sample_rate_hz(),
                    context.frames_per_period,
                )?;
                let runtime = chain
                    .new_runtime(effect)?
                    .with_settings(&effect_config.settings)?
                    .with_auto_quit_disabled(config.engine.disable_auto_quit)
                    .with_silence_threshold(config.engine.silence_threshold);
                Ok(runtime)
            };
            let runtime = build().map_err(|e| ConfigError::Invalid(e.to_string()))?;
            chain.next_id += 1;
            chain.runtimes.push(runtime);
        }

        info!(
            sample_rate = context.sample_rate_hz(),
            frames = context.frames_per_period,
            converter = chain.converters.name(),
            "effect chain built"
        );
        Ok(chain)
    }

    fn new_runtime(&self, effect: Box<dyn AudioEffect>) -> Result<EffectRuntime> {
        let runtime = EffectRuntime::with_converters(
            EffectId(self.next_id),
            effect,
            self.context,
            Arc::clone(&self.converters),
        )?;
        Ok(match &self.events {
            Some(events) => runtime.with_events(events.clone()),
            None => runtime,
        })
    }

    /// Append an effect with default settings
    pub fn push(&mut self, effect: Box<dyn AudioEffect>) -> Result<EffectId> {
        let runtime = self.new_runtime(effect)?;
        let id = runtime.id();
        self.next_id += 1;
        self.runtimes.push(runtime);
        Ok(id)
    }

    /// Append an already configured runtime
    pub fn push_runtime(&mut self, runtime: EffectRuntime) -> Result<()> {
        if runtime.context() != self.context {
            return Err(EffectError::InvalidConfiguration(format!(
                "runtime {} was built for a different mixer context",
                runtime.id()
            )));
        }
        self.next_id = self.next_id.max(runtime.id().0 + 1);
        self.runtimes.push(runtime);
        Ok(())
    }

    pub fn remove(&mut self, id: EffectId) -> Option<EffectRuntime> {
        let index = self.runtimes.iter().position(|r| r.id() == id)?;
        Some(self.runtimes.remove(index))
    }

    pub fn context(&self) -> MixerContext {
        self.context
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    pub fn get(&self, id: EffectId) -> Option<&EffectRuntime> {
        self.runtimes.iter().find(|r| r.id() == id)
    }

    pub fn runtimes(&self) -> &[EffectRuntime] {
        &self.runtimes
    }

    /// Control handles in chain order
    pub fn handles(&self) -> Vec<RuntimeHandle> {
        self.runtimes.iter().map(EffectRuntime::handle).collect()
    }

    /// Run every effect on `block` in order
    ///
    /// Returns whether any effect wants to keep running. Faults are absorbed:
    /// the failing effect has already restored its input, so the block
    /// continues down the chain as if that effect were bypassed.
    pub fn process_block(&mut self, block: &mut [Frame]) -> bool {
        let mut keep_running = false;
        for runtime in &mut self.runtimes {
            match runtime.process_block(block) {
                Ok(keep) => keep_running |= keep,
                // Already logged as an error by the runtime, repeats every block
                Err(e @ EffectError::RateMismatch { .. }) => {
                    debug!(effect = %runtime.id(), error = %e, "effect bypassed");
                }
                Err(e) => {
                    warn!(effect = %runtime.id(), name = runtime.name(), error = %e, "effect bypassed");
                }
            }
        }
        keep_running
    }

    /// Propagate a mixer rate or period change to every effect
    pub fn set_mixer_context(&mut self, context: MixerContext) -> Result<()> {
        for runtime in &mut self.runtimes {
            runtime.set_mixer_context(context)?;
        }
        self.context = context;
        Ok(())
    }
}
