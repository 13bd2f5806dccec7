//! Per-effect runtime
//!
//! [`EffectRuntime`] wraps one concrete effect and runs the block protocol the
//! mixer relies on: latch controls, measure the input, ask the run-state
//! machine whether the DSP runs, hand the effect its crossfade, validate what
//! came back and feed the auto-quit timer.
//!
//! Nothing in [`EffectRuntime::process_block`] allocates or blocks. Control
//! threads talk to the runtime through a [`RuntimeHandle`]; everything they
//! write is picked up at the next block boundary.

use crate::domain::audio::{self, EffectError, Frame, MixerContext, Result, SILENCE};
use crate::domain::automation::{Parameter, ParameterHandle, ParameterSet};
use crate::domain::config::EffectSettings;
use crate::domain::crossfade::{Crossfade, CrossfadeComputer};
use crate::domain::gate::{Gate, GateConfig};
use crate::domain::resampler::{ConverterFactory, LinearFactory, ResamplerContext};
use crate::domain::run_state::{BlockDecision, BlockInput, RunState, RunStateMachine};
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use tracing::{debug, error, info, trace, warn};

/// Auto-quit timeout used when no settings are applied
pub const DEFAULT_AUTO_QUIT_MS: u32 = 1000;

/// Resampler context shared between the audio thread and rate-change notifications
pub type SharedResampler = Arc<Mutex<ResamplerContext>>;

/// Position-independent identifier of an effect in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId(pub u32);

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fx{}", self.0)
    }
}

/// Notification sent from the audio thread to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent {
    StateChanged {
        effect: EffectId,
        from: RunState,
        to: RunState,
    },
    Faulted {
        effect: EffectId,
    },
}

/// Bounded channel for [`RuntimeEvent`]s; the audio side never blocks on it
pub fn event_channel(capacity: usize) -> (Sender<RuntimeEvent>, Receiver<RuntimeEvent>) {
    channel::bounded(capacity.max(1))
}

/// Capability every concrete effect implements
pub trait AudioEffect: Send {
    fn name(&self) -> &str;

    /// Process one block in place and blend it with the dry input using `crossfade`
    ///
    /// `block` holds the dry input on entry. Returns whether the effect produced
    /// output; when it did not, the runtime restores the dry input.
    fn run_dsp(&mut self, block: &mut [Frame], crossfade: &Crossfade<'_>) -> Result<bool>;

    /// Clear internal DSP state (delay lines, filter memory)
    fn reset(&mut self) {}

    /// Called at construction and after every mixer-rate change, outside the audio callback
    fn prepare(&mut self, _sample_rate: u32, _frames: usize) {}

    /// Rate the DSP wants to run at, `None` for the host rate
    fn internal_sample_rate(&self, _host_rate: u32) -> Option<u32> {
        None
    }

    /// Automatable parameters latched by the runtime before each executed block
    fn parameters(&mut self) -> Option<&mut dyn ParameterSet> {
        None
    }

    /// Analyzers and similar always-on effects opt out of auto-quit
    fn wants_auto_quit(&self) -> bool {
        true
    }
}

/// Lock-free status published by the audio thread
#[derive(Debug)]
pub struct RuntimeStatus {
    state: AtomicCell<RunState>,
    okay: AtomicCell<bool>,
    faulted: AtomicCell<bool>,
    gate_open: AtomicCell<bool>,
    processed_blocks: AtomicCell<u64>,
    skipped_blocks: AtomicCell<u64>,
    fault_count: AtomicCell<u64>,
    dropped_events: AtomicCell<u64>,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            state: AtomicCell::new(RunState::Stopped),
            okay: AtomicCell::new(true),
            faulted: AtomicCell::new(false),
            gate_open: AtomicCell::new(true),
            processed_blocks: AtomicCell::new(0),
            skipped_blocks: AtomicCell::new(0),
            fault_count: AtomicCell::new(0),
            dropped_events: AtomicCell::new(0),
        }
    }
}

impl RuntimeStatus {
    pub fn state(&self) -> RunState {
        self.state.load()
    }

    pub fn is_okay(&self) -> bool {
        self.okay.load()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load()
    }

    pub fn gate_open(&self) -> bool {
        self.gate_open.load()
    }

    /// Blocks on which the DSP hook was invoked (or skipped for a closed gate)
    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load()
    }

    /// Blocks passed through untouched
    pub fn skipped_blocks(&self) -> u64 {
        self.skipped_blocks.load()
    }

    pub fn fault_count(&self) -> u64 {
        self.fault_count.load()
    }

    /// Events lost because the channel was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load()
    }
}

/// Control-thread view of one runtime
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    id: EffectId,
    enabled: Arc<AtomicCell<bool>>,
    gate: Arc<AtomicCell<GateConfig>>,
    wet: ParameterHandle,
    status: Arc<RuntimeStatus>,
}

impl RuntimeHandle {
    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load()
    }

    pub fn set_wet(&self, wet: f32) {
        self.wet.set(wet);
    }

    pub fn wet(&self) -> f32 {
        self.wet.get()
    }

    pub fn set_gate(&self, config: GateConfig) -> Result<()> {
        config.validate()?;
        self.gate.store(config);
        Ok(())
    }

    pub fn state(&self) -> RunState {
        self.status.state()
    }

    pub fn is_faulted(&self) -> bool {
        self.status.is_faulted()
    }

    /// Let a faulted effect start again on its next enabled block
    pub fn clear_fault(&self) {
        if self.status.faulted.swap(false) {
            info!(effect = %self.id, "fault cleared");
        }
    }

    pub fn status(&self) -> &RuntimeStatus {
        &self.status
    }
}

/// Lifecycle, gate, crossfade and resampling around one effect
pub struct EffectRuntime {
    id: EffectId,
    effect: Box<dyn AudioEffect>,
    context: MixerContext,
    wet: Parameter,
    enabled: Arc<AtomicCell<bool>>,
    gate_config: Arc<AtomicCell<GateConfig>>,
    gate: Gate,
    state_machine: RunStateMachine,
    auto_quit_ms: u32,
    dry: Vec<Frame>,
    converters: Arc<dyn ConverterFactory>,
    resampler: Option<SharedResampler>,
    status: Arc<RuntimeStatus>,
    events: Option<Sender<RuntimeEvent>>,
}

impl fmt::Debug for EffectRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectRuntime")
            .field("id", &self.id)
            .field("effect", &self.effect.name())
            .field("context", &self.context)
            .field("state", &self.state_machine.state())
            .field("resampled", &self.resampler.is_some())
            .finish()
    }
}

impl EffectRuntime {
    /// Runtime with the linear converter for effects that resample
    pub fn new(id: EffectId, effect: Box<dyn AudioEffect>, context: MixerContext) -> Result<Self> {
        Self::with_converters(id, effect, context, Arc::new(LinearFactory))
    }

    pub fn with_converters(
        id: EffectId,
        effect: Box<dyn AudioEffect>,
        context: MixerContext,
        converters: Arc<dyn ConverterFactory>,
    ) -> Result<Self> {
        validate_context(&context)?;

        let frames = context.frames_per_period;
        let mut state_machine =
            RunStateMachine::new(context.ms_to_frames(DEFAULT_AUTO_QUIT_MS));
        state_machine.set_auto_quit_disabled(!effect.wants_auto_quit());

        let mut runtime = Self {
            id,
            effect,
            context,
            wet: Parameter::new("wet", 1.0, 0.0, 1.0, frames).with_smoothing(true),
            enabled: Arc::new(AtomicCell::new(true)),
            gate_config: Arc::new(AtomicCell::new(GateConfig::default())),
            gate: Gate::default(),
            state_machine,
            auto_quit_ms: DEFAULT_AUTO_QUIT_MS,
            dry: vec![SILENCE; frames],
            converters,
            resampler: None,
            status: Arc::new(RuntimeStatus::default()),
            events: None,
        };
        runtime.rebuild_resampler();
        runtime.prepare_effect();

        info!(
            effect = %id,
            name = runtime.effect.name(),
            sample_rate = context.sample_rate_hz(),
            frames,
            resampled = runtime.resampler.is_some(),
            "effect runtime created"
        );
        Ok(runtime)
    }

    /// Apply persisted settings; only used while building the chain
    pub fn with_settings(mut self, settings: &EffectSettings) -> Result<Self> {
        let gate = settings.gate_config();
        gate.validate()?;

        self.enabled.store(settings.enabled);
        self.wet.reset_to(settings.wet);
        self.gate_config.store(gate);
        self.gate.set_config(gate);
        self.auto_quit_ms = settings.auto_quit_ms;
        self.state_machine
            .set_timeout_frames(self.context.ms_to_frames(settings.auto_quit_ms));
        Ok(self)
    }

    pub fn with_events(mut self, events: Sender<RuntimeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Global override; effects that opt out of auto-quit stay opted out
    pub fn with_auto_quit_disabled(mut self, disabled: bool) -> Self {
        let disabled = disabled || !self.effect.wants_auto_quit();
        self.state_machine.set_auto_quit_disabled(disabled);
        self
    }

    pub fn with_silence_threshold(mut self, threshold: f32) -> Self {
        self.state_machine = self.state_machine.clone().with_silence_threshold(threshold);
        self
    }

    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.effect.name()
    }

    pub fn state(&self) -> RunState {
        self.state_machine.state()
    }

    pub fn context(&self) -> MixerContext {
        self.context
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn status(&self) -> &RuntimeStatus {
        &self.status
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            id: self.id,
            enabled: Arc::clone(&self.enabled),
            gate: Arc::clone(&self.gate_config),
            wet: self.wet.handle(),
            status: Arc::clone(&self.status),
        }
    }

    /// Shared resampler context, present only for effects running at their own rate
    pub fn resampler(&self) -> Option<SharedResampler> {
        self.resampler.clone()
    }

    /// Apply a new mixer rate or period
    ///
    /// Must be called at a block boundary; rebuilds buffers and the resampler.
    pub fn set_mixer_context(&mut self, context: MixerContext) -> Result<()> {
        validate_context(&context)?;
        if context == self.context {
            return Ok(());
        }

        info!(
            effect = %self.id,
            old_rate = self.context.sample_rate_hz(),
            new_rate = context.sample_rate_hz(),
            frames = context.frames_per_period,
            "mixer context changed"
        );

        self.context = context;
        self.dry.resize(context.frames_per_period, SILENCE);
        self.wet.prepare(context.frames_per_period);
        self.state_machine
            .set_timeout_frames(context.ms_to_frames(self.auto_quit_ms));
        self.rebuild_resampler();
        self.prepare_effect();
        Ok(())
    }

    fn rebuild_resampler(&mut self) {
        let host_rate = self.context.sample_rate_hz();
        let frames = self.context.frames_per_period;

        let Some(internal_rate) = self
            .effect
            .internal_sample_rate(host_rate)
            .filter(|&rate| rate != host_rate)
        else {
            self.resampler = None;
            return;
        };

        match &self.resampler {
            Some(shared) => {
                let mut context = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if context.internal_rate() == internal_rate {
                    context.reinitialize(host_rate, frames);
                } else {
                    *context = ResamplerContext::new(
                        Arc::clone(&self.converters),
                        host_rate,
                        internal_rate,
                        frames,
                    );
                }
            }
            None => {
                let context = ResamplerContext::new(
                    Arc::clone(&self.converters),
                    host_rate,
                    internal_rate,
                    frames,
                );
                self.resampler = Some(Arc::new(Mutex::new(context)));
            }
        }
    }

    fn prepare_effect(&mut self) {
        let (rate, frames) = match &self.resampler {
            Some(shared) => {
                let context = shared.lock().unwrap_or_else(PoisonError::into_inner);
                (context.internal_rate(), context.internal_frames())
            }
            None => (self.context.sample_rate_hz(), self.context.frames_per_period),
        };
        self.effect.prepare(rate, frames);
    }

    /// Run one block in place
    ///
    /// Returns whether the effect wants to keep running. Blocks that do not
    /// execute are left untouched. On a DSP fault the block is restored to
    /// the dry input, the effect is stopped and the error is returned.
    pub fn process_block(&mut self, block: &mut [Frame]) -> Result<bool> {
        let frames = self.context.frames_per_period;
        if block.len() != frames {
            return Err(EffectError::BlockSizeMismatch {
                expected: frames,
                actual: block.len(),
            });
        }

        let shared = self.resampler.clone();
        let mut resampler = match shared.as_deref().map(|mutex| mutex.try_lock()) {
            None => None,
            Some(Ok(guard)) => Some(guard),
            Some(Err(TryLockError::Poisoned(poisoned))) => Some(poisoned.into_inner()),
            Some(Err(TryLockError::WouldBlock)) => {
                trace!(effect = %self.id, "resampler busy, passing block through");
                self.status.skipped_blocks.fetch_add(1);
                return Ok(self.state_machine.state().executes());
            }
        };

        if let Some(context) = resampler.as_deref() {
            if context.host_rate() != self.context.sample_rate_hz() {
                error!(
                    effect = %self.id,
                    runtime_rate = self.context.sample_rate_hz(),
                    resampler_rate = context.host_rate(),
                    "host rate changed without notification, passing block through"
                );
                self.status.skipped_blocks.fetch_add(1);
                return Err(EffectError::RateMismatch {
                    expected: self.context.sample_rate_hz(),
                    actual: context.host_rate(),
                });
            }
        }

        let enabled = self.enabled.load();
        let gate_config = self.gate_config.load();
        if gate_config != *self.gate.config() {
            self.gate.set_config(gate_config);
        }
        let okay = !self.status.faulted.load()
            && resampler.as_deref().map_or(true, ResamplerContext::is_okay);
        self.status.okay.store(okay);

        let input_rms = audio::rms(block);
        let input_active = audio::peak(block) > self.state_machine.silence_threshold();
        let gate_open = if self.state_machine.gate_is_live() {
            self.gate.update(input_rms)
        } else {
            true
        };

        let previous = self.state_machine.state();
        let decision = self.state_machine.should_process_audio_buffer(&BlockInput {
            enabled,
            okay,
            input_active,
            gate_open,
        });
        if decision.state == RunState::Starting {
            self.gate.rearm();
        }
        self.status.gate_open.store(self.gate.is_open());
        self.publish_transition(previous, decision.state);

        if !decision.execute {
            self.status.skipped_blocks.fetch_add(1);
            return Ok(false);
        }

        self.wet.begin_block();
        if let Some(parameters) = self.effect.parameters() {
            parameters.begin_block();
        }
        self.dry.copy_from_slice(block);

        let forced_dry = decision.forced_dry();
        let outcome = if forced_dry && !self.gate.config().run_dsp_while_closed {
            Ok(false)
        } else {
            self.run_effect(block, &decision, resampler.as_deref_mut())
        };
        let outcome = match outcome {
            Ok(_) if !audio::is_finite(block) => Err(EffectError::NonFiniteOutput(
                self.effect.name().to_string(),
            )),
            other => other,
        };

        let produced = match outcome {
            Ok(produced) => produced,
            Err(e) => {
                self.handle_fault(block, resampler.as_deref_mut(), &e);
                return Err(e);
            }
        };

        if !produced || forced_dry {
            block.copy_from_slice(&self.dry);
        }

        let output_rms = audio::rms(block);
        let keep_running = self.state_machine.should_keep_running(output_rms, frames);
        self.status.processed_blocks.fetch_add(1);

        trace!(
            effect = %self.id,
            state = decision.state.label(),
            input_rms,
            output_rms,
            keep_running,
            "block processed"
        );
        Ok(keep_running)
    }

    fn run_effect(
        &mut self,
        block: &mut [Frame],
        decision: &BlockDecision,
        resampler: Option<&mut ResamplerContext>,
    ) -> Result<bool> {
        let frames = block.len();
        let computer = if decision.forced_dry() {
            CrossfadeComputer::forced_dry(frames)
        } else {
            CrossfadeComputer::new(frames, decision.flags)
        };
        let crossfade = Crossfade::new(computer, &self.wet);
        let effect = self.effect.as_mut();

        let Some(context) = resampler else {
            return run_guarded(effect, block, &crossfade);
        };

        // The effect sees a fully wet crossfade at its own rate; the blend
        // happens here at the host rate once the block is back.
        let host_rate = self.context.sample_rate_hz();
        let internal_rate = context.internal_rate();
        let internal_frames = context.internal_frames();
        let produced = {
            let internal = context.downsample(block, host_rate, internal_rate, internal_frames)?;
            run_guarded(effect, internal, &Crossfade::fully_wet(internal_frames))?
        };
        if !produced {
            return Ok(false);
        }

        context.upsample(internal_rate, host_rate, block)?;
        for (frame, (out, dry)) in block.iter_mut().zip(self.dry.iter()).enumerate() {
            *out = crossfade.mix(frame, *dry, *out);
        }
        Ok(true)
    }

    fn handle_fault(
        &mut self,
        block: &mut [Frame],
        resampler: Option<&mut ResamplerContext>,
        error: &EffectError,
    ) {
        block.copy_from_slice(&self.dry);

        let previous = self.state_machine.state();
        self.state_machine.fault();
        self.status.faulted.store(true);
        self.status.okay.store(false);
        self.status.fault_count.fetch_add(1);

        let effect = &mut self.effect;
        if panic::catch_unwind(AssertUnwindSafe(|| effect.reset())).is_err() {
            warn!(effect = %self.id, "effect reset panicked after fault");
        }
        if let Some(context) = resampler {
            context.reset();
        }

        warn!(
            effect = %self.id,
            name = self.effect.name(),
            error = %error,
            "DSP fault, effect stopped"
        );
        self.publish_transition(previous, RunState::Stopped);
        self.send(RuntimeEvent::Faulted { effect: self.id });
    }

    fn publish_transition(&mut self, from: RunState, to: RunState) {
        self.status.state.store(to);
        if from != to {
            self.send(RuntimeEvent::StateChanged {
                effect: self.id,
                from,
                to,
            });
        }
    }

    fn send(&self, event: RuntimeEvent) {
        let Some(events) = &self.events else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.status.dropped_events.fetch_add(1);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(effect = %self.id, "event receiver gone");
            }
        }
    }
}

fn validate_context(context: &MixerContext) -> Result<()> {
    if context.sample_rate_hz() == 0 || context.frames_per_period == 0 {
        return Err(EffectError::InvalidConfiguration(format!(
            "mixer context needs a non-zero rate and period, got {}Hz / {} frames",
            context.sample_rate_hz(),
            context.frames_per_period
        )));
    }
    Ok(())
}

fn run_guarded(
    effect: &mut dyn AudioEffect,
    block: &mut [Frame],
    crossfade: &Crossfade<'_>,
) -> Result<bool> {
    match panic::catch_unwind(AssertUnwindSafe(|| effect.run_dsp(block, crossfade))) {
        Ok(result) => result,
        Err(payload) => Err(EffectError::DspPanic(format!(
            "{}: {}",
            effect.name(),
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::SampleRate;

    const N: usize = 4;

    fn context(frames: usize) -> MixerContext {
        MixerContext::new(SampleRate::Hz48000, frames)
    }

    /// Scales the input by a fixed gain and blends it
    struct Gain {
        gain: f32,
        internal_rate: Option<u32>,
    }

    impl Gain {
        fn boxed(gain: f32) -> Box<dyn AudioEffect> {
            Box::new(Self {
                gain,
                internal_rate: None,
            })
        }
    }

    impl AudioEffect for Gain {
        fn name(&self) -> &str {
            "gain"
        }

        fn run_dsp(&mut self, block: &mut [Frame], crossfade: &Crossfade<'_>) -> Result<bool> {
            for (f, frame) in block.iter_mut().enumerate() {
                let wet = [frame[0] * self.gain, frame[1] * self.gain];
                *frame = crossfade.mix(f, *frame, wet);
            }
            Ok(true)
        }

        fn internal_sample_rate(&self, _host_rate: u32) -> Option<u32> {
            self.internal_rate
        }
    }

    enum Failure {
        Error,
        Panic,
        NaN,
    }

    struct Broken {
        failure: Failure,
        resets: Arc<AtomicCell<u32>>,
    }

    impl AudioEffect for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn run_dsp(&mut self, block: &mut [Frame], _crossfade: &Crossfade<'_>) -> Result<bool> {
            block[0] = [0.123, 0.456];
            match self.failure {
                Failure::Error => Err(EffectError::DspFault {
                    effect: "broken".into(),
                    reason: "boom".into(),
                }),
                Failure::Panic => panic!("dsp exploded"),
                Failure::NaN => {
                    block[1] = [f32::NAN, 0.0];
                    Ok(true)
                }
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1);
        }
    }

    fn constant(frames: usize, level: f32) -> Vec<Frame> {
        vec![[level, level]; frames]
    }

    #[test]
    fn test_first_block_ramps_in() {
        let mut runtime = EffectRuntime::new(EffectId(0), Gain::boxed(0.0), context(N)).unwrap();
        let mut block = constant(N, 1.0);
        assert!(runtime.process_block(&mut block).unwrap());
        assert_eq!(runtime.state(), RunState::Starting);

        let left: Vec<f32> = block.iter().map(|f| f[0]).collect();
        assert_eq!(left, vec![0.75, 0.5, 0.25, 0.0]);

        let mut block = constant(N, 1.0);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(runtime.state(), RunState::Running);
        assert_eq!(block, constant(N, 0.0));
    }

    #[test]
    fn test_disabled_effect_leaves_block_untouched() {
        let runtime = EffectRuntime::new(EffectId(1), Gain::boxed(0.0), context(N)).unwrap();
        let mut runtime = runtime
            .with_settings(&EffectSettings {
                enabled: false,
                ..EffectSettings::default()
            })
            .unwrap();

        let input: Vec<Frame> = (0..N).map(|i| [i as f32 * 0.1, -(i as f32) * 0.1]).collect();
        let mut block = input.clone();
        assert!(!runtime.process_block(&mut block).unwrap());
        assert_eq!(block, input);
        assert_eq!(runtime.state(), RunState::Stopped);
        assert_eq!(runtime.status().skipped_blocks(), 1);
    }

    #[test]
    fn test_disable_ramps_out_then_stops() {
        let mut runtime = EffectRuntime::new(EffectId(2), Gain::boxed(0.0), context(N)).unwrap();
        let handle = runtime.handle();
        for _ in 0..2 {
            runtime.process_block(&mut constant(N, 1.0)).unwrap();
        }

        handle.set_enabled(false);
        let mut block = constant(N, 1.0);
        assert!(!runtime.process_block(&mut block).unwrap());
        assert_eq!(runtime.state(), RunState::Stopping);
        let left: Vec<f32> = block.iter().map(|f| f[0]).collect();
        assert_eq!(left, vec![0.0, 0.25, 0.5, 0.75]);

        let mut block = constant(N, 1.0);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(runtime.state(), RunState::Stopped);
        assert_eq!(block, constant(N, 1.0));
    }

    #[test]
    fn test_wet_level_follows_handle() {
        let mut runtime = EffectRuntime::new(EffectId(3), Gain::boxed(0.0), context(N)).unwrap();
        let handle = runtime.handle();
        runtime.process_block(&mut constant(N, 1.0)).unwrap();
        runtime.process_block(&mut constant(N, 1.0)).unwrap();

        handle.set_wet(0.0);
        let mut block = constant(N, 1.0);
        runtime.process_block(&mut block).unwrap();
        // Smoothed from 1.0 to 0.0 across the block
        let left: Vec<f32> = block.iter().map(|f| f[0]).collect();
        assert_eq!(left, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_error_restores_dry_and_stops() {
        let resets = Arc::new(AtomicCell::new(0));
        let effect = Box::new(Broken {
            failure: Failure::Error,
            resets: Arc::clone(&resets),
        });
        let mut runtime = EffectRuntime::new(EffectId(4), effect, context(N)).unwrap();
        let handle = runtime.handle();

        let input = constant(N, 0.5);
        let mut block = input.clone();
        let err = runtime.process_block(&mut block).unwrap_err();
        assert!(matches!(err, EffectError::DspFault { .. }));
        assert_eq!(block, input);
        assert_eq!(runtime.state(), RunState::Stopped);
        assert!(handle.is_faulted());
        assert_eq!(resets.load(), 1);

        // Stays stopped until the fault is cleared
        let mut block = input.clone();
        assert!(!runtime.process_block(&mut block).unwrap());
        assert_eq!(block, input);

        handle.clear_fault();
        let mut block = input.clone();
        assert!(runtime.process_block(&mut block).is_err());
        assert_eq!(handle.status().fault_count(), 2);
    }

    #[test]
    fn test_panic_is_contained() {
        let effect = Box::new(Broken {
            failure: Failure::Panic,
            resets: Arc::new(AtomicCell::new(0)),
        });
        let mut runtime = EffectRuntime::new(EffectId(5), effect, context(N)).unwrap();

        let input = constant(N, 0.25);
        let mut block = input.clone();
        let err = runtime.process_block(&mut block).unwrap_err();
        assert!(matches!(err, EffectError::DspPanic(ref msg) if msg.contains("dsp exploded")));
        assert_eq!(block, input);
        assert_eq!(runtime.state(), RunState::Stopped);
    }

    #[test]
    fn test_non_finite_output_is_rejected() {
        let effect = Box::new(Broken {
            failure: Failure::NaN,
            resets: Arc::new(AtomicCell::new(0)),
        });
        let mut runtime = EffectRuntime::new(EffectId(6), effect, context(N)).unwrap();

        let input = constant(N, 0.25);
        let mut block = input.clone();
        let err = runtime.process_block(&mut block).unwrap_err();
        assert!(matches!(err, EffectError::NonFiniteOutput(_)));
        assert_eq!(block, input);
    }

    #[test]
    fn test_auto_quit_idles_and_restarts_with_ramp() {
        // 10ms at 48kHz = 480 frames
        let settings = EffectSettings {
            auto_quit_ms: 10,
            ..EffectSettings::default()
        };
        let mut runtime = EffectRuntime::new(EffectId(7), Gain::boxed(0.0), context(256))
            .unwrap()
            .with_settings(&settings)
            .unwrap();

        let silence = constant(256, 0.0);
        assert!(runtime.process_block(&mut silence.clone()).unwrap());
        assert!(!runtime.process_block(&mut silence.clone()).unwrap());
        assert_eq!(runtime.state(), RunState::Running);

        runtime.process_block(&mut silence.clone()).unwrap();
        assert_eq!(runtime.state(), RunState::Stopping);

        for _ in 0..20 {
            let mut block = silence.clone();
            assert!(!runtime.process_block(&mut block).unwrap());
            assert_eq!(runtime.state(), RunState::Idle);
        }

        let mut block = constant(256, 1.0);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(runtime.state(), RunState::Starting);
        assert!((block[0][0] - 255.0 / 256.0).abs() < 1e-6);
        assert_eq!(block[255][0], 0.0);
    }

    #[test]
    fn test_silence_threshold_also_gates_wake_up() {
        let settings = EffectSettings {
            auto_quit_ms: 10,
            ..EffectSettings::default()
        };
        let mut runtime = EffectRuntime::new(EffectId(13), Gain::boxed(0.5), context(256))
            .unwrap()
            .with_settings(&settings)
            .unwrap()
            .with_silence_threshold(0.1);

        // Halved output stays below the threshold
        for _ in 0..6 {
            runtime.process_block(&mut constant(256, 0.1)).unwrap();
        }
        assert_eq!(runtime.state(), RunState::Idle);

        // Input peak at the threshold does not wake it
        runtime.process_block(&mut constant(256, 0.1)).unwrap();
        assert_eq!(runtime.state(), RunState::Idle);

        runtime.process_block(&mut constant(256, 0.2)).unwrap();
        assert_eq!(runtime.state(), RunState::Starting);
    }

    #[test]
    fn test_gate_close_ramps_out_then_forces_dry() {
        let settings = EffectSettings {
            gate_open: 0.1,
            gate_close: 0.05,
            gate_hold_blocks: 1,
            ..EffectSettings::default()
        };
        let mut runtime = EffectRuntime::new(EffectId(8), Gain::boxed(0.0), context(N))
            .unwrap()
            .with_settings(&settings)
            .unwrap();

        runtime.process_block(&mut constant(N, 0.5)).unwrap();

        let mut block = constant(N, 0.01);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(runtime.state(), RunState::GateClosed);
        assert!(!runtime.status().gate_open());
        let left: Vec<f32> = block.iter().map(|f| f[0]).collect();
        let expected = [0.0, 0.0025, 0.005, 0.0075];
        for (got, want) in left.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-7);
        }

        let mut block = constant(N, 0.01);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(block, constant(N, 0.01));

        let mut block = constant(N, 0.5);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(runtime.state(), RunState::Running);
        assert_eq!(block[0][0], 0.5 * 0.75);
    }

    #[test]
    fn test_restart_rearms_closed_gate() {
        let settings = EffectSettings {
            gate_open: 0.1,
            gate_close: 0.05,
            gate_hold_blocks: 2,
            ..EffectSettings::default()
        };
        let mut runtime = EffectRuntime::new(EffectId(10), Gain::boxed(0.0), context(N))
            .unwrap()
            .with_settings(&settings)
            .unwrap();
        let handle = runtime.handle();

        runtime.process_block(&mut constant(N, 0.5)).unwrap();
        runtime.process_block(&mut constant(N, 0.5)).unwrap();
        runtime.process_block(&mut constant(N, 0.01)).unwrap();
        runtime.process_block(&mut constant(N, 0.01)).unwrap();
        assert_eq!(runtime.state(), RunState::GateClosed);

        handle.set_enabled(false);
        runtime.process_block(&mut constant(N, 0.0)).unwrap();
        assert_eq!(runtime.state(), RunState::Stopped);

        handle.set_enabled(true);
        runtime.process_block(&mut constant(N, 0.0)).unwrap();
        assert_eq!(runtime.state(), RunState::Starting);

        // One quiet block is below the hold count of a freshly armed gate
        runtime.process_block(&mut constant(N, 0.0)).unwrap();
        assert_eq!(runtime.state(), RunState::Running);
        assert!(runtime.status().gate_open());
    }

    #[test]
    fn test_handle_taken_before_settings_controls_wet() {
        let runtime = EffectRuntime::new(EffectId(12), Gain::boxed(0.0), context(N)).unwrap();
        let handle = runtime.handle();
        let mut runtime = runtime.with_settings(&EffectSettings::default()).unwrap();

        for _ in 0..3 {
            runtime.process_block(&mut constant(N, 1.0)).unwrap();
        }
        let mut block = constant(N, 1.0);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(block, constant(N, 0.0));

        handle.set_wet(0.0);
        for _ in 0..3 {
            block = constant(N, 1.0);
            runtime.process_block(&mut block).unwrap();
        }
        assert_eq!(runtime.handle().wet(), 0.0);
        assert_eq!(block, constant(N, 1.0));
    }

    #[test]
    fn test_resampled_effect_mixes_at_host_rate() {
        let effect = Box::new(Gain {
            gain: 0.0,
            internal_rate: Some(24000),
        });
        let mut runtime = EffectRuntime::new(EffectId(9), effect, context(8)).unwrap();
        let shared = runtime.resampler().expect("effect runs at its own rate");
        assert_eq!(shared.lock().unwrap().internal_frames(), 4);

        let mut block = constant(8, 1.0);
        runtime.process_block(&mut block).unwrap();
        // Wet is silence, so the output is the dry ramp-out of the crossfade
        assert_eq!(block[7], [0.0, 0.0]);
        assert_eq!(block[0], [0.875, 0.875]);

        let mut block = constant(8, 1.0);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(block, constant(8, 0.0));
    }

    #[test]
    fn test_busy_resampler_passes_through() {
        let effect = Box::new(Gain {
            gain: 0.0,
            internal_rate: Some(24000),
        });
        let mut runtime = EffectRuntime::new(EffectId(10), effect, context(8)).unwrap();
        let shared = runtime.resampler().unwrap();

        let _guard = shared.lock().unwrap();
        let mut block = constant(8, 1.0);
        runtime.process_block(&mut block).unwrap();
        assert_eq!(block, constant(8, 1.0));
        assert_eq!(runtime.state(), RunState::Stopped);
    }

    #[test]
    fn test_unnotified_rate_change_is_fatal_for_block() {
        let effect = Box::new(Gain {
            gain: 0.0,
            internal_rate: Some(24000),
        });
        let mut runtime = EffectRuntime::new(EffectId(11), effect, context(8)).unwrap();
        runtime.resampler().unwrap().lock().unwrap().reinitialize(44100, 8);

        let mut block = constant(8, 1.0);
        let err = runtime.process_block(&mut block).unwrap_err();
        assert!(matches!(err, EffectError::RateMismatch { expected: 48000, actual: 44100 }));
        assert_eq!(block, constant(8, 1.0));
    }

    #[test]
    fn test_degenerate_ratio_bypasses_effect() {
        let effect = Box::new(Gain {
            gain: 0.0,
            internal_rate: Some(0),
        });
        let mut runtime = EffectRuntime::new(EffectId(12), effect, context(8)).unwrap();

        let mut block = constant(8, 1.0);
        assert!(!runtime.process_block(&mut block).unwrap());
        assert_eq!(block, constant(8, 1.0));
        assert_eq!(runtime.state(), RunState::Stopped);
        assert!(!runtime.status().is_okay());
    }

    #[test]
    fn test_mixer_context_change_rebuilds_resampler() {
        let effect = Box::new(Gain {
            gain: 0.0,
            internal_rate: Some(24000),
        });
        let mut runtime = EffectRuntime::new(EffectId(13), effect, context(8)).unwrap();
        runtime
            .set_mixer_context(MixerContext::new(SampleRate::Hz96000, 16))
            .unwrap();

        let shared = runtime.resampler().unwrap();
        assert_eq!(shared.lock().unwrap().host_rate(), 96000);
        assert_eq!(shared.lock().unwrap().internal_frames(), 4);

        let mut block = constant(16, 1.0);
        assert!(runtime.process_block(&mut block).is_ok());
        assert!(runtime.set_mixer_context(MixerContext::new(SampleRate::Custom(0), 16)).is_err());
    }

    #[test]
    fn test_block_size_mismatch() {
        let mut runtime = EffectRuntime::new(EffectId(14), Gain::boxed(0.0), context(N)).unwrap();
        let mut block = constant(N + 1, 1.0);
        let err = runtime.process_block(&mut block).unwrap_err();
        assert!(matches!(err, EffectError::BlockSizeMismatch { expected: 4, actual: 5 }));
    }

    #[test]
    fn test_transitions_are_reported() {
        let (tx, rx) = event_channel(16);
        let mut runtime = EffectRuntime::new(EffectId(15), Gain::boxed(0.0), context(N))
            .unwrap()
            .with_events(tx);
        let handle = runtime.handle();

        runtime.process_block(&mut constant(N, 1.0)).unwrap();
        runtime.process_block(&mut constant(N, 1.0)).unwrap();
        handle.set_enabled(false);
        runtime.process_block(&mut constant(N, 1.0)).unwrap();

        let events: Vec<RuntimeEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                RuntimeEvent::StateChanged {
                    effect: EffectId(15),
                    from: RunState::Stopped,
                    to: RunState::Starting
                },
                RuntimeEvent::StateChanged {
                    effect: EffectId(15),
                    from: RunState::Starting,
                    to: RunState::Running
                },
                RuntimeEvent::StateChanged {
                    effect: EffectId(15),
                    from: RunState::Running,
                    to: RunState::Stopping
                },
            ]
        );
    }

    #[test]
    fn test_full_event_channel_never_blocks() {
        let (tx, _rx) = event_channel(1);
        let mut runtime = EffectRuntime::new(EffectId(16), Gain::boxed(0.0), context(N))
            .unwrap()
            .with_events(tx);
        let handle = runtime.handle();

        for enabled in [true, true, false, false, true, true] {
            handle.set_enabled(enabled);
            runtime.process_block(&mut constant(N, 1.0)).unwrap();
        }
        assert!(runtime.status().dropped_events() > 0);
    }
}
