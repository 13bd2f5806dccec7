//! Integration tests for effect runtimes
//!
//! These drive whole chains block by block and check what a host would
//! observe: output samples, run states and the event stream.

use crossbeam::channel::Receiver;
use fxrack_core::domain::audio::{self, EffectError, Frame, MixerContext, Result, SampleRate};
use fxrack_core::domain::config::{EffectConfig, EffectSettings, EngineConfig, ResamplerQuality};
use fxrack_core::domain::crossfade::Crossfade;
use fxrack_core::domain::dsp::{AmplifierParams, EffectKind, FilterParams, FilterShape};
use fxrack_core::domain::resampler::LinearFactory;
use fxrack_core::domain::run_state::RunState;
use fxrack_core::domain::runtime::{
    event_channel, AudioEffect, EffectId, EffectRuntime, RuntimeEvent,
};
use fxrack_core::domain::EffectChain;
use fxrack_infra::{converter_factory, sine_burst, BlockRenderer, SincFactory, TimelineKind};
use proptest::prelude::*;
use std::sync::Arc;

fn constant(frames: usize, value: f32) -> Vec<Frame> {
    vec![[value, value]; frames]
}

fn context(frames: usize) -> MixerContext {
    MixerContext::new(SampleRate::Hz48000, frames)
}

fn drain(rx: &Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    rx.try_iter().collect()
}

fn transitions(events: &[RuntimeEvent]) -> Vec<RunState> {
    events
        .iter()
        .filter_map(|event| match event {
            RuntimeEvent::StateChanged { to, .. } => Some(*to),
            RuntimeEvent::Faulted { .. } => None,
        })
        .collect()
}

/// Inverts the signal, so any wet leak is obvious
struct Invert;

impl AudioEffect for Invert {
    fn name(&self) -> &str {
        "invert"
    }

    fn run_dsp(&mut self, block: &mut [Frame], crossfade: &Crossfade<'_>) -> Result<bool> {
        for (f, frame) in block.iter_mut().enumerate() {
            *frame = crossfade.mix(f, *frame, [-frame[0], -frame[1]]);
        }
        Ok(true)
    }
}

/// Fails once after a given number of calls
struct FailsAt {
    calls: u32,
    fail_at: u32,
}

impl AudioEffect for FailsAt {
    fn name(&self) -> &str {
        "fails-at"
    }

    fn run_dsp(&mut self, block: &mut [Frame], crossfade: &Crossfade<'_>) -> Result<bool> {
        self.calls += 1;
        if self.calls == self.fail_at {
            return Err(EffectError::DspFault {
                effect: "fails-at".into(),
                reason: "scheduled".into(),
            });
        }
        for (f, frame) in block.iter_mut().enumerate() {
            *frame = crossfade.mix(f, *frame, [0.0, 0.0]);
        }
        Ok(true)
    }
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_full_lifecycle_through_chain() {
    let (tx, rx) = event_channel(64);
    let mut chain = EffectChain::new(context(256)).with_events(tx);
    let id = chain.push(Box::new(Invert)).unwrap();
    let handle = chain.handles()[0].clone();

    // Ramp-in
    let mut block = constant(256, 0.5);
    chain.process_block(&mut block);
    assert!(block[0][0] > 0.49);
    assert!((block[255][0] + 0.5).abs() < 1e-3);

    // Steady state
    let mut block = constant(256, 0.5);
    chain.process_block(&mut block);
    assert_eq!(block, constant(256, -0.5));

    // Ramp-out on disable, then untouched
    handle.set_enabled(false);
    let mut block = constant(256, 0.5);
    chain.process_block(&mut block);
    assert!(block[0][0] < -0.49);
    assert!((block[255][0] - 0.5).abs() < 1e-2);

    let mut block = constant(256, 0.5);
    chain.process_block(&mut block);
    assert_eq!(block, constant(256, 0.5));

    assert_eq!(
        transitions(&drain(&rx)),
        vec![
            RunState::Starting,
            RunState::Running,
            RunState::Stopping,
            RunState::Stopped
        ]
    );
    assert_eq!(chain.get(id).unwrap().state(), RunState::Stopped);
}

#[test]
fn test_auto_quit_wakes_on_signal() {
    let mut config = EngineConfig::default();
    config.engine.frames_per_period = 480;
    config.chain.effects.push(EffectConfig {
        kind: EffectKind::Amplifier(AmplifierParams {
            gain: 2.0,
            ..AmplifierParams::default()
        }),
        settings: EffectSettings {
            auto_quit_ms: 20,
            ..EffectSettings::default()
        },
    });

    let (tx, rx) = event_channel(64);
    let mut chain = EffectChain::from_config(&config, Arc::new(LinearFactory), Some(tx)).unwrap();

    chain.process_block(&mut constant(480, 0.25));
    for _ in 0..10 {
        chain.process_block(&mut constant(480, 0.0));
    }
    assert_eq!(chain.runtimes()[0].state(), RunState::Idle);

    // Idle blocks leave the signal alone and count as skipped
    let skipped = chain.runtimes()[0].status().skipped_blocks();
    let mut quiet = constant(480, 0.0);
    assert!(!chain.process_block(&mut quiet));
    assert_eq!(chain.runtimes()[0].status().skipped_blocks(), skipped + 1);

    let mut block = constant(480, 0.25);
    assert!(chain.process_block(&mut block));
    assert_eq!(chain.runtimes()[0].state(), RunState::Starting);
    // Ramp-in from dry towards twice the input
    assert!((block[0][0] - 0.25).abs() < 1e-2);
    assert!(block[479][0] > 0.49);

    let states = transitions(&drain(&rx));
    assert!(states.contains(&RunState::Idle));
    assert_eq!(states.last(), Some(&RunState::Starting));
}

proptest! {
    #[test]
    fn prop_disabled_runtime_never_touches_audio(
        samples in prop::collection::vec(-1.0f32..1.0, 64),
        blocks in 1usize..8,
    ) {
        let mut runtime = EffectRuntime::new(EffectId(0), Box::new(Invert), context(64)).unwrap();
        runtime.handle().set_enabled(false);

        for _ in 0..blocks {
            let input: Vec<Frame> = samples.iter().map(|&s| [s, -s]).collect();
            let mut block = input.clone();
            let keep = runtime.process_block(&mut block).unwrap();
            prop_assert!(!keep);
            prop_assert_eq!(&block, &input);
            prop_assert_eq!(runtime.state(), RunState::Stopped);
        }
        prop_assert_eq!(runtime.status().processed_blocks(), 0);
    }

    #[test]
    fn prop_wet_zero_is_transparent_after_ramp(
        samples in prop::collection::vec(-1.0f32..1.0, 32),
    ) {
        let mut runtime = EffectRuntime::new(EffectId(0), Box::new(Invert), context(32))
            .unwrap()
            .with_settings(&EffectSettings { wet: 0.0, ..EffectSettings::default() })
            .unwrap();
        let input: Vec<Frame> = samples.iter().map(|&s| [s, s]).collect();

        runtime.process_block(&mut input.clone()).unwrap();
        let mut block = input.clone();
        runtime.process_block(&mut block).unwrap();
        for (out, dry) in block.iter().zip(&input) {
            prop_assert!((out[0] - dry[0]).abs() < 1e-6);
        }
    }
}

// ============================================================================
// FAULTS
// ============================================================================

#[test]
fn test_fault_mid_stream_bypasses_and_recovers() {
    let (tx, rx) = event_channel(64);
    let mut chain = EffectChain::new(context(16)).with_events(tx);
    let faulty = chain
        .push(Box::new(FailsAt {
            calls: 0,
            fail_at: 3,
        }))
        .unwrap();
    chain.push(Box::new(Invert)).unwrap();

    chain.process_block(&mut constant(16, 0.5));
    chain.process_block(&mut constant(16, 0.5));

    // Third call fails: the block reaches Invert as dry input
    let mut block = constant(16, 0.5);
    assert!(chain.process_block(&mut block));
    assert_eq!(block, constant(16, -0.5));

    let handle = chain.handles()[0].clone();
    assert!(handle.is_faulted());
    assert_eq!(handle.state(), RunState::Stopped);

    // Stays bypassed until the fault is cleared
    for _ in 0..3 {
        let mut block = constant(16, 0.5);
        chain.process_block(&mut block);
        assert_eq!(block, constant(16, -0.5));
    }

    handle.clear_fault();
    chain.process_block(&mut constant(16, 0.5));
    assert_eq!(chain.get(faulty).unwrap().state(), RunState::Starting);

    let events = drain(&rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Faulted { effect } if *effect == faulty)));
    assert_eq!(chain.get(faulty).unwrap().status().fault_count(), 1);
}

// ============================================================================
// GATE
// ============================================================================

#[test]
fn test_gate_follows_handle_updates() {
    let mut chain = EffectChain::new(context(32));
    chain.push(Box::new(Invert)).unwrap();
    let handle = chain.handles()[0].clone();

    chain.process_block(&mut constant(32, 0.02));
    let mut block = constant(32, 0.02);
    chain.process_block(&mut block);
    assert_eq!(block, constant(32, -0.02));

    handle
        .set_gate(fxrack_core::domain::gate::GateConfig::with_thresholds(0.1, 0.05, 1))
        .unwrap();

    // Quiet input now closes the gate: one ramp-out block, then dry
    chain.process_block(&mut constant(32, 0.02));
    assert_eq!(handle.state(), RunState::GateClosed);
    let mut block = constant(32, 0.02);
    chain.process_block(&mut block);
    assert_eq!(block, constant(32, 0.02));

    // Loud input reopens with a ramp-in
    let mut block = constant(32, 0.5);
    chain.process_block(&mut block);
    assert_eq!(handle.state(), RunState::Running);
    assert!(block[0][0] > 0.0);
    assert!(block[31][0] < 0.0);
}

// ============================================================================
// RESAMPLED EFFECTS
// ============================================================================

fn filter_config(quality: ResamplerQuality) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.resampler_quality = quality;
    config.chain.effects.push(EffectConfig {
        kind: EffectKind::Filter(FilterParams {
            shape: FilterShape::Peaking,
            frequency: 1000.0,
            gain_db: 0.0,
            internal_rate: Some(24000),
            ..FilterParams::default()
        }),
        settings: EffectSettings::default(),
    });
    config
}

#[test]
fn test_flat_filter_at_half_rate_keeps_level() {
    for quality in [ResamplerQuality::Linear, ResamplerQuality::Sinc] {
        let mut renderer = BlockRenderer::from_config(&filter_config(quality)).unwrap();
        let input = sine_burst(SampleRate::Hz48000, 440.0, 0.5, 1.0, 1.0);
        let (output, report) = renderer.render(&input).unwrap();

        let tail = &output[output.len() / 2..];
        let level = audio::rms(tail);
        assert!(
            (level - audio::rms(&input[input.len() / 2..])).abs() < 0.03,
            "{quality:?}: rms {level}"
        );
        assert_eq!(report.effects[0].fault_count, 0);

        let runtime = &renderer.chain().runtimes()[0];
        let resampler = runtime.resampler().unwrap();
        assert_eq!(resampler.lock().unwrap().internal_frames(), 128);
    }
}

#[test]
fn test_rate_change_rebuilds_sinc_context() {
    let mut chain = EffectChain::from_config(
        &filter_config(ResamplerQuality::Sinc),
        converter_factory(ResamplerQuality::Sinc),
        None,
    )
    .unwrap();

    chain
        .set_mixer_context(MixerContext::new(SampleRate::Hz44100, 441))
        .unwrap();
    let resampler = chain.runtimes()[0].resampler().unwrap();
    {
        let context = resampler.lock().unwrap();
        assert_eq!(context.host_rate(), 44100);
        assert_eq!(context.internal_frames(), 240);
        assert!(context.is_okay());
    }

    let mut block = constant(441, 0.1);
    for _ in 0..4 {
        chain.process_block(&mut block);
        assert!(audio::is_finite(&block));
    }
}

#[test]
fn test_push_runtime_with_sinc_converters() {
    let mut chain = EffectChain::with_converters(context(256), Arc::new(SincFactory::default()));
    let effect = fxrack_core::domain::dsp::EffectFactory
        .build(
            &EffectKind::Filter(FilterParams {
                internal_rate: Some(32000),
                ..FilterParams::default()
            }),
            48000,
            256,
        )
        .unwrap();
    let runtime = EffectRuntime::with_converters(
        EffectId(41),
        effect,
        context(256),
        Arc::new(SincFactory::default()),
    )
    .unwrap();
    chain.push_runtime(runtime).unwrap();

    let next = chain.push(Box::new(Invert)).unwrap();
    assert_eq!(next, EffectId(42));

    let foreign = EffectRuntime::new(EffectId(99), Box::new(Invert), context(128)).unwrap();
    assert!(chain.push_runtime(foreign).is_err());
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[tokio::test]
async fn test_config_file_drives_renderer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fxrack.toml");

    let mut config = EngineConfig::factory_default();
    config.engine.frames_per_period = 128;
    config.save_to_file(&path).await.unwrap();

    let loaded = EngineConfig::load_from_file(&path).await.unwrap();
    assert_eq!(loaded, config);

    let mut renderer = BlockRenderer::from_config(&loaded).unwrap();
    let input = sine_burst(SampleRate::Hz48000, 330.0, 0.4, 0.25, 2.0);
    let (_, report) = renderer.render(&input).unwrap();

    assert_eq!(report.effects.len(), loaded.chain.effects.len());
    // The analyzer never auto-quits; the amplifier does after 500 ms of silence
    let idle: Vec<EffectId> = report
        .timeline
        .iter()
        .filter(|e| matches!(e.kind, TimelineKind::StateChanged { to: RunState::Idle, .. }))
        .map(|e| e.effect)
        .collect();
    assert!(idle.contains(&EffectId(1)));
    assert!(!idle.contains(&EffectId(2)));
}
