//! Domain entities and real-time rules

pub mod audio;
pub mod automation;
pub mod chain;
pub mod config;
pub mod crossfade;
pub mod dsp;
pub mod gate;
pub mod resampler;
pub mod run_state;
pub mod runtime;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{EffectError, Frame, MixerContext, SampleRate, SILENCE};
pub use automation::{Parameter, ParameterHandle, ParameterSet, ValueBuffer};
pub use chain::EffectChain;
pub use config::{
    ChainConfig, ConfigError, ConfigManager, EffectConfig, EffectSettings, EngineConfig,
    EngineSettings, ResamplerQuality,
};
pub use crossfade::{Crossfade, CrossfadeComputer, MixCoefficients, SmoothingFlags};
pub use dsp::{EffectFactory, EffectKind};
pub use gate::{Gate, GateConfig, GateState};
pub use resampler::{ConverterFactory, LinearConverter, LinearFactory, RateConverter, ResamplerContext};
pub use run_state::{BlockDecision, BlockInput, RunState, RunStateMachine};
pub use runtime::{
    event_channel, AudioEffect, EffectId, EffectRuntime, RuntimeEvent, RuntimeHandle, RuntimeStatus,
    SharedResampler,
};
