//! Per-effect run state
//!
//! One state machine per effect decides, at each block boundary, whether the
//! DSP runs and whether this block ramps the wet signal in or out. The
//! auto-quit timer is the only thing that stops an enabled effect on its own,
//! and it only ever takes effect at the next block boundary.

use crate::domain::crossfade::SmoothingFlags;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle state of an effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RunState {
    /// Disabled, or faulted; no DSP
    #[default]
    Stopped,
    /// First active block, wet ramps in
    Starting,
    /// DSP every block at the configured wet level
    Running,
    /// Gate closed, output forced to dry
    GateClosed,
    /// Last active block, wet ramps out
    Stopping,
    /// Enabled but asleep after sustained silence
    Idle,
}

impl RunState {
    /// States whose blocks run the DSP hook
    pub fn executes(&self) -> bool {
        matches!(
            self,
            RunState::Starting | RunState::Running | RunState::GateClosed | RunState::Stopping
        )
    }

    /// Short label for logs and the CLI timeline
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Stopped => "stopped",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::GateClosed => "gate-closed",
            RunState::Stopping => "stopping",
            RunState::Idle => "idle",
        }
    }
}

/// Inputs to one block decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInput {
    /// User-facing enabled flag
    pub enabled: bool,
    /// False when the effect cannot run (fault, degenerate resampler)
    pub okay: bool,
    /// Any input sample above the silence threshold
    pub input_active: bool,
    /// Gate decision for this block
    pub gate_open: bool,
}

/// Outcome of [`RunStateMachine::should_process_audio_buffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDecision {
    pub execute: bool,
    pub flags: SmoothingFlags,
    pub state: RunState,
}

impl BlockDecision {
    /// The block's output must be the dry input regardless of what the DSP produced
    pub fn forced_dry(&self) -> bool {
        self.state == RunState::GateClosed && !self.flags.is_ramp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Disabled,
    AutoQuit,
}

/// Enabled / running / gate / auto-quit state of one effect
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    stop_reason: StopReason,
    auto_quit_pending: bool,
    auto_quit_disabled: bool,
    silent_frames: u64,
    timeout_frames: u64,
    silence_threshold: f32,
}

impl RunStateMachine {
    /// Default level at or below which output counts as silent
    pub const DEFAULT_SILENCE_THRESHOLD: f32 = 1.0e-6;

    pub fn new(timeout_frames: u64) -> Self {
        Self {
            state: RunState::Stopped,
            stop_reason: StopReason::Disabled,
            auto_quit_pending: false,
            auto_quit_disabled: false,
            silent_frames: 0,
            timeout_frames,
            silence_threshold: Self::DEFAULT_SILENCE_THRESHOLD,
        }
    }

    pub fn with_silence_threshold(mut self, threshold: f32) -> Self {
        self.silence_threshold = threshold.max(0.0);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn silence_threshold(&self) -> f32 {
        self.silence_threshold
    }

    pub fn set_timeout_frames(&mut self, frames: u64) {
        self.timeout_frames = frames;
    }

    /// Suppress the stop-by-timeout transition (always-on analyzers)
    pub fn set_auto_quit_disabled(&mut self, disabled: bool) {
        self.auto_quit_disabled = disabled;
        if disabled {
            self.auto_quit_pending = false;
            self.silent_frames = 0;
        }
    }

    /// Whether the gate should be evaluated for the coming block
    ///
    /// Only blocks that continue an active run feed the gate; a ramp-in block
    /// re-arms it instead.
    pub fn gate_is_live(&self) -> bool {
        matches!(
            self.state,
            RunState::Starting | RunState::Running | RunState::GateClosed
        )
    }

    /// Decide whether the coming block runs, and with which ramp
    pub fn should_process_audio_buffer(&mut self, input: &BlockInput) -> BlockDecision {
        let settled = match self.state {
            RunState::Starting => RunState::Running,
            RunState::Stopping => match self.stop_reason {
                StopReason::AutoQuit => RunState::Idle,
                StopReason::Disabled => RunState::Stopped,
            },
            state => state,
        };

        let (next, flags) = match settled {
            RunState::Stopped | RunState::Idle if !input.enabled || !input.okay => {
                (RunState::Stopped, SmoothingFlags::NONE)
            }
            RunState::Stopped => (RunState::Starting, SmoothingFlags::BEGIN),
            RunState::Idle if input.input_active => (RunState::Starting, SmoothingFlags::BEGIN),
            RunState::Idle => (RunState::Idle, SmoothingFlags::NONE),
            RunState::Running | RunState::Starting => {
                if !input.okay {
                    (RunState::Stopped, SmoothingFlags::NONE)
                } else if !input.enabled {
                    self.stop_reason = StopReason::Disabled;
                    (RunState::Stopping, SmoothingFlags::END)
                } else if self.auto_quit_pending {
                    self.stop_reason = StopReason::AutoQuit;
                    (RunState::Stopping, SmoothingFlags::END)
                } else if !input.gate_open {
                    (RunState::GateClosed, SmoothingFlags::END)
                } else {
                    (RunState::Running, SmoothingFlags::NONE)
                }
            }
            RunState::GateClosed | RunState::Stopping => {
                // Wet is already at zero here, a ramp-out would bring it back
                if !input.okay || !input.enabled {
                    (RunState::Stopped, SmoothingFlags::NONE)
                } else if self.auto_quit_pending {
                    (RunState::Idle, SmoothingFlags::NONE)
                } else if input.gate_open {
                    (RunState::Running, SmoothingFlags::BEGIN)
                } else {
                    (RunState::GateClosed, SmoothingFlags::NONE)
                }
            }
        };

        if next == RunState::Starting || !next.executes() {
            self.auto_quit_pending = false;
            self.silent_frames = 0;
        }

        if next != self.state {
            debug!(from = self.state.label(), to = next.label(), "run state transition");
        }
        self.state = next;

        BlockDecision {
            execute: next.executes(),
            flags,
            state: next,
        }
    }

    /// Update the auto-quit timer from the output of a block that ran
    ///
    /// Returns false when the effect should stop; the stop happens at the
    /// next block boundary.
    pub fn should_keep_running(&mut self, output_rms: f32, frames: usize) -> bool {
        match self.state {
            RunState::Stopping => return false,
            RunState::Starting | RunState::Running | RunState::GateClosed => {}
            RunState::Stopped | RunState::Idle => return false,
        }

        if self.auto_quit_disabled {
            return true;
        }
        if self.auto_quit_pending {
            return false;
        }

        if output_rms <= self.silence_threshold {
            self.silent_frames += frames as u64;
        } else {
            self.silent_frames = 0;
        }

        if self.silent_frames > self.timeout_frames {
            debug!(
                silent_frames = self.silent_frames,
                timeout_frames = self.timeout_frames,
                "auto-quit timeout reached"
            );
            self.auto_quit_pending = true;
            self.silent_frames = 0;
            return false;
        }

        true
    }

    /// Force Stopped after a DSP fault
    pub fn fault(&mut self) {
        if self.state != RunState::Stopped {
            debug!(from = self.state.label(), "run state forced to stopped");
        }
        self.state = RunState::Stopped;
        self.stop_reason = StopReason::Disabled;
        self.auto_quit_pending = false;
        self.silent_frames = 0;
    }
}
