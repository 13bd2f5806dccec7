//! Hysteretic activity gate
//!
//! Decides once per block whether the effect's input is "active" or
//! "resting", independently of the enabled flag. Two thresholds (open above,
//! close below, with a dead-band between them) and block counters keep the
//! decision from chattering around a single level.

use crate::domain::audio::{EffectError, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Gate thresholds and timing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// RMS level the estimate must reach to reopen; 0 disables gating
    pub open_threshold: f32,
    /// RMS level the estimate must fall below to count towards closing
    pub close_threshold: f32,
    /// Consecutive below-close blocks needed to close
    pub hold_blocks: u32,
    /// Consecutive above-open blocks needed to reopen
    pub reopen_blocks: u32,
    /// Weight of the previous estimate, `0.0` follows the block RMS exactly
    pub estimate_smoothing: f32,
    /// Keep running the DSP while closed so filter state stays continuous
    pub run_dsp_while_closed: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            open_threshold: 0.0,
            close_threshold: 0.0,
            hold_blocks: 8,
            reopen_blocks: 1,
            estimate_smoothing: 0.0,
            run_dsp_while_closed: true,
        }
    }
}

impl GateConfig {
    /// Gate with the given thresholds and hold count, other fields default
    pub fn with_thresholds(open_threshold: f32, close_threshold: f32, hold_blocks: u32) -> Self {
        Self {
            open_threshold,
            close_threshold,
            hold_blocks,
            ..Default::default()
        }
    }

    /// A zero open threshold disables gating
    pub fn is_enabled(&self) -> bool {
        self.open_threshold > 0.0
    }

    pub fn validate(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if !(self.close_threshold >= 0.0 && self.close_threshold < self.open_threshold) {
            return Err(EffectError::InvalidConfiguration(format!(
                "gate close threshold {} must be in [0, {})",
                self.close_threshold, self.open_threshold
            )));
        }
        if self.hold_blocks == 0 || self.reopen_blocks == 0 {
            return Err(EffectError::InvalidConfiguration(
                "gate hold and reopen counts must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.estimate_smoothing) {
            return Err(EffectError::InvalidConfiguration(format!(
                "gate estimate smoothing {} must be in [0, 1)",
                self.estimate_smoothing
            )));
        }
        Ok(())
    }
}

/// State carried from block to block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateState {
    pub estimate: f32,
    pub open: bool,
    pub below_count: u32,
    pub above_count: u32,
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            estimate: 0.0,
            open: true,
            below_count: 0,
            above_count: 0,
        }
    }
}

/// Input-level gate with hysteresis
#[derive(Debug, Clone)]
pub struct Gate {
    config: GateConfig,
    state: GateState,
}

impl Gate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::default(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Replace thresholds; the open/closed decision carries over
    pub fn set_config(&mut self, config: GateConfig) {
        self.config = config;
        if !config.is_enabled() {
            self.state.open = true;
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state.open
    }

    /// Force the gate open and clear the counters
    ///
    /// Called on every ramp-in block so a quiet first block cannot close the
    /// gate before the ramp has completed.
    pub fn rearm(&mut self) {
        self.state = GateState::default();
    }

    /// Feed one block's input RMS; returns whether the gate is open
    pub fn update(&mut self, input_rms: f32) -> bool {
        if !self.config.is_enabled() {
            self.state.open = true;
            return true;
        }

        let s = self.config.estimate_smoothing;
        let estimate = s * self.state.estimate + (1.0 - s) * input_rms;
        self.state.estimate = estimate;

        if self.state.open {
            if estimate < self.config.close_threshold {
                self.state.below_count += 1;
                if self.state.below_count >= self.config.hold_blocks {
                    self.state.open = false;
                    self.state.below_count = 0;
                    self.state.above_count = 0;
                    trace!(estimate, "gate closed");
                }
            } else {
                self.state.below_count = 0;
            }
        } else if estimate >= self.config.open_threshold {
            self.state.above_count += 1;
            if self.state.above_count >= self.config.reopen_blocks {
                self.state.open = true;
                self.state.above_count = 0;
                self.state.below_count = 0;
                trace!(estimate, "gate opened");
            }
        } else {
            self.state.above_count = 0;
        }

        self.state.open
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}
