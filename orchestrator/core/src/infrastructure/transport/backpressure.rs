// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Publisher pause/resume with hysteresis.
//!
//! The gate closes when pending (unacknowledged) messages reach the threshold
//! `T` and reopens only once pending has fallen to `floor(T * resume_ratio)`.
//! Between the two marks the gate keeps whatever state it had.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateTransition {
    Unchanged,
    Paused,
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackpressureGate {
    threshold: usize,
    resume_at: usize,
    paused: bool,
}

impl BackpressureGate {
    pub fn new(threshold: usize, resume_ratio: f64) -> Self {
        let threshold = threshold.max(1);
        let ratio = if resume_ratio > 0.0 && resume_ratio < 1.0 { resume_ratio } else { 0.8 };
        let resume_at = ((threshold as f64) * ratio).floor() as usize;
        Self {
            threshold,
            resume_at: resume_at.min(threshold - 1),
            paused: false,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn resume_at(&self) -> usize {
        self.resume_at
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Feed the current pending count and report whether the gate flipped.
    pub fn observe(&mut self, pending: usize) -> GateTransition {
        if !self.paused && pending >= self.threshold {
            self.paused = true;
            GateTransition::Paused
        } else if self.paused && pending <= self.resume_at {
            self.paused = false;
            GateTransition::Resumed
        } else {
            GateTransition::Unchanged
        }
    }
}
