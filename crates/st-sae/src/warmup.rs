// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::f32::consts::PI;

/// Cosine ease-in for the consensus term, driven by the trainer's global step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WarmupSchedule {
    horizon: u64,
    step: u64,
}

impl WarmupSchedule {
    pub fn new(horizon: u64) -> Self {
        Self { horizon, step: 0 }
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Moves to the next step and returns it. The counter never resets.
    pub fn advance(&mut self) -> u64 {
        self.step = self.step.saturating_add(1);
        self.step
    }

    pub fn factor(&self) -> f32 {
        self.factor_at(self.step)
    }

    /// `0.5 * (1 + cos(π (h - s) / h))` before the horizon, `1` from it on.
    pub fn factor_at(&self, step: u64) -> f32 {
        if step >= self.horizon {
            return 1.0;
        }
        let remaining = (self.horizon - step) as f32 / self.horizon as f32;
        0.5 * (1.0 + (PI * remaining).cos())
    }
}
