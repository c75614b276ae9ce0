// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Autocast flag and dynamic loss scaling.
//!
//! Autocast is a per-thread switch that forward passes may consult to run
//! their matmuls in reduced precision. [`GradScaler`] multiplies the loss
//! gradient by a large factor before backward and divides it out again before
//! the optimiser runs, shrinking the factor whenever a non-finite gradient
//! shows up.

use crate::module::Module;
use crate::optim::Adam;
use crate::PureResult;
use st_tensor::TensorError;
use std::cell::Cell;
use tracing::debug;

thread_local! {
    static AUTOCAST: Cell<bool> = const { Cell::new(false) };
}

pub fn autocast_enabled() -> bool {
    AUTOCAST.with(Cell::get)
}

/// Sets the autocast flag of the current thread until dropped, then restores
/// whatever was there before. Guards nest.
#[derive(Debug)]
pub struct AutocastGuard {
    restore: bool,
}

impl AutocastGuard {
    pub fn new(enabled: bool) -> Self {
        let restore = AUTOCAST.with(|flag| flag.replace(enabled));
        Self { restore }
    }

    pub fn enable() -> Self {
        Self::new(true)
    }
}

impl Drop for AutocastGuard {
    fn drop(&mut self) {
        let restore = self.restore;
        AUTOCAST.with(|flag| flag.set(restore));
    }
}

/// Growth and backoff policy of a [`GradScaler`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScalerSchedule {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Consecutive finite steps required before the scale grows.
    pub growth_interval: u32,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for ScalerSchedule {
    /// 2¹⁶ initial scale, doubled after 2000 clean steps, halved on overflow.
    fn default() -> Self {
        Self {
            init_scale: 65_536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 16_777_216.0,
        }
    }
}

impl ScalerSchedule {
    fn validate(&self) -> PureResult<()> {
        let checks: [(bool, &'static str); 5] = [
            (
                self.init_scale.is_finite() && self.init_scale > 0.0,
                "grad_scaler_init_scale",
            ),
            (
                self.growth_factor.is_finite() && self.growth_factor > 1.0,
                "grad_scaler_growth_factor",
            ),
            (
                self.backoff_factor > 0.0 && self.backoff_factor < 1.0,
                "grad_scaler_backoff_factor",
            ),
            (self.growth_interval > 0, "grad_scaler_growth_interval"),
            (
                self.min_scale > 0.0
                    && self.max_scale.is_finite()
                    && self.min_scale <= self.max_scale,
                "grad_scaler_limits",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some(&(_, label)) => Err(TensorError::InvalidValue { label }),
            None => Ok(()),
        }
    }
}

/// Dynamic loss scaler owning the scale of a single optimiser.
///
/// A disabled scaler has a unit scale that never changes and steps the
/// optimiser unconditionally.
#[derive(Clone, Debug)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
    schedule: ScalerSchedule,
    clean_steps: u32,
}

impl GradScaler {
    pub fn new(schedule: ScalerSchedule) -> PureResult<Self> {
        schedule.validate()?;
        Ok(Self {
            enabled: true,
            scale: schedule.init_scale,
            schedule,
            clean_steps: 0,
        })
    }

    /// Enabled scaler with [`ScalerSchedule::default`].
    pub fn amp_default() -> Self {
        let schedule = ScalerSchedule::default();
        Self {
            enabled: true,
            scale: schedule.init_scale,
            schedule,
            clean_steps: 0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            scale: 1.0,
            ..Self::amp_default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Factor the loss gradient must be multiplied by before backward.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn schedule(&self) -> &ScalerSchedule {
        &self.schedule
    }

    fn unscale<M: Module + ?Sized>(&self, module: &mut M) -> PureResult<()> {
        let inverse = self.scale.recip();
        module.visit_parameters_mut(&mut |param| {
            param.scale_accumulators(inverse);
            Ok(())
        })
    }

    fn found_non_finite<M: Module + ?Sized>(&self, module: &M) -> PureResult<bool> {
        let mut found = false;
        module.visit_parameters(&mut |param| {
            found |= !param.accumulators_norm_sq().is_finite();
            Ok(())
        })?;
        Ok(found)
    }

    /// Backs off after an overflow, otherwise counts towards the next growth.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        let ScalerSchedule {
            growth_factor,
            backoff_factor,
            growth_interval,
            min_scale,
            max_scale,
            ..
        } = self.schedule;
        if found_inf {
            self.clean_steps = 0;
            self.scale = (self.scale * backoff_factor).clamp(min_scale, max_scale);
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps >= growth_interval {
            self.clean_steps = 0;
            self.scale = (self.scale * growth_factor).clamp(min_scale, max_scale);
        }
    }

    /// Unscales the module's gradients and runs `optimizer` unless one of them
    /// is non-finite, in which case the gradients are zeroed instead. Updates
    /// the scale either way and reports whether the optimiser ran.
    pub fn step<M: Module + ?Sized>(
        &mut self,
        optimizer: &mut Adam,
        module: &mut M,
    ) -> PureResult<bool> {
        if !self.enabled {
            optimizer.step(module)?;
            return Ok(true);
        }
        self.unscale(module)?;
        let overflow = self.found_non_finite(module)?;
        if overflow {
            debug!(scale = self.scale, "non-finite gradients; optimiser step skipped");
            module.zero_accumulators()?;
        } else {
            optimizer.step(module)?;
        }
        self.update(overflow);
        Ok(!overflow)
    }
}
