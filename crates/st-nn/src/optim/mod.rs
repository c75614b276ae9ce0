// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Module;
use crate::PureResult;
use st_tensor::TensorError;
use std::collections::HashMap;

/// Adam hyperparameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

#[derive(Clone, Debug)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
}

/// Adam optimiser owning first/second moment buffers for one module, keyed by
/// parameter name.
#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f32,
    config: AdamConfig,
    step: u32,
    moments: HashMap<String, Moments>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> PureResult<Self> {
        Self::with_config(learning_rate, AdamConfig::default())
    }

    pub fn with_config(learning_rate: f32, config: AdamConfig) -> PureResult<Self> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        if !(0.0..1.0).contains(&config.beta1) || !(0.0..1.0).contains(&config.beta2) {
            return Err(TensorError::InvalidValue { label: "adam_betas" });
        }
        Ok(Self {
            learning_rate,
            config,
            step: 0,
            moments: HashMap::new(),
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u32 {
        self.step
    }

    /// Clears accumulated gradients on the module.
    pub fn zero_grad<M: Module + ?Sized>(&self, module: &mut M) -> PureResult<()> {
        module.zero_accumulators()
    }

    /// Applies one bias-corrected Adam update to every parameter that carries a
    /// gradient. Gradients are left in place.
    pub fn step<M: Module + ?Sized>(&mut self, module: &mut M) -> PureResult<()> {
        self.step = self.step.saturating_add(1);
        let AdamConfig { beta1, beta2, eps } = self.config;
        let bc1_inv = 1.0 / (1.0 - beta1.powi(self.step as i32));
        let bc2_inv = 1.0 / (1.0 - beta2.powi(self.step as i32));
        let lr = self.learning_rate;
        let moments = &mut self.moments;
        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = param.gradient().cloned() else {
                return Ok(());
            };
            let state = moments
                .entry(param.name().to_string())
                .or_insert_with(|| Moments {
                    m: vec![0.0; grad.len()],
                    v: vec![0.0; grad.len()],
                });
            if state.m.len() != grad.len() {
                return Err(TensorError::DataLength {
                    expected: state.m.len(),
                    got: grad.len(),
                });
            }
            let values = param.value_mut().data_mut();
            for (i, &g) in grad.data().iter().enumerate() {
                state.m[i] = beta1 * state.m[i] + (1.0 - beta1) * g;
                state.v[i] = beta2 * state.v[i] + (1.0 - beta2) * g * g;
                let m_hat = state.m[i] * bc1_inv;
                let v_hat = state.v[i] * bc2_inv;
                values[i] -= lr * m_hat / (v_hat.sqrt() + eps);
            }
            Ok(())
        })
    }
}
