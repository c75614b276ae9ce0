// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;
use std::fmt;

/// A named tensor plus the gradient gathered for it since the last reset.
///
/// The accumulator starts out absent; the first backward contribution
/// allocates it and later ones add into it.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("shape", &self.value.shape())
            .field("has_grad", &self.gradient.is_some())
            .finish()
    }
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Canonical key used by state dicts and optimiser buffers.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn check_shape(&self, other: &Tensor) -> PureResult<()> {
        let (expected, got) = (self.value.shape(), other.shape());
        if expected == got {
            Ok(())
        } else {
            Err(TensorError::ShapeMismatch {
                left: expected,
                right: got,
            })
        }
    }

    /// Adds `update` to the gradient.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.check_shape(update)?;
        if let Some(gradient) = self.gradient.as_mut() {
            return gradient.add_scaled(update, 1.0);
        }
        self.gradient = Some(update.clone());
        Ok(())
    }

    /// Zeroes the gradient in place; an absent gradient stays absent.
    pub fn zero_gradient(&mut self) {
        if let Some(gradient) = self.gradient.as_mut() {
            gradient.data_mut().fill(0.0);
        }
    }

    /// Multiplies the gradient by `factor`. Non-finite factors are ignored.
    pub fn scale_accumulators(&mut self, factor: f32) {
        if !factor.is_finite() {
            return;
        }
        if let Some(gradient) = self.gradient.as_mut() {
            gradient.data_mut().iter_mut().for_each(|value| *value *= factor);
        }
    }

    /// Squared L2 norm of the gradient in `f64`; zero when there is none.
    /// Any `NaN` or infinity in the buffer makes the result non-finite.
    pub fn accumulators_norm_sq(&self) -> f64 {
        let Some(gradient) = &self.gradient else {
            return 0.0;
        };
        gradient
            .data()
            .iter()
            .map(|&value| f64::from(value) * f64::from(value))
            .sum()
    }

    /// Overwrites the value with a copy of `value` on this parameter's device.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.check_shape(value)?;
        self.value = value.to_device(self.value.device())?;
        Ok(())
    }

    /// Replaces the value and forgets the gradient, as after a fresh
    /// initialisation.
    pub fn reset(&mut self, value: Tensor) -> PureResult<()> {
        self.load_value(&value)?;
        self.gradient = None;
        Ok(())
    }
}

/// A differentiable block with named parameters.
///
/// `backward` receives the gradient of the loss with respect to the block's
/// output, adds the parameter gradients into the accumulators, and returns the
/// gradient with respect to its input.
pub trait Module {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Copies of all parameter values keyed by [`Parameter::name`].
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_owned(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Inverse of [`Module::state_dict`]. Every parameter must be present;
    /// extra entries are ignored.
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| match state.get(param.name()) {
            Some(value) => param.load_value(value),
            None => Err(TensorError::MissingParameter {
                name: param.name().to_owned(),
            }),
        })
    }
}
