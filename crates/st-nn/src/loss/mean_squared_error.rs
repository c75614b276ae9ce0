// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{PureResult, Tensor};
use st_tensor::pure::mean_squared_error;

/// Mean squared error averaged over every element of the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    pub fn new() -> Self {
        Self
    }

    /// Scalar loss value without wrapping it in a tensor.
    pub fn value(&self, prediction: &Tensor, target: &Tensor) -> PureResult<f32> {
        mean_squared_error(prediction, target)
    }

    /// Gradient of the loss multiplied by `scale`, as needed when the loss
    /// is fed through a gradient scaler.
    pub fn scaled_gradient(
        &self,
        prediction: &Tensor,
        target: &Tensor,
        scale: f32,
    ) -> PureResult<Tensor> {
        let factor = 2.0 * scale / prediction.len() as f32;
        prediction.sub(target)?.scale(factor)
    }
}

impl Loss for MeanSquaredError {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Tensor::from_vec(1, 1, vec![self.value(prediction, target)?])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        self.scaled_gradient(prediction, target, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mse_forward_backward() {
        let mut loss = MeanSquaredError::new();
        let prediction = Tensor::from_vec(1, 3, vec![0.5, -0.5, 1.0]).unwrap();
        let target = Tensor::from_vec(1, 3, vec![0.0, 0.0, 1.5]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        assert!((value.data()[0] - 0.25).abs() < 1e-6);

        let grad = loss.backward(&prediction, &target).unwrap();
        assert!((grad.data()[0] - 1.0 / 3.0).abs() < 1e-6);
        assert!(grad.data()[1] < 0.0);

        let scaled = loss.scaled_gradient(&prediction, &target, 8.0).unwrap();
        assert!((scaled.data()[0] - 8.0 / 3.0).abs() < 1e-5);
        assert!(loss.scaled_gradient(&prediction, &target.transpose(), 1.0).is_err());
    }
}
