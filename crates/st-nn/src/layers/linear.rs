// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use nalgebra::DMatrix;
use rand::Rng;
use st_tensor::Device;

/// Fully-connected layer computing `x · W + b` with `W` stored as
/// `(input_dim × output_dim)`.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

/// Draws a `(rows × cols)` matrix with orthonormal rows or columns (whichever
/// axis is shorter), using the sign-corrected QR of a Gaussian sample.
pub fn orthogonal_tensor<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    rng: &mut R,
) -> PureResult<Tensor> {
    let transposed = rows < cols;
    let (tall, short) = if transposed { (cols, rows) } else { (rows, cols) };
    let gaussian = Tensor::random_normal_with(tall, short, 0.0, 1.0, rng)?;
    let qr = DMatrix::from_row_slice(tall, short, gaussian.data()).qr();
    let mut q = qr.q();
    let r = qr.r();
    for j in 0..short {
        if r[(j, j)] < 0.0 {
            q.column_mut(j).neg_mut();
        }
    }
    let q = Tensor::from_fn(tall, short, |i, j| q[(i, j)])?;
    Ok(if transposed { q.transpose() } else { q })
}

impl Linear {
    fn check_dims(input_dim: usize, output_dim: usize) -> PureResult<()> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        Ok(())
    }

    /// Creates a layer with an orthogonal weight and zero bias.
    pub fn orthogonal<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        Self::check_dims(input_dim, output_dim)?;
        let weights = orthogonal_tensor(input_dim, output_dim, rng)?;
        Self::from_parts(name, weights, Tensor::zeros(1, output_dim)?)
    }

    /// Wraps explicit weight and bias tensors.
    pub fn from_parts(name: impl Into<String>, weight: Tensor, bias: Tensor) -> PureResult<Self> {
        let (_, output_dim) = weight.shape();
        if bias.shape() != (1, output_dim) {
            return Err(TensorError::ShapeMismatch {
                left: weight.shape(),
                right: bias.shape(),
            });
        }
        let name = name.into();
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn weight_mut(&mut self) -> &mut Parameter {
        &mut self.weight
    }

    pub fn bias_mut(&mut self) -> &mut Parameter {
        &mut self.bias
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value().shape().0
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value().shape().1
    }

    pub fn device(&self) -> Device {
        self.weight.value().device()
    }

    /// Replaces the weight with a fresh orthogonal draw and zeroes the bias.
    /// Gradients are dropped; the device is kept.
    pub fn reinitialize_orthogonal<R: Rng + ?Sized>(&mut self, rng: &mut R) -> PureResult<()> {
        let weight = orthogonal_tensor(self.input_dim(), self.output_dim(), rng)?;
        self.weight.reset(weight)?;
        self.bias.reset(Tensor::zeros(1, self.output_dim())?)?;
        Ok(())
    }

    /// Copy of the layer with weight and bias rounded through bf16. Names are
    /// preserved; gradients are not carried over.
    pub fn to_bf16_precision(&self) -> PureResult<Linear> {
        let name = self
            .weight
            .name()
            .strip_suffix("::weight")
            .unwrap_or(self.weight.name())
            .to_string();
        Self::from_parts(
            name,
            self.weight.value().to_bf16_precision(),
            self.bias.value().to_bf16_precision(),
        )
    }

    /// Runs the layer backwards through its weight: `codes · Wᵀ`, no bias.
    /// This is the decoder half of a tied-weight autoencoder.
    pub fn forward_transposed(&self, codes: &Tensor) -> PureResult<Tensor> {
        codes.matmul(&self.weight.value().transpose())
    }

    /// Backward of [`Linear::forward_transposed`]: accumulates `gradᵀ · codes`
    /// into the weight and returns the gradient with respect to `codes`.
    pub fn backward_transposed(
        &mut self,
        codes: &Tensor,
        grad_output: &Tensor,
    ) -> PureResult<Tensor> {
        if codes.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: codes.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = grad_output.transpose().matmul(codes)?;
        self.weight.accumulate_euclidean(&grad_w)?;
        grad_output.matmul(self.weight.value())
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    // Gradients are exact sums over the batch; the loss owns any averaging.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = input.transpose().matmul(grad_output)?;
        self.weight.accumulate_euclidean(&grad_w)?;

        let summed = grad_output.sum_axis0();
        let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
        self.bias.accumulate_euclidean(&grad_b)?;

        let weight_t = self.weight.value().transpose();
        grad_output.matmul(&weight_t)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gram_is_identity(t: &Tensor, tol: f32) -> bool {
        let gram = t.transpose().matmul(t).unwrap();
        let n = gram.shape().0;
        (0..n).all(|i| {
            (0..n).all(|j| {
                let expected = if i == j { 1.0 } else { 0.0 };
                (gram.data()[i * n + j] - expected).abs() < tol
            })
        })
    }

    #[test]
    fn linear_forward_matches_manual() {
        let weight = Tensor::from_vec(3, 2, vec![0.5, -1.0, 0.25, 2.0, 1.0, 0.0]).unwrap();
        let bias = Tensor::from_vec(1, 2, vec![0.1, -0.1]).unwrap();
        let layer = Linear::from_parts("fc", weight, bias).unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let expected = [0.6, -5.1];
        for (got, want) in output.data().iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
        assert!(Linear::from_parts("bad", Tensor::zeros(3, 2).unwrap(), Tensor::zeros(1, 3).unwrap())
            .is_err());
    }

    #[test]
    fn orthogonal_init_has_orthonormal_short_axis() {
        let mut rng = StdRng::seed_from_u64(3);
        let tall = orthogonal_tensor(8, 4, &mut rng).unwrap();
        assert!(gram_is_identity(&tall, 1e-4));
        let wide = orthogonal_tensor(4, 8, &mut rng).unwrap();
        assert_eq!(wide.shape(), (4, 8));
        assert!(gram_is_identity(&wide.transpose(), 1e-4));
    }

    #[test]
    fn reinitialisation_replaces_weight_and_clears_grads() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = Linear::orthogonal("enc", 4, 6, &mut rng).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 0.5, -0.5, 2.0]).unwrap();
        let grad = Tensor::from_vec(1, 6, vec![1.0; 6]).unwrap();
        layer.backward(&input, &grad).unwrap();
        layer.bias_mut().value_mut().data_mut()[0] = 3.0;
        let before = layer.weight().value().clone();

        layer.reinitialize_orthogonal(&mut rng).unwrap();
        assert_ne!(&before, layer.weight().value());
        assert!(layer.weight().gradient().is_none());
        assert!(layer.bias().value().data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn backward_sums_over_the_batch() {
        let mut layer =
            Linear::from_parts("fc", Tensor::zeros(2, 1).unwrap(), Tensor::zeros(1, 1).unwrap())
                .unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let grad = Tensor::from_vec(2, 1, vec![1.0, 1.0]).unwrap();
        let grad_input = layer.backward(&input, &grad).unwrap();
        assert_eq!(layer.weight().gradient().unwrap().data(), &[4.0, 6.0]);
        assert_eq!(layer.bias().gradient().unwrap().data(), &[2.0]);
        assert_eq!(grad_input.shape(), (2, 2));
    }

    #[test]
    fn transposed_path_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut layer = Linear::orthogonal("tied", 3, 2, &mut rng).unwrap();
        let codes = Tensor::from_vec(1, 2, vec![0.7, -0.2]).unwrap();
        // loss = sum(codes · Wᵀ), so dL/dy is all ones
        let ones = Tensor::from_vec(1, 3, vec![1.0; 3]).unwrap();
        layer.backward_transposed(&codes, &ones).unwrap();
        let analytic = layer.weight().gradient().unwrap().clone();

        let eps = 1e-3f32;
        for idx in 0..6 {
            let base: f32 = layer.forward_transposed(&codes).unwrap().data().iter().sum();
            layer.weight_mut().value_mut().data_mut()[idx] += eps;
            let bumped: f32 = layer.forward_transposed(&codes).unwrap().data().iter().sum();
            layer.weight_mut().value_mut().data_mut()[idx] -= eps;
            let numeric = (bumped - base) / eps;
            assert!((numeric - analytic.data()[idx]).abs() < 1e-2);
        }
    }
}
