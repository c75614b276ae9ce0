// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust dense tensor primitives used by the sparse autoencoder stack.
//!
//! Everything here is written in safe Rust without native bindings. Tensors
//! are row-major `f32` matrices tagged with the device they live on so
//! higher layers can keep results where their inputs came from.

pub mod measure;
pub mod precision;

pub use self::measure::{
    geometric_median, mean_max_cosine_similarity, CosineAlignment, GeometricMedian,
};
pub use self::precision::{bf16_to_f32, f32_to_bf16, round_to_bf16};

use core::fmt;
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use spiral_config::determinism;
use std::error::Error;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Learning rate must be positive for optimizers.
    NonPositiveLearningRate { rate: f32 },
    /// Iterative solvers need a strictly positive stopping tolerance.
    NonPositiveTolerance { tolerance: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
    /// Two tensors that must share a device were placed on different ones.
    DeviceMismatch { left: Device, right: Device },
    /// Generic configuration violation for pure-language helpers.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={:?}, right={:?} cannot be combined",
                    left, right
                )
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::NonPositiveTolerance { tolerance } => {
                write!(f, "tolerance must be positive, got {tolerance}")
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::SerializationError { message } => {
                write!(
                    f,
                    "serialization error while handling tensor data: {message}"
                )
            }
            TensorError::DeviceMismatch { left, right } => {
                write!(f, "device mismatch: {left} cannot be combined with {right}")
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
        }
    }
}

impl Error for TensorError {}

/// Compute device a tensor is resident on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory, executed by the scalar kernels in this module.
    #[default]
    Cpu,
}

impl Device {
    pub fn label(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str((*self).label())
    }
}

/// A simple row-major 2D tensor.
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
    device: Device,
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.rows == other.rows && self.cols == other.cols && self.data == other.data
    }
}

impl Tensor {
    fn checked(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data,
            rows,
            cols,
            device: Device::Cpu,
        })
    }

    fn ensure_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::checked(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::checked(rows, cols, data)
    }

    /// Narrow a double precision buffer into a tensor.
    pub fn from_f64(rows: usize, cols: usize, data: &[f64]) -> PureResult<Self> {
        Self::checked(rows, cols, data.iter().map(|&v| v as f32).collect())
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise the process-wide determinism settings decide.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = Self::seedable_rng(seed, "st-tensor/tensor/normal");
        Self::random_normal_with(rows, cols, mean, std, &mut rng)
    }

    /// Same as [`Tensor::random_normal`] but draws from a caller-owned RNG.
    pub fn random_normal_with<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        rng: &mut R,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            let sample: f64 = StandardNormal.sample(rng);
            data.push(mean + std * sample as f32);
        }
        Self::checked(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::checked(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Shapes are validated at construction, so a tensor is never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns a copy resident on `device`.
    pub fn to_device(&self, device: Device) -> PureResult<Tensor> {
        let mut moved = self.clone();
        moved.device = device;
        Ok(moved)
    }

    /// Returns a read-only view of the underlying buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns a mutable view of the underlying buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Matrix multiply (`self · other`).
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        if self.device != other.device {
            return Err(TensorError::DeviceMismatch {
                left: self.device,
                right: other.device,
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let lhs = &self.data[r * inner..(r + 1) * inner];
            let dst = &mut out[r * cols..(r + 1) * cols];
            for (k, &a) in lhs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[k * cols..(k + 1) * cols];
                for (d, &b) in dst.iter_mut().zip(rhs.iter()) {
                    *d += a * b;
                }
            }
        }
        let mut result = Tensor::checked(rows, cols, out)?;
        result.device = self.device;
        Ok(result)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        self.with_data(data)
    }

    /// Returns a new tensor where every element is scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|a| a * value).collect();
        self.with_data(data)
    }

    /// Add a scaled tensor to this tensor (`self += scale * other`).
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        self.ensure_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        for row in self.data.chunks_mut(self.cols) {
            for (value, b) in row.iter_mut().zip(bias.iter()) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Apply the ReLU activation in-place (`self[i] = max(self[i], 0)`).
    pub fn relu_inplace(&mut self) {
        for value in self.data.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data,
            rows: self.cols,
            cols: self.rows,
            device: self.device,
        }
    }

    /// Returns the sum over rows for each column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row.iter()) {
                *sum += value;
            }
        }
        sums
    }

    /// Euclidean norm of every column.
    pub fn column_norms(&self) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.cols];
        for row in self.data.chunks(self.cols) {
            for (sum, value) in sums.iter_mut().zip(row.iter()) {
                *sum += value * value;
            }
        }
        sums.into_iter().map(f32::sqrt).collect()
    }

    fn with_data(&self, data: Vec<f32>) -> PureResult<Tensor> {
        let mut result = Tensor::checked(self.rows, self.cols, data)?;
        result.device = self.device;
        Ok(result)
    }
}

/// Computes the mean squared error between `predictions` and `targets`.
pub fn mean_squared_error(predictions: &Tensor, targets: &Tensor) -> PureResult<f32> {
    predictions.ensure_same_shape(targets)?;
    let mut sum = 0.0f32;
    for (p, t) in predictions.data().iter().zip(targets.data().iter()) {
        let diff = p - t;
        sum += diff * diff;
    }
    Ok(sum / predictions.len() as f32)
}
