// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! High-level neural module API built on top of the pure tensor core.
//!
//! This crate offers a lightweight `nn.Module` style surface: parameters with
//! Euclidean gradient accumulators, a linear layer with orthogonal
//! initialisation, the mean squared error loss, Adam, and the autocast and
//! loss-scaling helpers used by mixed-precision training.

pub mod io;
pub mod layers;
pub mod loss;
pub mod mixed_precision;
pub mod module;
pub mod optim;

pub use layers::linear::Linear;
pub use loss::{Loss, MeanSquaredError};
pub use mixed_precision::{autocast_enabled, AutocastGuard, GradScaler, ScalerSchedule};
pub use module::{Module, Parameter};
pub use optim::Adam;

pub use st_tensor::pure::{Device, PureResult, Tensor, TensorError};
