// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Consensus-regularised sparse autoencoder ensembles.
//!
//! Several SAEs see the same batch. Each one is pulled towards a good
//! reconstruction by its own mean squared error and towards its siblings by a
//! shared consensus term built from the mean-max cosine similarity of their
//! dictionaries. Encoders whose activation statistics drift too far from the
//! target rate are reinitialised in place, together with their optimiser and
//! loss scaler.

pub mod config;
pub mod consensus;
pub mod ensemble;
pub mod error;
pub mod monitor;
pub mod sink;
pub mod telemetry;
pub mod trainer;
pub mod warmup;

pub use config::TrainerConfig;
pub use consensus::{ConsensusLoss, ConsensusTerm};
pub use ensemble::{EnsembleForward, SaeEnsemble, SparseAutoencoderEnsemble};
pub use error::{SaeError, SaeResult};
pub use monitor::{ActivityReport, FeatureMonitor};
pub use sink::{Artifact, DirectorySink, MemorySink, MetricsSink, StepMetrics, TracingSink};
pub use trainer::{ConsensusTrainer, EncoderId, EpochSummary, StepReport, TrainingSummary};
pub use warmup::WarmupSchedule;

pub use st_tensor::{Device, Tensor};
