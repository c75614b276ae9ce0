// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Step-synchronous training of an SAE ensemble.
//!
//! One step runs `forward → monitor → [reinit → forward] → per-encoder
//! backward/step → log`. The consensus term is built from the dictionaries
//! as they were at the start of the step and is not rebuilt after a
//! reinitialisation. Every encoder owns an [`Adam`] optimiser and a
//! [`GradScaler`]; both are replaced together when the encoder is reset.

use crate::config::TrainerConfig;
use crate::consensus::{ConsensusLoss, ConsensusTerm};
use crate::ensemble::{EnsembleForward, SaeEnsemble};
use crate::error::{SaeError, SaeResult};
use crate::monitor::{ActivityReport, FeatureMonitor};
use crate::sink::{Artifact, MetricsSink, StepMetrics};
use crate::warmup::WarmupSchedule;
use rand::rngs::StdRng;
use spiral_config::determinism;
use st_nn::{Adam, AutocastGuard, GradScaler, MeanSquaredError};
use st_tensor::pure::mean_max_cosine_similarity;
use st_tensor::{Device, Tensor, TensorError};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Stable handle of one encoder inside the ensemble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncoderId(usize);

impl EncoderId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EncoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sae_{}", self.0)
    }
}

#[derive(Clone, Debug)]
struct EncoderState {
    optimizer: Adam,
    scaler: GradScaler,
}

impl EncoderState {
    fn fresh(config: &TrainerConfig) -> SaeResult<Self> {
        let scaler = if config.use_amp {
            GradScaler::amp_default()
        } else {
            GradScaler::disabled()
        };
        Ok(Self {
            optimizer: Adam::new(config.learning_rate)?,
            scaler,
        })
    }
}

/// What happened during one call to [`ConsensusTrainer::train_step`].
#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub step: u64,
    pub warmup_factor: f32,
    pub consensus_loss: f32,
    /// Losses of the forward pass the gradients were taken from.
    pub reconstruction_losses: Vec<f32>,
    /// Monitor output of the first forward pass.
    pub sensitivities: Vec<f32>,
    pub reinitialized: Vec<EncoderId>,
    /// Alignment with the reference features, when the trainer has them.
    pub mmcs: Option<Vec<f32>>,
    /// `false` where a scaler skipped the optimiser step on overflow.
    pub stepped: Vec<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub steps: usize,
    pub mean_consensus_loss: f32,
    pub mean_reconstruction_losses: Vec<f32>,
    pub reinitializations: usize,
    /// Name of the model artifact written at the end of the epoch.
    pub checkpoint: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochSummary>,
    pub total_steps: u64,
}

impl TrainingSummary {
    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }
}

/// Trains every encoder of `M` against the same batches while pulling their
/// dictionaries together.
pub struct ConsensusTrainer<M, S> {
    model: M,
    sink: S,
    config: TrainerConfig,
    device: Device,
    states: BTreeMap<EncoderId, EncoderState>,
    warmup: WarmupSchedule,
    consensus: ConsensusLoss,
    monitor: FeatureMonitor,
    criterion: MeanSquaredError,
    reference: Option<Tensor>,
    reference_saved: bool,
    rng: StdRng,
    epochs_completed: usize,
}

impl<M: SaeEnsemble, S: MetricsSink> ConsensusTrainer<M, S> {
    pub fn new(
        model: M,
        device: Device,
        config: TrainerConfig,
        reference: Option<Tensor>,
        sink: S,
    ) -> SaeResult<Self> {
        config.validate()?;
        if model.is_empty() {
            return Err(SaeError::Config(
                "the ensemble has no encoders".to_string(),
            ));
        }
        for encoder in model.encoders() {
            if encoder.device() != device {
                return Err(TensorError::DeviceMismatch {
                    left: encoder.device(),
                    right: device,
                }
                .into());
            }
        }
        let reference = reference
            .map(|features| features.to_device(device))
            .transpose()?;
        let states = (0..model.len())
            .map(|index| Ok((EncoderId(index), EncoderState::fresh(&config)?)))
            .collect::<SaeResult<BTreeMap<_, _>>>()?;
        let monitor = FeatureMonitor::new(config.target_activation_rate, config.reinit_threshold)?;
        let rng = determinism::rng_from_optional(config.seed, "st-sae/reinit");

        Ok(Self {
            warmup: WarmupSchedule::new(config.warmup_steps),
            consensus: ConsensusLoss::new(config.ensemble_consistency_weight),
            monitor,
            criterion: MeanSquaredError::new(),
            model,
            sink,
            config,
            device,
            states,
            reference,
            reference_saved: false,
            rng,
            epochs_completed: 0,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Global step counter; never reset across epochs.
    pub fn current_step(&self) -> u64 {
        self.warmup.step()
    }

    pub fn warmup_factor(&self) -> f32 {
        self.warmup.factor()
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs_completed
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn reference(&self) -> Option<&Tensor> {
        self.reference.as_ref()
    }

    pub fn optimizer(&self, id: EncoderId) -> Option<&Adam> {
        self.states.get(&id).map(|state| &state.optimizer)
    }

    pub fn scaler(&self, id: EncoderId) -> Option<&GradScaler> {
        self.states.get(&id).map(|state| &state.scaler)
    }

    pub fn into_parts(self) -> (M, S) {
        (self.model, self.sink)
    }

    /// Fresh orthogonal weight, zero bias, new optimiser and scaler for one
    /// encoder. Siblings are untouched.
    pub fn reinitialize_encoder(&mut self, index: usize) -> SaeResult<()> {
        let encoder = self.model.encoder_mut(index)?;
        encoder.reinitialize_orthogonal(&mut self.rng)?;
        let state = EncoderState::fresh(&self.config)?;
        self.states.insert(EncoderId(index), state);
        warn!(
            encoder = index,
            step = self.warmup.step(),
            "reinitialising encoder after activation drift"
        );
        Ok(())
    }

    pub fn check_reinit_condition(&self, activations: &[Tensor]) -> ActivityReport {
        self.monitor.inspect(activations)
    }

    /// Consensus term over the current dictionaries at `warmup_factor`.
    pub fn consensus_loss(&self, warmup_factor: f32) -> SaeResult<ConsensusTerm> {
        self.consensus
            .compute(&self.model.dictionaries(), warmup_factor, self.device)
    }

    /// Ensemble forward (under autocast when enabled) plus per-encoder MSE.
    fn forward_pass(&self, batch: &Tensor) -> SaeResult<(EnsembleForward, Vec<f32>)> {
        let forward = {
            let _autocast = AutocastGuard::new(self.config.use_amp);
            self.model.forward_with_encoded(batch)?
        };
        if forward.outputs.len() != self.model.len()
            || forward.activations.len() != self.model.len()
        {
            return Err(TensorError::DataLength {
                expected: self.model.len(),
                got: forward.outputs.len().min(forward.activations.len()),
            }
            .into());
        }
        let losses = forward
            .outputs
            .iter()
            .map(|output| self.criterion.value(output, batch))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((forward, losses))
    }

    pub fn train_step(&mut self, batch: &Tensor) -> SaeResult<StepReport> {
        let step = self.warmup.advance();
        let batch = batch.to_device(self.device)?;
        if batch.cols() != self.model.input_dim() {
            return Err(TensorError::ShapeMismatch {
                left: batch.shape(),
                right: (batch.rows(), self.model.input_dim()),
            }
            .into());
        }
        let warmup_factor = self.warmup.factor();

        let (mut forward, mut losses) = self.forward_pass(&batch)?;
        let mut consensus = self.consensus_loss(warmup_factor)?;
        let consensus_value = consensus.value();

        let activity = self.check_reinit_condition(&forward.activations);
        let mut reinitialized = Vec::new();
        for index in activity.flagged() {
            self.reinitialize_encoder(index)?;
            reinitialized.push(EncoderId(index));
        }
        if !reinitialized.is_empty() {
            (forward, losses) = self.forward_pass(&batch)?;
        }

        let count = self.model.len();
        let mut stepped = Vec::with_capacity(count);
        for index in 0..count {
            let id = EncoderId(index);
            let state = self
                .states
                .get_mut(&id)
                .ok_or(SaeError::EncoderOutOfRange { index, len: count })?;
            let scale = state.scaler.scale();
            state.optimizer.zero_grad(self.model.encoder_mut(index)?)?;

            let grad_output =
                self.criterion
                    .scaled_gradient(&forward.outputs[index], &batch, scale)?;
            self.model
                .backward_encoder(index, &batch, &forward, &grad_output)?;
            let consensus_grad = consensus.backward(index, scale, index + 1 < count)?;

            let encoder = self.model.encoder_mut(index)?;
            encoder.weight_mut().accumulate_euclidean(&consensus_grad)?;
            let applied = state.scaler.step(&mut state.optimizer, encoder)?;
            if !applied {
                warn!(
                    encoder = index,
                    step,
                    scale = state.scaler.scale(),
                    "skipped optimiser step on non-finite gradients"
                );
            }
            stepped.push(applied);
        }

        let mmcs = match &self.reference {
            Some(reference) => Some(
                self.model
                    .encoders()
                    .iter()
                    .map(|encoder| {
                        mean_max_cosine_similarity(encoder.weight().value(), reference, self.device)
                            .map(|alignment| alignment.score)
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let (_, sensitivities) = activity.into_parts();
        let report = StepReport {
            step,
            warmup_factor,
            consensus_loss: consensus_value,
            reconstruction_losses: losses,
            sensitivities,
            reinitialized,
            mmcs,
            stepped,
        };
        let metrics = self.step_metrics(&report);
        self.sink.log_metrics(step, &metrics)?;
        debug!(
            step,
            consensus_loss = consensus_value,
            warmup_factor,
            reinitialized = report.reinitialized.len(),
            "train step"
        );
        Ok(report)
    }

    fn step_metrics(&self, report: &StepReport) -> StepMetrics {
        let mut metrics = StepMetrics::new();
        metrics.insert("consensus_loss", report.consensus_loss);
        metrics.insert("warmup_factor", report.warmup_factor);
        for (index, loss) in report.reconstruction_losses.iter().enumerate() {
            let id = EncoderId(index);
            metrics.insert(format!("{id}_reconstruction_loss"), *loss);
            if let Some(sensitivity) = report.sensitivities.get(index) {
                metrics.insert(format!("{id}_feature_activity"), *sensitivity);
            }
            if let Some(scaler) = self.scaler(id) {
                metrics.insert(format!("{id}_grad_scale"), scaler.scale());
            }
            let reset = report.reinitialized.contains(&id);
            metrics.insert(format!("{id}_reinitialized"), if reset { 1.0 } else { 0.0 });
        }
        if let Some(mmcs) = &report.mmcs {
            for (index, score) in mmcs.iter().enumerate() {
                metrics.insert(format!("{}_mmcs", EncoderId(index)), *score);
            }
        }
        metrics
    }

    /// Uploads the reference dictionary as `<run>_true_features`. Only the
    /// first call writes; returns whether anything was uploaded.
    pub fn save_reference_features(&mut self) -> SaeResult<bool> {
        if self.reference_saved {
            return Ok(false);
        }
        let Some(reference) = &self.reference else {
            return Ok(false);
        };
        let payload = st_nn::io::tensor_to_bytes(reference)?;
        let name = format!("{}_true_features", self.sink.run_name());
        self.sink
            .log_artifact(Artifact::new(name, "true_features", payload))?;
        self.reference_saved = true;
        Ok(true)
    }

    /// One pass over `loader` followed by the epoch checkpoint.
    pub fn train_epoch<I>(&mut self, loader: I) -> SaeResult<EpochSummary>
    where
        I: IntoIterator,
        I::Item: Borrow<Tensor>,
    {
        let epoch = self.epochs_completed + 1;
        let mut steps = 0usize;
        let mut consensus_total = 0.0f32;
        let mut reconstruction_totals = vec![0.0f32; self.model.len()];
        let mut reinitializations = 0usize;
        for batch in loader {
            let report = self.train_step(batch.borrow())?;
            steps += 1;
            consensus_total += report.consensus_loss;
            for (total, loss) in reconstruction_totals
                .iter_mut()
                .zip(&report.reconstruction_losses)
            {
                *total += loss;
            }
            reinitializations += report.reinitialized.len();
        }

        let checkpoint = format!("{}_epoch_{epoch}", self.sink.run_name());
        self.model
            .save_model(&checkpoint, &format!("epoch_{epoch}"), &mut self.sink)?;
        self.save_reference_features()?;
        self.epochs_completed = epoch;

        let denominator = steps.max(1) as f32;
        let summary = EpochSummary {
            epoch,
            steps,
            mean_consensus_loss: consensus_total / denominator,
            mean_reconstruction_losses: reconstruction_totals
                .into_iter()
                .map(|total| total / denominator)
                .collect(),
            reinitializations,
            checkpoint,
        };
        info!(
            epoch,
            steps,
            consensus_loss = summary.mean_consensus_loss,
            reinitializations,
            checkpoint = %summary.checkpoint,
            "epoch finished"
        );
        Ok(summary)
    }

    /// Runs `epochs` passes over a re-iterable loader.
    pub fn train<I>(&mut self, loader: I, epochs: usize) -> SaeResult<TrainingSummary>
    where
        I: IntoIterator + Clone,
        I::Item: Borrow<Tensor>,
    {
        let mut summary = TrainingSummary::default();
        for _ in 0..epochs {
            summary.epochs.push(self.train_epoch(loader.clone())?);
        }
        summary.total_steps = self.current_step();
        Ok(summary)
    }
}
