// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The model contract the trainer drives, plus a tied-weight ReLU ensemble
//! implementing it.

use crate::error::{SaeError, SaeResult};
use crate::sink::{Artifact, MetricsSink};
use spiral_config::determinism;
use st_nn::{autocast_enabled, Linear, Module};
use st_tensor::{Tensor, TensorError};
use std::collections::HashMap;
use tracing::debug;

/// Outputs of one ensemble forward pass, index-aligned with the encoders.
#[derive(Clone, Debug)]
pub struct EnsembleForward {
    /// Reconstructions, each shaped like the input batch.
    pub outputs: Vec<Tensor>,
    /// Post-ReLU codes, `(batch × code_dim)` per encoder.
    pub activations: Vec<Tensor>,
}

impl EnsembleForward {
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// An ordered set of sparse autoencoders sharing one input.
///
/// Each encoder's weight, shaped `(input_dim × code_dim)`, is its feature
/// dictionary. Implementors provide the forward pass; the default backward
/// assumes the tied ReLU form `recon = relu(x·W + b) · Wᵀ`.
pub trait SaeEnsemble {
    fn encoders(&self) -> &[Linear];

    fn encoders_mut(&mut self) -> &mut [Linear];

    fn input_dim(&self) -> usize;

    fn forward_with_encoded(&self, batch: &Tensor) -> SaeResult<EnsembleForward>;

    fn len(&self) -> usize {
        self.encoders().len()
    }

    fn is_empty(&self) -> bool {
        self.encoders().is_empty()
    }

    fn encoder_mut(&mut self, index: usize) -> SaeResult<&mut Linear> {
        let len = self.len();
        self.encoders_mut()
            .get_mut(index)
            .ok_or(SaeError::EncoderOutOfRange { index, len })
    }

    /// Snapshot of every dictionary, detached from the encoders.
    fn dictionaries(&self) -> Vec<Tensor> {
        self.encoders()
            .iter()
            .map(|encoder| encoder.weight().value().clone())
            .collect()
    }

    /// Accumulates the gradients of encoder `index` given the gradient of the
    /// loss with respect to its reconstruction.
    fn backward_encoder(
        &mut self,
        index: usize,
        batch: &Tensor,
        forward: &EnsembleForward,
        grad_output: &Tensor,
    ) -> SaeResult<()> {
        let len = forward.activations.len();
        let codes = forward
            .activations
            .get(index)
            .ok_or(SaeError::EncoderOutOfRange { index, len })?;
        let encoder = self.encoder_mut(index)?;
        let mut grad_codes = encoder.backward_transposed(codes, grad_output)?;
        for (grad, code) in grad_codes.data_mut().iter_mut().zip(codes.data()) {
            if *code <= 0.0 {
                *grad = 0.0;
            }
        }
        encoder.backward(batch, &grad_codes)?;
        Ok(())
    }

    /// Every encoder's parameters under their canonical names.
    fn state_dict(&self) -> SaeResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for encoder in self.encoders() {
            state.extend(encoder.state_dict()?);
        }
        Ok(state)
    }

    /// Uploads a bincode snapshot of [`SaeEnsemble::state_dict`] as a
    /// `model` artifact.
    fn save_model(&self, tag: &str, alias: &str, sink: &mut dyn MetricsSink) -> SaeResult<()> {
        let payload = st_nn::io::state_dict_to_bytes(&self.state_dict()?)?;
        debug!(tag, alias, bytes = payload.len(), "saving model snapshot");
        sink.log_artifact(Artifact::new(tag, "model", payload).with_alias(alias))
    }
}

/// Tied-weight ReLU autoencoders with orthogonally initialised encoders.
#[derive(Debug)]
pub struct SparseAutoencoderEnsemble {
    encoders: Vec<Linear>,
    input_dim: usize,
}

impl SparseAutoencoderEnsemble {
    /// Builds `members` encoders of shape `(input_dim × code_dim)`. Each member
    /// draws from its own stream derived from `seed`.
    pub fn new(
        members: usize,
        input_dim: usize,
        code_dim: usize,
        seed: Option<u64>,
    ) -> SaeResult<Self> {
        let encoders = (0..members)
            .map(|member| {
                let mut rng = determinism::rng_for_member(seed, "st-sae/encoder", member);
                Linear::orthogonal(format!("sae_{member}.encoder"), input_dim, code_dim, &mut rng)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_encoders(encoders)
    }

    /// Wraps existing layers; all must share the same input width.
    pub fn from_encoders(encoders: Vec<Linear>) -> SaeResult<Self> {
        let Some(first) = encoders.first() else {
            return Err(SaeError::Config(
                "an ensemble needs at least one encoder".to_string(),
            ));
        };
        let input_dim = first.input_dim();
        let code_dim = first.output_dim();
        for encoder in &encoders {
            if encoder.input_dim() != input_dim || encoder.output_dim() != code_dim {
                return Err(TensorError::ShapeMismatch {
                    left: (input_dim, code_dim),
                    right: (encoder.input_dim(), encoder.output_dim()),
                }
                .into());
            }
        }
        Ok(Self {
            encoders,
            input_dim,
        })
    }

    pub fn code_dim(&self) -> usize {
        self.encoders.first().map_or(0, Linear::output_dim)
    }

    fn encode(layer: &Linear, input: &Tensor) -> SaeResult<(Tensor, Tensor)> {
        let mut codes = layer.forward(input)?;
        codes.relu_inplace();
        let reconstruction = layer.forward_transposed(&codes)?;
        Ok((reconstruction, codes))
    }
}

impl SaeEnsemble for SparseAutoencoderEnsemble {
    fn encoders(&self) -> &[Linear] {
        &self.encoders
    }

    fn encoders_mut(&mut self) -> &mut [Linear] {
        &mut self.encoders
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    // Under autocast the matmuls see bf16-rounded operands; parameters stay f32.
    fn forward_with_encoded(&self, batch: &Tensor) -> SaeResult<EnsembleForward> {
        if batch.cols() != self.input_dim {
            return Err(TensorError::ShapeMismatch {
                left: batch.shape(),
                right: (batch.rows(), self.input_dim),
            }
            .into());
        }
        let reduced = autocast_enabled();
        let rounded_input;
        let input = if reduced {
            rounded_input = batch.to_bf16_precision();
            &rounded_input
        } else {
            batch
        };
        let mut outputs = Vec::with_capacity(self.encoders.len());
        let mut activations = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let (reconstruction, codes) = if reduced {
                Self::encode(&encoder.to_bf16_precision()?, input)?
            } else {
                Self::encode(encoder, input)?
            };
            outputs.push(reconstruction);
            activations.push(codes);
        }
        Ok(EnsembleForward {
            outputs,
            activations,
        })
    }
}
