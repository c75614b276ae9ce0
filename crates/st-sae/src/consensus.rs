// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pairwise dictionary consensus.
//!
//! For every unordered pair `(a, b)` with `a < b` the term charges
//! `1 - MMCS(dict_a, dict_b)`; the pair mean is multiplied by the ensemble
//! consistency weight and the current warmup factor. [`ConsensusTerm`] keeps
//! what each encoder's backward pass needs (normalised columns, norms and the
//! winning match of every reference column) until the last encoder releases it.

use crate::error::{SaeError, SaeResult};
use st_tensor::pure::measure::{mean_max_cosine_similarity, normalize_columns, NORM_FLOOR};
use st_tensor::{Device, Tensor};

/// Builder for the shared consensus term.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConsensusLoss {
    weight: f32,
}

#[derive(Debug)]
struct PairGraph {
    learned: usize,
    reference: usize,
    transposed: bool,
    learned_hat: Tensor,
    reference_hat: Tensor,
    learned_norms: Vec<f32>,
    reference_norms: Vec<f32>,
    best_match: Vec<usize>,
    best_cosine: Vec<f32>,
}

impl PairGraph {
    /// Gradients of `-mean_j max_i cos(l_i, r_j)` for the learned and
    /// reference dictionaries, in the caller's orientation.
    fn gradients(&self, coefficient: f32) -> SaeResult<(Tensor, Tensor)> {
        let (rows, learned_cols) = self.learned_hat.shape();
        let reference_cols = self.reference_hat.cols();
        let mut grad_learned = Tensor::zeros(rows, learned_cols)?;
        let mut grad_reference = Tensor::zeros(rows, reference_cols)?;
        let coef = -coefficient / reference_cols as f32;

        let l_hat = self.learned_hat.data();
        let r_hat = self.reference_hat.data();
        for (j, (&i, &cosine)) in self.best_match.iter().zip(&self.best_cosine).enumerate() {
            let l_norm = self.learned_norms[i];
            let r_norm = self.reference_norms[j];
            if l_norm < NORM_FLOOR || r_norm < NORM_FLOOR {
                continue;
            }
            let gl = grad_learned.data_mut();
            for r in 0..rows {
                let l = l_hat[r * learned_cols + i];
                let t = r_hat[r * reference_cols + j];
                gl[r * learned_cols + i] += coef * (t - cosine * l) / l_norm;
            }
            let gr = grad_reference.data_mut();
            for r in 0..rows {
                let l = l_hat[r * learned_cols + i];
                let t = r_hat[r * reference_cols + j];
                gr[r * reference_cols + j] += coef * (l - cosine * t) / r_norm;
            }
        }

        if self.transposed {
            Ok((grad_learned.transpose(), grad_reference.transpose()))
        } else {
            Ok((grad_learned, grad_reference))
        }
    }
}

#[derive(Debug)]
struct ConsensusGraph {
    pairs: Vec<PairGraph>,
    /// `weight * warmup / pairs`, the factor in front of every pair's `1 - MMCS`.
    pair_scale: f32,
}

/// Value of the consensus term plus the cached graph for its backward passes.
#[derive(Debug)]
pub struct ConsensusTerm {
    value: f32,
    shapes: Vec<(usize, usize)>,
    device: Device,
    graph: Option<ConsensusGraph>,
}

impl ConsensusLoss {
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Builds the term from the encoders' current dictionaries.
    pub fn compute(
        &self,
        dictionaries: &[Tensor],
        warmup_factor: f32,
        device: Device,
    ) -> SaeResult<ConsensusTerm> {
        let shapes = dictionaries.iter().map(Tensor::shape).collect();
        let mut pairs = Vec::new();
        for a in 0..dictionaries.len() {
            for b in (a + 1)..dictionaries.len() {
                pairs.push(pair_graph(dictionaries, a, b, device)?);
            }
        }
        if pairs.is_empty() {
            return Ok(ConsensusTerm {
                value: 0.0,
                shapes,
                device,
                graph: Some(ConsensusGraph {
                    pairs,
                    pair_scale: 0.0,
                }),
            });
        }

        let pair_scale = self.weight * warmup_factor / pairs.len() as f32;
        let dissimilarity: f32 = pairs
            .iter()
            .map(|pair| {
                let mmcs =
                    pair.best_cosine.iter().sum::<f32>() / pair.best_cosine.len() as f32;
                1.0 - mmcs
            })
            .sum();
        Ok(ConsensusTerm {
            value: dissimilarity * pair_scale,
            shapes,
            device,
            graph: Some(ConsensusGraph { pairs, pair_scale }),
        })
    }
}

fn pair_graph(dictionaries: &[Tensor], a: usize, b: usize, device: Device) -> SaeResult<PairGraph> {
    let alignment = mean_max_cosine_similarity(&dictionaries[a], &dictionaries[b], device)?;
    let (learned, reference) = if alignment.transposed {
        (dictionaries[a].transpose(), dictionaries[b].transpose())
    } else {
        (dictionaries[a].clone(), dictionaries[b].clone())
    };
    let (learned_hat, learned_norms) = normalize_columns(&learned);
    let (reference_hat, reference_norms) = normalize_columns(&reference);

    let targets = alignment.similarity.cols();
    let best_cosine = alignment
        .best_match
        .iter()
        .enumerate()
        .map(|(j, &i)| alignment.similarity.data()[i * targets + j])
        .collect();

    Ok(PairGraph {
        learned: a,
        reference: b,
        transposed: alignment.transposed,
        learned_hat,
        reference_hat,
        learned_norms,
        reference_norms,
        best_match: alignment.best_match,
        best_cosine,
    })
}

impl ConsensusTerm {
    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn encoders(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_released(&self) -> bool {
        self.graph.is_none()
    }

    /// Gradient of `upstream * value` with respect to dictionary `encoder`.
    ///
    /// With `retain_graph = false` the cached graph is dropped after this call
    /// and any further call fails with [`SaeError::GraphReleased`].
    pub fn backward(
        &mut self,
        encoder: usize,
        upstream: f32,
        retain_graph: bool,
    ) -> SaeResult<Tensor> {
        let Some(&(rows, cols)) = self.shapes.get(encoder) else {
            return Err(SaeError::EncoderOutOfRange {
                index: encoder,
                len: self.shapes.len(),
            });
        };
        let released;
        let graph = if retain_graph {
            self.graph
                .as_ref()
                .ok_or(SaeError::GraphReleased { encoder })?
        } else {
            released = self
                .graph
                .take()
                .ok_or(SaeError::GraphReleased { encoder })?;
            &released
        };

        let mut grad = Tensor::zeros(rows, cols)?.to_device(self.device)?;
        let coefficient = graph.pair_scale * upstream;
        if coefficient == 0.0 {
            return Ok(grad);
        }
        for pair in &graph.pairs {
            if pair.learned != encoder && pair.reference != encoder {
                continue;
            }
            let (grad_learned, grad_reference) = pair.gradients(coefficient)?;
            if pair.learned == encoder {
                grad.add_scaled(&grad_learned, 1.0)?;
            } else {
                grad.add_scaled(&grad_reference, 1.0)?;
            }
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary(seed: u64) -> Tensor {
        Tensor::random_normal(6, 5, 0.0, 1.0, Some(seed)).unwrap()
    }

    #[test]
    fn single_encoder_has_no_pairs() {
        let loss = ConsensusLoss::new(1.0);
        let mut term = loss.compute(&[dictionary(1)], 1.0, Device::Cpu).unwrap();
        assert_eq!(term.value(), 0.0);
        let grad = term.backward(0, 1.0, false).unwrap();
        assert_eq!(grad.shape(), (6, 5));
        assert!(grad.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn identical_dictionaries_agree() {
        let d = dictionary(2);
        let term = ConsensusLoss::new(1.0)
            .compute(&[d.clone(), d.clone(), d], 1.0, Device::Cpu)
            .unwrap();
        assert!(term.value().abs() < 1e-5);
    }

    #[test]
    fn value_is_non_negative_and_scaled() {
        let dicts = [dictionary(3), dictionary(4), dictionary(5)];
        let full = ConsensusLoss::new(2.0)
            .compute(&dicts, 1.0, Device::Cpu)
            .unwrap()
            .value();
        let half = ConsensusLoss::new(2.0)
            .compute(&dicts, 0.5, Device::Cpu)
            .unwrap()
            .value();
        assert!(full >= 0.0);
        assert!((half * 2.0 - full).abs() < 1e-5);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let dicts = vec![dictionary(10), dictionary(11), dictionary(12)];
        let loss = ConsensusLoss::new(1.5);
        let mut term = loss.compute(&dicts, 0.8, Device::Cpu).unwrap();
        let analytic = term.backward(1, 1.0, true).unwrap();

        let eps = 1e-3f32;
        for idx in [0usize, 7, 13, 29] {
            let mut plus = dicts.clone();
            plus[1].data_mut()[idx] += eps;
            let mut minus = dicts.clone();
            minus[1].data_mut()[idx] -= eps;
            let f_plus = loss.compute(&plus, 0.8, Device::Cpu).unwrap().value();
            let f_minus = loss.compute(&minus, 0.8, Device::Cpu).unwrap().value();
            let numeric = (f_plus - f_minus) / (2.0 * eps);
            assert!(
                (numeric - analytic.data()[idx]).abs() < 5e-3,
                "idx {idx}: numeric {numeric} analytic {}",
                analytic.data()[idx]
            );
        }
    }

    #[test]
    fn releasing_the_graph_blocks_later_backward() {
        let dicts = [dictionary(20), dictionary(21)];
        let mut term = ConsensusLoss::new(1.0)
            .compute(&dicts, 1.0, Device::Cpu)
            .unwrap();
        term.backward(0, 4.0, true).unwrap();
        assert!(!term.is_released());
        term.backward(1, 4.0, false).unwrap();
        assert!(term.is_released());
        assert!(matches!(
            term.backward(0, 4.0, true),
            Err(SaeError::GraphReleased { encoder: 0 })
        ));
    }

    #[test]
    fn upstream_scale_multiplies_the_gradient() {
        let dicts = [dictionary(30), dictionary(31)];
        let mut term = ConsensusLoss::new(1.0)
            .compute(&dicts, 1.0, Device::Cpu)
            .unwrap();
        let unit = term.backward(0, 1.0, true).unwrap();
        let scaled = term.backward(0, 1024.0, true).unwrap();
        for (u, s) in unit.data().iter().zip(scaled.data()) {
            assert!((u * 1024.0 - s).abs() <= 1e-3 * s.abs().max(1.0));
        }
    }

    #[test]
    fn transposed_pairs_return_gradients_in_stored_shape() {
        let a = Tensor::random_normal(4, 6, 0.0, 1.0, Some(40)).unwrap();
        let b = Tensor::random_normal(3, 6, 0.0, 1.0, Some(41)).unwrap();
        let mut term = ConsensusLoss::new(1.0)
            .compute(&[a, b], 1.0, Device::Cpu)
            .unwrap();
        assert_eq!(term.backward(0, 1.0, true).unwrap().shape(), (4, 6));
        assert_eq!(term.backward(1, 1.0, false).unwrap().shape(), (3, 6));
    }

    #[test]
    fn out_of_range_encoder_is_reported() {
        let mut term = ConsensusLoss::new(1.0)
            .compute(&[dictionary(50)], 1.0, Device::Cpu)
            .unwrap();
        assert!(matches!(
            term.backward(3, 1.0, true),
            Err(SaeError::EncoderOutOfRange { index: 3, len: 1 })
        ));
    }
}
