// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Measures over feature dictionaries.
//!
//! A dictionary is a `(feature_dim × atoms)` tensor whose columns are the
//! learned directions. [`mean_max_cosine_similarity`] scores how well one
//! dictionary covers another, and [`geometric_median`] gives an outlier-robust
//! centre for a set of same-shaped tensors (the Weiszfeld iteration).

use super::{Device, PureResult, Tensor, TensorError};

/// Columns with a norm below this floor normalise to the zero vector.
pub const NORM_FLOOR: f32 = 1.0e-12;
/// Distances below this floor are clamped so Weiszfeld weights stay finite.
pub const DISTANCE_FLOOR: f32 = 1.0e-8;

/// Outcome of comparing a learned dictionary against a reference one.
#[derive(Clone, Debug)]
pub struct CosineAlignment {
    /// Mean over reference atoms of the best cosine achieved by any learned atom.
    pub score: f32,
    /// Pairwise cosines, `(learned atoms × reference atoms)`.
    pub similarity: Tensor,
    /// For every reference atom, the learned atom that matched it best.
    pub best_match: Vec<usize>,
    /// Whether the inputs were transposed to line up their feature axes.
    pub transposed: bool,
}

/// Scales every column to unit length. Returns the normalised tensor and the
/// raw column norms.
pub fn normalize_columns(tensor: &Tensor) -> (Tensor, Vec<f32>) {
    let norms = tensor.column_norms();
    let cols = tensor.cols();
    let mut normalized = tensor.clone();
    for row in normalized.data_mut().chunks_mut(cols) {
        for (value, norm) in row.iter_mut().zip(norms.iter()) {
            *value /= norm.max(NORM_FLOOR);
        }
    }
    (normalized, norms)
}

/// Mean-max cosine similarity of `learned` against `reference`.
///
/// When the leading axes disagree both inputs are transposed first so that
/// the feature axis lines up. The score is asymmetric: every *reference*
/// column looks for its best partner among the learned columns.
pub fn mean_max_cosine_similarity(
    learned: &Tensor,
    reference: &Tensor,
    device: Device,
) -> PureResult<CosineAlignment> {
    let mut learned = learned.to_device(device)?;
    let mut reference = reference.to_device(device)?;
    let transposed = learned.rows() != reference.rows();
    if transposed {
        learned = learned.transpose();
        reference = reference.transpose();
    }
    if learned.rows() != reference.rows() {
        return Err(TensorError::ShapeMismatch {
            left: learned.shape(),
            right: reference.shape(),
        });
    }

    let (learned_hat, _) = normalize_columns(&learned);
    let (reference_hat, _) = normalize_columns(&reference);
    let similarity = learned_hat.transpose().matmul(&reference_hat)?;

    let (atoms, targets) = similarity.shape();
    let data = similarity.data();
    let mut best_match = Vec::with_capacity(targets);
    let mut total = 0.0f32;
    for j in 0..targets {
        let mut best = 0usize;
        let mut best_value = f32::NEG_INFINITY;
        for i in 0..atoms {
            let value = data[i * targets + j];
            if value > best_value {
                best_value = value;
                best = i;
            }
        }
        best_match.push(best);
        total += best_value;
    }

    Ok(CosineAlignment {
        score: total / targets as f32,
        similarity,
        best_match,
        transposed,
    })
}

/// Result of the Weiszfeld geometric median solver.
#[derive(Clone, Debug)]
pub struct GeometricMedian {
    pub median: Tensor,
    /// Number of Weiszfeld updates performed.
    pub iterations: usize,
    /// Whether the displacement dropped below the tolerance before the cap.
    pub converged: bool,
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Geometric median of same-shaped tensors, starting from their arithmetic mean.
pub fn geometric_median(
    points: &[Tensor],
    max_iter: usize,
    tolerance: f32,
) -> PureResult<GeometricMedian> {
    let first = points
        .first()
        .ok_or(TensorError::EmptyInput("geometric_median points"))?;
    if !(tolerance > 0.0) {
        return Err(TensorError::NonPositiveTolerance { tolerance });
    }
    for point in points {
        if point.shape() != first.shape() {
            return Err(TensorError::ShapeMismatch {
                left: first.shape(),
                right: point.shape(),
            });
        }
    }

    let count = points.len() as f32;
    let mut guess = vec![0.0f32; first.len()];
    for point in points {
        for (g, v) in guess.iter_mut().zip(point.data()) {
            *g += v / count;
        }
    }

    let mut iterations = 0usize;
    let mut converged = false;
    let mut weights = vec![0.0f32; points.len()];
    while iterations < max_iter {
        iterations += 1;
        for (w, point) in weights.iter_mut().zip(points) {
            *w = 1.0 / euclidean_distance(point.data(), &guess).max(DISTANCE_FLOOR);
        }
        let total: f32 = weights.iter().sum();
        let mut next = vec![0.0f32; guess.len()];
        for (w, point) in weights.iter().zip(points) {
            let w = w / total;
            for (n, v) in next.iter_mut().zip(point.data()) {
                *n += w * v;
            }
        }
        let shift = euclidean_distance(&next, &guess);
        guess = next;
        if shift < tolerance {
            converged = true;
            break;
        }
    }

    let (rows, cols) = first.shape();
    let median = Tensor::from_vec(rows, cols, guess)?.to_device(first.device())?;
    Ok(GeometricMedian {
        median,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary(seed: u64, rows: usize, cols: usize) -> Tensor {
        Tensor::random_normal(rows, cols, 0.0, 1.0, Some(seed)).unwrap()
    }

    #[test]
    fn similarity_is_bounded() {
        for seed in 0..16u64 {
            let a = dictionary(seed, 6, 5);
            let b = dictionary(seed + 100, 6, 7);
            let alignment = mean_max_cosine_similarity(&a, &b, Device::Cpu).unwrap();
            assert!(alignment.score >= -1.0 - 1e-5 && alignment.score <= 1.0 + 1e-5);
            assert_eq!(alignment.similarity.shape(), (5, 7));
            assert_eq!(alignment.best_match.len(), 7);
        }
    }

    #[test]
    fn dictionary_matches_itself() {
        let a = dictionary(3, 8, 4);
        let alignment = mean_max_cosine_similarity(&a, &a, Device::Cpu).unwrap();
        assert!((alignment.score - 1.0).abs() < 1e-5);
        assert_eq!(alignment.best_match, vec![0, 1, 2, 3]);
    }

    #[test]
    fn similarity_is_asymmetric() {
        // a = [e1, e2], b = [e1, e1]
        let a = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let b = Tensor::from_vec(2, 2, vec![1.0, 1.0, 0.0, 0.0]).unwrap();
        let ab = mean_max_cosine_similarity(&a, &b, Device::Cpu).unwrap().score;
        let ba = mean_max_cosine_similarity(&b, &a, Device::Cpu).unwrap().score;
        assert!((ab - 1.0).abs() < 1e-6);
        assert!((ba - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_columns_have_zero_cosine() {
        let learned = Tensor::zeros(3, 2).unwrap();
        let reference = dictionary(11, 3, 2);
        let alignment = mean_max_cosine_similarity(&learned, &reference, Device::Cpu).unwrap();
        assert_eq!(alignment.score, 0.0);
        assert!(alignment.similarity.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn mismatched_leading_axes_are_transposed() {
        let learned = dictionary(5, 4, 6);
        let reference = dictionary(7, 3, 6);
        let alignment = mean_max_cosine_similarity(&learned, &reference, Device::Cpu).unwrap();
        assert!(alignment.transposed);
        assert_eq!(alignment.similarity.shape(), (4, 3));
        let incompatible = dictionary(6, 3, 5);
        assert!(matches!(
            mean_max_cosine_similarity(&learned, &incompatible, Device::Cpu),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn single_point_is_its_own_median() {
        let p = Tensor::from_vec(1, 3, vec![1.0, -2.0, 4.0]).unwrap();
        let result = geometric_median(&[p.clone()], 50, 1e-5).unwrap();
        assert!(result.converged);
        assert!(result.iterations <= 1);
        assert_eq!(result.median, p);
    }

    #[test]
    fn coincident_points_collapse() {
        let p = Tensor::from_vec(2, 2, vec![0.5, 1.5, -1.0, 3.0]).unwrap();
        let points = vec![p.clone(), p.clone(), p.clone()];
        let result = geometric_median(&points, 100, 1e-5).unwrap();
        for (a, b) in result.median.data().iter().zip(p.data()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn median_follows_translation() {
        let points: Vec<Tensor> = (0..5u64).map(|s| dictionary(s + 40, 1, 3)).collect();
        let offset = Tensor::from_vec(1, 3, vec![3.0, -1.0, 0.5]).unwrap();
        let translate = |p: &Tensor| {
            let mut moved = p.clone();
            moved.add_scaled(&offset, 1.0).unwrap();
            moved
        };
        let shifted: Vec<Tensor> = points.iter().map(translate).collect();

        let base = geometric_median(&points, 500, 1e-7).unwrap().median;
        let moved = geometric_median(&shifted, 500, 1e-7).unwrap().median;
        let expected = translate(&base);
        for (a, b) in moved.data().iter().zip(expected.data()) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn median_resists_a_single_outlier() {
        let mut points: Vec<Tensor> = (0..4)
            .map(|i| Tensor::from_vec(1, 2, vec![i as f32 * 0.01, 0.0]).unwrap())
            .collect();
        points.push(Tensor::from_vec(1, 2, vec![100.0, 100.0]).unwrap());
        let result = geometric_median(&points, 200, 1e-6).unwrap();
        assert!(result.median.data()[0] < 1.0);
        assert!(result.median.data()[1] < 1.0);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(matches!(
            geometric_median(&[], 10, 1e-5),
            Err(TensorError::EmptyInput(_))
        ));
        let a = Tensor::zeros(1, 2).unwrap();
        let b = Tensor::zeros(2, 1).unwrap();
        assert!(matches!(
            geometric_median(&[a.clone(), b], 10, 1e-5),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            geometric_median(&[a], 10, 0.0),
            Err(TensorError::NonPositiveTolerance { .. })
        ));
    }
}
