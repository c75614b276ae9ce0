// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{SaeError, SaeResult};
use st_tensor::Tensor;

/// Share of non-zero codes per column considered healthy by default.
pub const DEFAULT_TARGET_RATE: f32 = 0.0625;

/// Detects encoders whose codes are mostly dead or mostly saturated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureMonitor {
    target_rate: f32,
    threshold: f32,
}

/// Per-encoder verdicts, index-aligned with the ensemble.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActivityReport {
    pub flags: Vec<bool>,
    pub sensitivities: Vec<f32>,
}

impl ActivityReport {
    pub fn any_flagged(&self) -> bool {
        self.flags.iter().any(|flag| *flag)
    }

    /// Indices of flagged encoders in ascending order.
    pub fn flagged(&self) -> impl Iterator<Item = usize> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(index, flag)| flag.then_some(index))
    }

    pub fn into_parts(self) -> (Vec<bool>, Vec<f32>) {
        (self.flags, self.sensitivities)
    }
}

impl FeatureMonitor {
    pub fn new(target_rate: f32, threshold: f32) -> SaeResult<Self> {
        if !(target_rate > 0.0) || !target_rate.is_finite() {
            return Err(SaeError::Config(format!(
                "target activation rate must be positive, got {target_rate}"
            )));
        }
        Ok(Self {
            target_rate,
            threshold,
        })
    }

    pub fn target_rate(&self) -> f32 {
        self.target_rate
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Mean over code columns of `(|rate - target| / target)³`.
    pub fn sensitivity(&self, activations: &Tensor) -> f32 {
        let (rows, cols) = activations.shape();
        let mut active = vec![0usize; cols];
        for row in activations.data().chunks(cols) {
            for (count, value) in active.iter_mut().zip(row) {
                if *value != 0.0 {
                    *count += 1;
                }
            }
        }
        let total: f32 = active
            .iter()
            .map(|&count| {
                let rate = count as f32 / rows as f32;
                ((rate - self.target_rate).abs() / self.target_rate).powi(3)
            })
            .sum();
        total / cols as f32
    }

    pub fn inspect(&self, activations: &[Tensor]) -> ActivityReport {
        let sensitivities: Vec<f32> = activations.iter().map(|a| self.sensitivity(a)).collect();
        let flags = sensitivities
            .iter()
            .map(|&sensitivity| sensitivity > self.threshold)
            .collect();
        ActivityReport {
            flags,
            sensitivities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes_with_rate(rows: usize, cols: usize, active_rows: usize) -> Tensor {
        Tensor::from_fn(rows, cols, |r, _| if r < active_rows { 0.7 } else { 0.0 }).unwrap()
    }

    #[test]
    fn on_target_rate_is_silent() {
        let monitor = FeatureMonitor::new(DEFAULT_TARGET_RATE, 2.5).unwrap();
        let codes = codes_with_rate(32, 8, 2);
        assert_eq!(monitor.sensitivity(&codes), 0.0);
        let report = monitor.inspect(&[codes]);
        assert!(!report.any_flagged());
    }

    #[test]
    fn dead_codes_have_unit_sensitivity() {
        let monitor = FeatureMonitor::new(DEFAULT_TARGET_RATE, 0.5).unwrap();
        let dead = Tensor::zeros(16, 4).unwrap();
        let report = monitor.inspect(&[dead]);
        assert!((report.sensitivities[0] - 1.0).abs() < 1e-6);
        assert_eq!(report.flags, vec![true]);
    }

    #[test]
    fn saturated_codes_exceed_the_default_threshold() {
        let monitor = FeatureMonitor::new(DEFAULT_TARGET_RATE, 2.5).unwrap();
        let saturated = codes_with_rate(16, 4, 16);
        // (1 - 1/16) / (1/16) = 15
        assert!((monitor.sensitivity(&saturated) - 3375.0).abs() < 1e-2);
        let healthy = codes_with_rate(16, 4, 1);
        let report = monitor.inspect(&[healthy, saturated]);
        assert_eq!(report.flagged().collect::<Vec<_>>(), vec![1]);
        let (flags, sensitivities) = report.into_parts();
        assert_eq!(flags, vec![false, true]);
        assert_eq!(sensitivities.len(), 2);
    }

    #[test]
    fn rejects_non_positive_target() {
        assert!(FeatureMonitor::new(0.0, 1.0).is_err());
    }
}
