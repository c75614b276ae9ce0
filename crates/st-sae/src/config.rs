// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{SaeError, SaeResult};
use crate::monitor::DEFAULT_TARGET_RATE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_consistency_weight() -> f32 {
    1.0
}

fn default_reinit_threshold() -> f32 {
    2.5
}

fn default_use_amp() -> bool {
    true
}

fn default_warmup_steps() -> u64 {
    100
}

fn default_target_activation_rate() -> f32 {
    DEFAULT_TARGET_RATE
}

fn default_run_name() -> String {
    "consensus-sae".to_string()
}

/// Hyperparameters of [`crate::ConsensusTrainer`].
///
/// Only `learning_rate` is mandatory when deserialising; every other field
/// falls back to its default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub learning_rate: f32,
    /// Multiplier on the pairwise consensus term.
    #[serde(default = "default_consistency_weight")]
    pub ensemble_consistency_weight: f32,
    /// Sensitivity above which an encoder is reinitialised.
    #[serde(default = "default_reinit_threshold")]
    pub reinit_threshold: f32,
    #[serde(default = "default_use_amp")]
    pub use_amp: bool,
    /// Steps over which the consensus term ramps in.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u64,
    /// Fraction of non-zero codes per column the monitor considers healthy.
    #[serde(default = "default_target_activation_rate")]
    pub target_activation_rate: f32,
    /// Seed for reinitialisation draws. Falls back to `spiral_config::determinism`.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_run_name")]
    pub run_name: String,
}

impl TrainerConfig {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            ensemble_consistency_weight: default_consistency_weight(),
            reinit_threshold: default_reinit_threshold(),
            use_amp: default_use_amp(),
            warmup_steps: default_warmup_steps(),
            target_activation_rate: default_target_activation_rate(),
            seed: None,
            run_name: default_run_name(),
        }
    }

    pub fn from_json_str(text: &str) -> SaeResult<Self> {
        let config: TrainerConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> SaeResult<Self> {
        Self::parse_toml(text, None)
    }

    fn parse_toml(text: &str, path: Option<PathBuf>) -> SaeResult<Self> {
        let config: TrainerConfig =
            toml::from_str(text).map_err(|source| SaeError::Toml { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a `.json` or `.toml` file, picking the parser from the extension.
    pub fn from_path(path: impl AsRef<Path>) -> SaeResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SaeError::io(path, source))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("toml") => Self::parse_toml(&text, Some(path.to_path_buf())),
            other => Err(SaeError::Config(format!(
                "unsupported configuration format {other:?} for {}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> SaeResult<()> {
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return Err(SaeError::Config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if !(self.ensemble_consistency_weight >= 0.0)
            || !self.ensemble_consistency_weight.is_finite()
        {
            return Err(SaeError::Config(format!(
                "ensemble_consistency_weight must be non-negative, got {}",
                self.ensemble_consistency_weight
            )));
        }
        if !self.reinit_threshold.is_finite() {
            return Err(SaeError::Config(
                "reinit_threshold must be finite".to_string(),
            ));
        }
        if !(self.target_activation_rate > 0.0) || !self.target_activation_rate.is_finite() {
            return Err(SaeError::Config(format!(
                "target_activation_rate must be positive, got {}",
                self.target_activation_rate
            )));
        }
        if self.run_name.trim().is_empty() {
            return Err(SaeError::Config("run_name must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_in_defaults() {
        let config = TrainerConfig::from_json_str(r#"{"learning_rate": 0.001}"#).unwrap();
        assert_eq!(config, TrainerConfig::new(0.001));
        assert_eq!(config.ensemble_consistency_weight, 1.0);
        assert_eq!(config.reinit_threshold, 2.5);
        assert!(config.use_amp);
        assert_eq!(config.warmup_steps, 100);
        assert_eq!(config.target_activation_rate, 0.0625);
    }

    #[test]
    fn toml_overrides_fields() {
        let config = TrainerConfig::from_toml_str(
            "learning_rate = 0.01\nuse_amp = false\nwarmup_steps = 5\nseed = 7\n",
        )
        .unwrap();
        assert!(!config.use_amp);
        assert_eq!(config.warmup_steps, 5);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn learning_rate_is_required() {
        assert!(matches!(
            TrainerConfig::from_json_str(r#"{"use_amp": false}"#),
            Err(SaeError::Json(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = TrainerConfig::new(0.0);
        assert!(matches!(config.validate(), Err(SaeError::Config(_))));
        config.learning_rate = 1e-3;
        config.ensemble_consistency_weight = -1.0;
        assert!(matches!(config.validate(), Err(SaeError::Config(_))));
        config.ensemble_consistency_weight = 0.0;
        config.target_activation_rate = 0.0;
        assert!(matches!(config.validate(), Err(SaeError::Config(_))));
    }

    #[test]
    fn files_are_loaded_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("trainer.json");
        fs::write(&json, r#"{"learning_rate": 0.5, "run_name": "from-file"}"#).unwrap();
        assert_eq!(TrainerConfig::from_path(&json).unwrap().run_name, "from-file");

        let toml_path = dir.path().join("trainer.toml");
        fs::write(&toml_path, "learning_rate = 0.25\n").unwrap();
        assert_eq!(TrainerConfig::from_path(&toml_path).unwrap().learning_rate, 0.25);

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "learning_rate = \n").unwrap();
        match TrainerConfig::from_path(&broken) {
            Err(SaeError::Toml { path, .. }) => assert_eq!(path, Some(broken.clone())),
            other => panic!("expected a TOML error, got {other:?}"),
        }
        assert!(matches!(
            TrainerConfig::from_toml_str("learning_rate = \n"),
            Err(SaeError::Toml { path: None, .. })
        ));
        let invalid = dir.path().join("invalid.toml");
        fs::write(&invalid, "learning_rate = -1.0\n").unwrap();
        assert!(matches!(
            TrainerConfig::from_path(&invalid),
            Err(SaeError::Config(_))
        ));

        let yaml = dir.path().join("trainer.yaml");
        fs::write(&yaml, "learning_rate: 1").unwrap();
        assert!(matches!(
            TrainerConfig::from_path(&yaml),
            Err(SaeError::Config(_))
        ));
    }
}
