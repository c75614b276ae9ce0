// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Seeded randomness for initialisers and reinitialisers.
//!
//! Callers that pass an explicit seed always get the same stream. Callers that
//! do not are reproducible only when `SPIRAL_DETERMINISTIC` is set, in which
//! case the stream is derived from `SPIRAL_DETERMINISTIC_SEED` and a label
//! naming the component.

use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

pub const DETERMINISTIC_VAR: &str = "SPIRAL_DETERMINISTIC";
pub const SEED_VAR: &str = "SPIRAL_DETERMINISTIC_SEED";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    pub enabled: bool,
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: Self::DEFAULT_SEED,
        }
    }
}

impl DeterminismConfig {
    pub const DEFAULT_SEED: u64 = 42;

    /// Reads [`DETERMINISTIC_VAR`] and [`SEED_VAR`].
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(DETERMINISTIC_VAR).ok().as_deref(),
            std::env::var(SEED_VAR).ok().as_deref(),
        )
    }

    /// Interprets raw variable values. Any flag other than an explicit
    /// "off" spelling enables determinism; unparsable seeds fall back to the
    /// default.
    pub fn from_values(flag: Option<&str>, seed: Option<&str>) -> Self {
        let enabled = flag.is_some_and(|raw| {
            !matches!(raw.trim(), "0" | "false" | "False" | "FALSE" | "off" | "OFF" | "")
        });
        let base_seed = seed
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(Self::DEFAULT_SEED);
        Self { enabled, base_seed }
    }

    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        mix_seed(self.base_seed, label)
    }

    /// Labelled stream when enabled, OS entropy otherwise.
    pub fn rng<L: Hash>(&self, label: L) -> StdRng {
        if self.enabled {
            StdRng::seed_from_u64(self.seed_for(label))
        } else {
            StdRng::from_entropy()
        }
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Process-wide settings, read from the environment on first use.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

fn mix_seed<L: Hash>(seed: u64, label: L) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

pub fn rng_from_label(label: &str) -> StdRng {
    config().rng(label)
}

/// `seed` verbatim when given, otherwise the process-wide stream for `label`.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    seed.map_or_else(|| rng_from_label(label), StdRng::seed_from_u64)
}

/// Separate streams for the members of one ensemble sharing a single seed.
pub fn rng_for_member(seed: Option<u64>, label: &str, member: usize) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(mix_seed(value, (label, member))),
        None => config().rng((label, member)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn unset_variables_leave_determinism_off() {
        let cfg = DeterminismConfig::from_values(None, None);
        assert_eq!(cfg, DeterminismConfig::default());
        assert_eq!(cfg.base_seed, 42);
    }

    #[test]
    fn off_spellings_are_honoured() {
        for raw in ["0", "false", "off", "OFF", " "] {
            assert!(!DeterminismConfig::from_values(Some(raw), None).enabled, "{raw:?}");
        }
        assert!(DeterminismConfig::from_values(Some("1"), None).enabled);
        assert!(DeterminismConfig::from_values(Some("yes"), None).enabled);
    }

    #[test]
    fn seed_parsing_falls_back_on_garbage() {
        let cfg = DeterminismConfig::from_values(Some("1"), Some(" 1337 "));
        assert_eq!(cfg.base_seed, 1337);
        assert_eq!(cfg.seed_for("alpha"), cfg.seed_for("alpha"));
        assert_ne!(cfg.seed_for("alpha"), cfg.seed_for("beta"));
        let fallback = DeterminismConfig::from_values(Some("1"), Some("many"));
        assert_eq!(fallback.base_seed, DeterminismConfig::DEFAULT_SEED);
    }

    #[test]
    fn enabled_config_repeats_its_streams() {
        let cfg = DeterminismConfig::from_values(Some("1"), Some("9"));
        let a: u64 = cfg.rng("reinit").gen();
        let b: u64 = cfg.rng("reinit").gen();
        assert_eq!(a, b);
    }

    #[test]
    fn members_sharing_a_seed_draw_different_streams() {
        let first: u64 = rng_for_member(Some(7), "sae/encoder", 0).gen();
        let again: u64 = rng_for_member(Some(7), "sae/encoder", 0).gen();
        let second: u64 = rng_for_member(Some(7), "sae/encoder", 1).gen();
        assert_eq!(first, again);
        assert_ne!(first, second);
        let explicit: u64 = rng_from_optional(Some(3), "ignored").gen();
        assert_eq!(explicit, StdRng::seed_from_u64(3).gen::<u64>());
    }
}
