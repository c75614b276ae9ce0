// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Byte snapshots of module parameters and standalone tensors.
//!
//! Snapshots are keyed by parameter name and stored in a sorted map so the
//! same state always encodes to the same bytes.

use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: BTreeMap<String, StoredTensor>,
}

impl ModuleSnapshot {
    fn from_state(state: &HashMap<String, Tensor>) -> Self {
        let parameters = state
            .iter()
            .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
            .collect();
        Self { parameters }
    }

    fn into_state(self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(self.parameters.len());
        for (name, tensor) in self.parameters {
            state.insert(name, tensor.into_tensor()?);
        }
        Ok(state)
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Encodes a state dict into bincode bytes.
pub fn state_dict_to_bytes(state: &HashMap<String, Tensor>) -> PureResult<Vec<u8>> {
    bincode::serialize(&ModuleSnapshot::from_state(state)).map_err(serde_error)
}

/// Decodes bytes produced by [`state_dict_to_bytes`].
pub fn state_dict_from_bytes(bytes: &[u8]) -> PureResult<HashMap<String, Tensor>> {
    let snapshot: ModuleSnapshot = bincode::deserialize(bytes).map_err(serde_error)?;
    snapshot.into_state()
}

/// Encodes a single tensor into bincode bytes.
pub fn tensor_to_bytes(tensor: &Tensor) -> PureResult<Vec<u8>> {
    bincode::serialize(&StoredTensor::from_tensor(tensor)).map_err(serde_error)
}

/// Decodes bytes produced by [`tensor_to_bytes`].
pub fn tensor_from_bytes(bytes: &[u8]) -> PureResult<Tensor> {
    let stored: StoredTensor = bincode::deserialize(bytes).map_err(serde_error)?;
    stored.into_tensor()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::module::Module;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layer(name: &str, seed: u64) -> Linear {
        let mut rng = StdRng::seed_from_u64(seed);
        Linear::orthogonal(name, 3, 5, &mut rng).unwrap()
    }

    #[test]
    fn state_dict_bytes_restore_a_module() {
        let source = layer("enc", 1);
        let bytes = state_dict_to_bytes(&source.state_dict().unwrap()).unwrap();

        let mut target = layer("enc", 2);
        assert_ne!(source.weight().value(), target.weight().value());
        target
            .load_state_dict(&state_dict_from_bytes(&bytes).unwrap())
            .unwrap();
        assert_eq!(source.weight().value(), target.weight().value());
    }

    #[test]
    fn foreign_snapshot_reports_missing_parameters() {
        let bytes = state_dict_to_bytes(&layer("a", 1).state_dict().unwrap()).unwrap();
        let mut other = layer("b", 1);
        assert!(matches!(
            other.load_state_dict(&state_dict_from_bytes(&bytes).unwrap()),
            Err(TensorError::MissingParameter { .. })
        ));
    }

    #[test]
    fn encoding_is_stable_across_map_order() {
        let layer = layer("fc", 4);
        let state = layer.state_dict().unwrap();
        let first = state_dict_to_bytes(&state).unwrap();
        let second = state_dict_to_bytes(&state.clone()).unwrap();
        assert_eq!(first, second);
        let decoded = state_dict_from_bytes(&first).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["fc::weight"], *layer.weight().value());
    }

    #[test]
    fn tensors_keep_their_shape() {
        let tensor = Tensor::from_vec(2, 3, vec![1.0, -2.0, 0.5, 0.0, 4.0, 8.0]).unwrap();
        let decoded = tensor_from_bytes(&tensor_to_bytes(&tensor).unwrap()).unwrap();
        assert_eq!(decoded, tensor);
        assert!(matches!(
            tensor_from_bytes(&[1, 2, 3]),
            Err(TensorError::SerializationError { .. })
        ));
    }
}
