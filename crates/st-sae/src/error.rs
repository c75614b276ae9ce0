// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::TensorError;
use std::path::PathBuf;

pub type SaeResult<T> = Result<T, SaeError>;

#[derive(Debug, thiserror::Error)]
pub enum SaeError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("failed to handle JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: Option<PathBuf>,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid trainer configuration: {0}")]
    Config(String),
    #[error("consensus graph was already released before encoder {encoder} ran backward")]
    GraphReleased { encoder: usize },
    #[error("encoder index {index} is out of range for an ensemble of {len}")]
    EncoderOutOfRange { index: usize, len: usize },
    #[error("artifact '{name}' already exists and is immutable")]
    ArtifactExists { name: String },
}

impl SaeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SaeError::Io {
            path: path.into(),
            source,
        }
    }
}
