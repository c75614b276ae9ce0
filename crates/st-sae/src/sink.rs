// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Destinations for per-step scalars and checkpoint blobs.
//!
//! The trainer owns exactly one [`MetricsSink`], injected at construction.
//! Artifacts are immutable: every sink refuses a second artifact with the
//! same name.

use crate::error::{SaeError, SaeResult};
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Named scalar values recorded for one training step.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepMetrics {
    values: BTreeMap<String, f64>,
}

impl StepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<f64>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, f64> {
        self.values.iter()
    }
}

/// Binary blob uploaded alongside the metrics stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub name: String,
    /// Artifact type, e.g. `model` or `true_features`.
    pub kind: String,
    pub alias: Option<String>,
    pub payload: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            alias: None,
            payload,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Experiment tracking backend.
pub trait MetricsSink {
    fn run_name(&self) -> &str;

    fn log_metrics(&mut self, step: u64, metrics: &StepMetrics) -> SaeResult<()>;

    fn log_artifact(&mut self, artifact: Artifact) -> SaeResult<()>;
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn run_name(&self) -> &str {
        (**self).run_name()
    }

    fn log_metrics(&mut self, step: u64, metrics: &StepMetrics) -> SaeResult<()> {
        (**self).log_metrics(step, metrics)
    }

    fn log_artifact(&mut self, artifact: Artifact) -> SaeResult<()> {
        (**self).log_artifact(artifact)
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn run_name(&self) -> &str {
        (**self).run_name()
    }

    fn log_metrics(&mut self, step: u64, metrics: &StepMetrics) -> SaeResult<()> {
        (**self).log_metrics(step, metrics)
    }

    fn log_artifact(&mut self, artifact: Artifact) -> SaeResult<()> {
        (**self).log_artifact(artifact)
    }
}

/// Keeps everything in memory. Used by tests and short interactive runs.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    run_name: String,
    records: Vec<(u64, StepMetrics)>,
    artifacts: Vec<Artifact>,
}

impl MemorySink {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            records: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn records(&self) -> &[(u64, StepMetrics)] {
        &self.records
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|artifact| artifact.name == name)
    }

    /// Values of `key` across all recorded steps, in logging order.
    pub fn series(&self, key: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter_map(|(_, metrics)| metrics.get(key))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn run_name(&self) -> &str {
        &self.run_name
    }

    fn log_metrics(&mut self, step: u64, metrics: &StepMetrics) -> SaeResult<()> {
        self.records.push((step, metrics.clone()));
        Ok(())
    }

    fn log_artifact(&mut self, artifact: Artifact) -> SaeResult<()> {
        if self.artifact(&artifact.name).is_some() {
            return Err(SaeError::ArtifactExists {
                name: artifact.name,
            });
        }
        self.artifacts.push(artifact);
        Ok(())
    }
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    step: u64,
    metrics: &'a StepMetrics,
}

#[derive(Serialize)]
struct ArtifactLine<'a> {
    name: &'a str,
    kind: &'a str,
    alias: Option<&'a str>,
    file: &'a str,
    bytes: usize,
}

/// Writes `<root>/<run>/metrics.jsonl`, one immutable `artifacts/<name>.bin`
/// per artifact and an `artifacts.jsonl` index.
#[derive(Debug)]
pub struct DirectorySink {
    run_name: String,
    run_dir: PathBuf,
    metrics: BufWriter<File>,
    index: BufWriter<File>,
    written: BTreeSet<String>,
}

impl DirectorySink {
    pub fn create(root: impl AsRef<Path>, run_name: impl Into<String>) -> SaeResult<Self> {
        let run_name = run_name.into();
        validate_component(&run_name)?;
        let run_dir = root.as_ref().join(&run_name);
        let artifact_dir = run_dir.join("artifacts");
        fs::create_dir_all(&artifact_dir).map_err(|source| SaeError::io(&artifact_dir, source))?;
        let metrics = open_append(&run_dir.join("metrics.jsonl"))?;
        let index = open_append(&run_dir.join("artifacts.jsonl"))?;
        Ok(Self {
            run_name,
            run_dir,
            metrics,
            index,
            written: BTreeSet::new(),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.run_dir.join("artifacts").join(format!("{name}.bin"))
    }
}

fn validate_component(name: &str) -> SaeResult<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(SaeError::Config(format!(
            "'{name}' cannot be used as a file name"
        )));
    }
    Ok(())
}

fn open_append(path: &Path) -> SaeResult<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SaeError::io(path, source))?;
    Ok(BufWriter::new(file))
}

impl MetricsSink for DirectorySink {
    fn run_name(&self) -> &str {
        &self.run_name
    }

    fn log_metrics(&mut self, step: u64, metrics: &StepMetrics) -> SaeResult<()> {
        let path = self.run_dir.join("metrics.jsonl");
        serde_json::to_writer(&mut self.metrics, &MetricsLine { step, metrics })?;
        self.metrics
            .write_all(b"\n")
            .and_then(|()| self.metrics.flush())
            .map_err(|source| SaeError::io(path, source))
    }

    fn log_artifact(&mut self, artifact: Artifact) -> SaeResult<()> {
        validate_component(&artifact.name)?;
        if self.written.contains(&artifact.name) {
            return Err(SaeError::ArtifactExists {
                name: artifact.name,
            });
        }
        let path = self.artifact_path(&artifact.name);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(SaeError::ArtifactExists {
                    name: artifact.name,
                })
            }
            Err(source) => return Err(SaeError::io(path, source)),
        };
        file.write_all(&artifact.payload)
            .and_then(|()| file.sync_all())
            .map_err(|source| SaeError::io(&path, source))?;

        let file_name = format!("{}.bin", artifact.name);
        let line = ArtifactLine {
            name: &artifact.name,
            kind: &artifact.kind,
            alias: artifact.alias.as_deref(),
            file: &file_name,
            bytes: artifact.payload.len(),
        };
        let index_path = self.run_dir.join("artifacts.jsonl");
        serde_json::to_writer(&mut self.index, &line)?;
        self.index
            .write_all(b"\n")
            .and_then(|()| self.index.flush())
            .map_err(|source| SaeError::io(index_path, source))?;
        self.written.insert(artifact.name);
        Ok(())
    }
}

/// Mirrors every metrics record and artifact into structured `tracing`
/// events before forwarding it.
#[derive(Debug)]
pub struct TracingSink<S> {
    inner: S,
}

impl<S: MetricsSink> TracingSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: MetricsSink> MetricsSink for TracingSink<S> {
    fn run_name(&self) -> &str {
        self.inner.run_name()
    }

    fn log_metrics(&mut self, step: u64, metrics: &StepMetrics) -> SaeResult<()> {
        let consensus = metrics.get("consensus_loss").unwrap_or(f64::NAN);
        let warmup = metrics.get("warmup_factor").unwrap_or(f64::NAN);
        info!(
            run = self.inner.run_name(),
            step,
            consensus_loss = consensus,
            warmup_factor = warmup,
            scalars = metrics.len(),
            "metrics"
        );
        self.inner.log_metrics(step, metrics)
    }

    fn log_artifact(&mut self, artifact: Artifact) -> SaeResult<()> {
        info!(
            run = self.inner.run_name(),
            name = %artifact.name,
            kind = %artifact.kind,
            alias = ?artifact.alias,
            bytes = artifact.payload.len(),
            "artifact"
        );
        self.inner.log_artifact(artifact)
    }
}
