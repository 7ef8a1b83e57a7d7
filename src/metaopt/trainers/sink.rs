//! Metrics sinks.
//!
//! Trainers emit scalars under hierarchical names such as
//! `meta_train/train_loss_post` or `outer_grad/model_norm/before_clip`.
//! Sinks never fail the run: write errors are logged and dropped.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metaopt::error::Result;

pub trait MetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize);

    /// Stacked feature matrix (one row per sample) with a label per row.
    fn add_embedding(&mut self, _tag: &str, _rows: &[Vec<f32>], _metadata: &[String], _step: usize) {}
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        (**self).add_scalar(name, value, step);
    }

    fn add_embedding(&mut self, tag: &str, rows: &[Vec<f32>], metadata: &[String], step: usize) {
        (**self).add_embedding(tag, rows, metadata, step);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingEvent {
    pub tag: String,
    pub rows: Vec<Vec<f32>>,
    pub metadata: Vec<String>,
    pub step: usize,
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub scalars: Vec<ScalarEvent>,
    pub embeddings: Vec<EmbeddingEvent>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self, name: &str) -> Vec<(usize, f64)> {
        self.scalars
            .iter()
            .filter(|e| e.name == name)
            .map(|e| (e.step, e.value))
            .collect()
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.scalars.iter().rev().find(|e| e.name == name).map(|e| e.value)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scalars.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        self.scalars.push(ScalarEvent {
            name: name.to_string(),
            value,
            step,
        });
    }

    fn add_embedding(&mut self, tag: &str, rows: &[Vec<f32>], metadata: &[String], step: usize) {
        self.embeddings.push(EmbeddingEvent {
            tag: tag.to_string(),
            rows: rows.to_vec(),
            metadata: metadata.to_vec(),
            step,
        });
    }
}

/// Forwards scalars to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        debug!(metric = name, value, step, "scalar");
    }

    fn add_embedding(&mut self, tag: &str, rows: &[Vec<f32>], _metadata: &[String], step: usize) {
        debug!(tag, rows = rows.len(), step, "embedding");
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _name: &str, _value: f64, _step: usize) {}
}

/// One JSON object per line: `{"name": ..., "value": ..., "step": ...}`.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Create (truncating) `path`, creating parent folders as needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line<T: Serialize>(&mut self, event: &T) {
        let written = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(err) = written {
            warn!(path = %self.path.display(), error = %err, "dropping metric line");
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl MetricsSink for JsonLinesSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        self.write_line(&ScalarEvent {
            name: name.to_string(),
            value,
            step,
        });
    }

    fn add_embedding(&mut self, tag: &str, rows: &[Vec<f32>], metadata: &[String], step: usize) {
        self.write_line(&EmbeddingEvent {
            tag: tag.to_string(),
            rows: rows.to_vec(),
            metadata: metadata.to_vec(),
            step,
        });
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %err, "failed to flush metrics");
        }
    }
}

/// Sends every event to each inner sink.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        for sink in &mut self.sinks {
            sink.add_scalar(name, value, step);
        }
    }

    fn add_embedding(&mut self, tag: &str, rows: &[Vec<f32>], metadata: &[String], step: usize) {
        for sink in &mut self.sinks {
            sink.add_embedding(tag, rows, metadata, step);
        }
    }
}

/// Dump per-layer embeddings, tagged `layer{k}`.
///
/// `layers[k]` holds the per-sample feature rows of layer `k`; every layer
/// must carry one row per metadata entry.
///
/// # Panics
///
/// Panics with `SHAPE ERROR` if a layer's row count differs from `metadata.len()`.
pub fn write_embeddings<S: MetricsSink + ?Sized>(
    sink: &mut S,
    layers: &[Vec<Vec<f32>>],
    metadata: &[String],
    step: usize,
) {
    for (layer, rows) in layers.iter().enumerate() {
        if rows.len() != metadata.len() {
            panic!(
                "SHAPE ERROR: layer {} has {} embedding rows but {} metadata entries",
                layer,
                rows.len(),
                metadata.len()
            );
        }
        sink.add_embedding(&format!("layer{}", layer), rows, metadata, step);
    }
}
