//! Run-level types shared by all trainer variants.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;

use super::config::TrainerStrategy;
use super::contract::RunMode;
use super::episode::{EpisodeBatch, TaskBatch};
use super::grad::MomentReport;
use super::measurements::{ConfidenceInterval, MetricKey, RunningAggregate};
use crate::metaopt::error::Result;

/// Common interface of every trainer variant.
pub trait Trainer<S> {
    fn strategy(&self) -> TrainerStrategy;

    /// Drive one run over `source`.
    fn run(&mut self, source: S, mode: RunMode, options: RunOptions) -> Result<RunResult>;
}

/// Iteration window of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Index of the first iteration (1-based by convention).
    pub start: usize,
    /// Training stops before fetching iteration `stop`.
    pub stop: Option<usize>,
    /// Eval runs emit whole-run means under `meta_val/*`.
    pub meta_val: bool,
    /// Epoch index for the epochal trainers.
    pub epoch: usize,
    /// Accumulate gradient moments instead of stepping the optimizer.
    pub grad_analysis: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            start: 1,
            stop: None,
            meta_val: false,
            epoch: 0,
            grad_analysis: false,
        }
    }
}

impl RunOptions {
    pub fn window(start: usize, stop: usize) -> Self {
        Self {
            start,
            stop: Some(stop),
            ..Self::default()
        }
    }

    pub fn starting_at(start: usize) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }

    pub fn epoch(epoch: usize) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    pub fn with_meta_val(mut self, meta_val: bool) -> Self {
        self.meta_val = meta_val;
        self
    }

    pub fn with_grad_analysis(mut self, grad_analysis: bool) -> Self {
        self.grad_analysis = grad_analysis;
        self
    }

    /// Whether iteration `index` is past the training bound.
    pub fn reached_stop(&self, mode: RunMode, index: usize) -> bool {
        mode.is_train() && self.stop == Some(index)
    }
}

/// Mutable bookkeeping of one run, threaded through the step functions.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Last processed iteration index.
    pub iteration: usize,
    /// Batches processed in this run.
    pub batches: usize,
    /// Whole-run sums of inner trajectories.
    pub train: RunningAggregate,
    /// Whole-run sums of post-adaptation query measurements.
    pub test: RunningAggregate,
    /// Sums since the last windowed log.
    pub window_train: RunningAggregate,
    pub window_test: RunningAggregate,
    /// Per-task query accuracies in percent.
    pub task_accuracies: Vec<f64>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the window sums, leaving empty ones behind.
    pub fn take_window(&mut self) -> (RunningAggregate, RunningAggregate) {
        (
            std::mem::take(&mut self.window_train),
            std::mem::take(&mut self.window_test),
        )
    }
}

/// What a run hands back.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Mean inner trajectories.
    pub train: RunningAggregate,
    /// Mean post-adaptation query measurements.
    pub test: RunningAggregate,
    /// Eval runs: mean per-task accuracy with its 95% half-width.
    pub val_task_acc: Option<ConfidenceInterval>,
    /// Epochal trainers: `val_<name>` epoch means.
    pub epoch_metrics: BTreeMap<String, f64>,
    pub gradient_moments: Option<MomentReport>,
    pub batches: usize,
    pub last_iteration: usize,
}

impl RunResult {
    pub fn test_mean(&self, key: MetricKey) -> Option<f64> {
        self.test.scalars.get(&key).copied()
    }

    /// Last element of the mean inner trajectory of `key`.
    pub fn train_post(&self, key: MetricKey) -> Option<f64> {
        self.train.trajectories.get(&key).and_then(|t| t.last().copied())
    }
}

/// Input accepted by the episodic trainers.
#[derive(Debug, Clone)]
pub enum Episode<B: Backend> {
    /// Flat batch still to be split and relabelled.
    Raw(EpisodeBatch<B>),
    /// Already split, e.g. fixed evaluation sets.
    Split(TaskBatch<B>),
}

impl<B: Backend> From<EpisodeBatch<B>> for Episode<B> {
    fn from(batch: EpisodeBatch<B>) -> Self {
        Episode::Raw(batch)
    }
}

impl<B: Backend> From<TaskBatch<B>> for Episode<B> {
    fn from(tasks: TaskBatch<B>) -> Self {
        Episode::Split(tasks)
    }
}
