//! Measurement bookkeeping shared by every trainer.
//!
//! Measurements are keyed by a closed [`MetricKey`] set. Scalars are folded by
//! summation and divided down to means at logging boundaries; trajectories
//! (one value per inner-adaptation step) are summed element-wise along the
//! task axis so their length is preserved.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of metric names a trainer may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricKey {
    Loss,
    /// Classification accuracy as a fraction in `[0, 1]`.
    Accu,
    AuxLoss,
    /// Loss of the frozen SVRG snapshot on the current batch.
    LossGlobal,
}

impl MetricKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKey::Loss => "loss",
            MetricKey::Accu => "accu",
            MetricKey::AuxLoss => "aux_loss",
            MetricKey::LossGlobal => "loss_global",
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The key set of one logical run.
///
/// Every measurement of a run uses exactly these keys: `loss` always,
/// `accu` for classification algorithms, `aux_loss` when an auxiliary
/// objective is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricSchema {
    pub classification: bool,
    pub auxiliary: bool,
}

impl MetricSchema {
    pub fn new(classification: bool, auxiliary: bool) -> Self {
        Self {
            classification,
            auxiliary,
        }
    }

    pub fn keys(&self) -> Vec<MetricKey> {
        let mut keys = vec![MetricKey::Loss];
        if self.classification {
            keys.push(MetricKey::Accu);
        }
        if self.auxiliary {
            keys.push(MetricKey::AuxLoss);
        }
        keys
    }

    /// Panics if `keys` strays outside the schema.
    pub fn check<'a, I>(&self, keys: I, family: &str)
    where
        I: IntoIterator<Item = &'a MetricKey>,
    {
        let allowed = self.keys();
        for key in keys {
            if !allowed.contains(key) {
                panic!(
                    "METRIC SCHEMA ERROR: {} produced key '{}' outside the run schema {:?}",
                    family, key, allowed
                );
            }
        }
    }
}

/// Scalar measurements of one task or batch: key -> values to be summed.
pub type Measurements = BTreeMap<MetricKey, Vec<f64>>;

/// Trajectory measurements: key -> one trajectory per task.
pub type Trajectories = BTreeMap<MetricKey, Vec<Vec<f64>>>;

/// Per-run accumulated sums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningAggregate {
    pub scalars: BTreeMap<MetricKey, f64>,
    pub trajectories: BTreeMap<MetricKey, Vec<f64>>,
    /// Tasks (per-task mode) or batches (batched mode) folded in.
    pub count: usize,
}

impl RunningAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.trajectories.is_empty()
    }

    /// Consume into the mean over `count`, or leave untouched when nothing was folded.
    pub fn into_mean(mut self) -> Self {
        if self.count > 0 {
            let n = self.count;
            divide(&mut self, n);
        }
        self
    }
}

/// Adds the sum of each key's values into the running scalar sums.
pub fn update_sum(running: &mut RunningAggregate, measurements: &Measurements) {
    for (key, values) in measurements {
        *running.scalars.entry(*key).or_insert(0.0) += values.iter().sum::<f64>();
    }
}

/// Sums trajectories element-wise along the task axis.
///
/// # Panics
///
/// Panics if trajectories of one key differ in length, within this call or
/// against what was accumulated before.
pub fn update_sum_trajectory(running: &mut RunningAggregate, trajectories: &Trajectories) {
    for (key, per_task) in trajectories {
        for trajectory in per_task {
            let sum = running
                .trajectories
                .entry(*key)
                .or_insert_with(|| vec![0.0; trajectory.len()]);
            if sum.len() != trajectory.len() {
                panic!(
                    "TRAJECTORY ERROR: key '{}' has trajectory length {} but {} was accumulated before",
                    key,
                    trajectory.len(),
                    sum.len()
                );
            }
            for (acc, value) in sum.iter_mut().zip(trajectory) {
                *acc += *value;
            }
        }
    }
}

/// In-place division of every scalar and every trajectory element by `n`.
///
/// # Panics
///
/// Panics if `n == 0`.
pub fn divide(running: &mut RunningAggregate, n: usize) {
    assert!(n > 0, "AGGREGATE ERROR: cannot divide running sums by zero");
    let n = n as f64;
    for value in running.scalars.values_mut() {
        *value /= n;
    }
    for trajectory in running.trajectories.values_mut() {
        for value in trajectory.iter_mut() {
            *value /= n;
        }
    }
}

/// Arithmetic mean; `0.0` for an empty sequence.
pub fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; `0.0` for an empty sequence.
pub fn standard_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = average(values);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// 95% confidence interval over per-task accuracies (in percent).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub half_width: f64,
    pub n: usize,
}

impl ConfidenceInterval {
    pub fn from_accuracies(accuracies: &[f64]) -> Option<Self> {
        if accuracies.is_empty() {
            return None;
        }
        let n = accuracies.len();
        Some(Self {
            mean: average(accuracies),
            half_width: 1.96 * standard_deviation(accuracies) / (n as f64).sqrt(),
            n,
        })
    }
}

impl fmt::Display for ConfidenceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} ± {:.2} %", self.mean, self.half_width)
    }
}

/// Windowed mean of named scalars, flushed at the log interval.
///
/// The classical trainers log `mean(window)` under the metric name, reset the
/// window, and keep the flushed means so an epoch summary (`val_<name>`) can
/// be reported at epoch end.
#[derive(Debug, Clone, Default)]
pub struct MetricWindow {
    window: BTreeMap<String, Vec<f64>>,
    flushed: BTreeMap<String, Vec<f64>>,
}

impl MetricWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: f64) {
        self.window.entry(name.to_string()).or_default().push(value);
    }

    pub fn len(&self, name: &str) -> usize {
        self.window.get(name).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.window.values().all(Vec::is_empty)
    }

    /// Means of the current window. The window is cleared only after the
    /// means are computed and handed back.
    pub fn flush(&mut self) -> Vec<(String, f64)> {
        let means: Vec<(String, f64)> = self
            .window
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| (name.clone(), average(values)))
            .collect();
        for (name, mean) in &means {
            self.flushed.entry(name.clone()).or_default().push(*mean);
        }
        self.window.clear();
        means
    }

    /// Epoch summary: mean of the flushed window means, under `val_<name>`.
    pub fn epoch_summary(&mut self) -> Vec<(String, f64)> {
        let summary = self
            .flushed
            .iter()
            .map(|(name, means)| (format!("val_{}", name), average(means)))
            .collect();
        self.flushed.clear();
        summary
    }
}
