use burn::tensor::{activation, backend::Backend, ElementConversion, Tensor};

use super::config::OuterLoss;
use super::contract::AuxObjective;
use super::episode::one_hot;

/// Multiply logits by an optional `[1]`-shaped scale tensor.
pub fn apply_scale<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    scale: Option<Tensor<B, 1>>,
) -> Tensor<B, D> {
    match scale {
        Some(scale) => logits * scale.reshape([1; D]),
        None => logits,
    }
}

/// Cross-entropy against targets smoothed to `1 - eps` on the true class and
/// `eps / (C - 1)` elsewhere, averaged over rows.
///
/// # Arguments
///
/// * `logits` - `[N, C]` unnormalized scores
/// * `targets` - `N` labels in `0..C`
/// * `eps` - smoothing mass; `0.0` gives plain cross-entropy
///
/// # Panics
///
/// * `SHAPE ERROR` if `targets.len() != N`
/// * `LABEL ERROR` if a target falls outside `0..C`
pub fn smooth_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: &[i64],
    eps: f64,
) -> Tensor<B, 1> {
    let [rows, classes] = logits.dims();
    if targets.len() != rows {
        panic!(
            "SHAPE ERROR: {} targets for logits with {} rows",
            targets.len(),
            rows
        );
    }
    let device = logits.device();
    let log_probs = activation::log_softmax(logits, 1);
    let hard = one_hot::<B>(targets, classes, &device);
    let soft = if eps > 0.0 && classes > 1 {
        let off = eps / (classes - 1) as f64;
        hard.clone().mul_scalar(1.0 - eps) + hard.neg().add_scalar(1.0).mul_scalar(off)
    } else {
        hard
    };
    (soft * log_probs).sum_dim(1).mean().neg()
}

pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: &[i64]) -> Tensor<B, 1> {
    smooth_cross_entropy(logits, targets, 0.0)
}

/// Evaluate the configured outer objective.
pub fn outer_loss<B: Backend>(
    kind: OuterLoss,
    logits: Tensor<B, 2>,
    targets: &[i64],
) -> Tensor<B, 1> {
    match kind {
        OuterLoss::CrossEntropy => cross_entropy(logits, targets),
        OuterLoss::SmoothedCrossEntropy { eps } => smooth_cross_entropy(logits, targets, eps),
    }
}

/// Fraction of rows whose arg-max matches the target, in `[0, 1]`.
pub fn accuracy<B: Backend>(logits: Tensor<B, 2>, targets: &[i64]) -> f64 {
    let [rows, _] = logits.dims();
    if rows == 0 {
        return 0.0;
    }
    let predictions = logits.argmax(1).reshape([rows]).to_data();
    let correct = predictions
        .iter::<i64>()
        .zip(targets)
        .filter(|(p, t)| p == *t)
        .count();
    correct as f64 / rows as f64
}

/// Host value of a single-element loss tensor.
pub fn scalar<B: Backend>(value: Tensor<B, 1>) -> f64 {
    value.into_scalar().elem::<f64>()
}

/// Shift raw labels down by `offset`.
pub fn rebase_labels(labels: &[i64], offset: i64) -> Vec<i64> {
    labels.iter().map(|l| l - offset).collect()
}

/// Mean squared distance of features to their class mean within the batch.
///
/// A simple auxiliary objective pulling same-class features together.
#[derive(Debug, Clone, Default)]
pub struct ClassCompactness;

impl<B: Backend> AuxObjective<B> for ClassCompactness {
    fn name(&self) -> &str {
        "class_compactness"
    }

    fn loss(&self, features: Tensor<B, 2>, labels: &[i64]) -> Tensor<B, 1> {
        let classes = labels.iter().copied().max().map_or(0, |m| m as usize + 1);
        let device = features.device();
        let membership = one_hot::<B>(labels, classes, &device);
        let counts = membership.clone().sum_dim(0).clamp_min(1.0);
        let means = membership.clone().transpose().matmul(features.clone()) / counts.transpose();
        let centered = features - membership.matmul(means);
        centered.powf_scalar(2.0).sum_dim(1).mean()
    }
}
