//! Meta-training driver: alternate training windows with validation runs.

use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::checkpoint::Checkpointer;
use super::config::MetaScheduleConfig;
use super::contract::{InnerLoopAlgorithm, RunMode};
use super::measurements::{ConfidenceInterval, MetricKey};
use super::meta::MetaTrainer;
use super::run::{Episode, RunOptions};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

/// Outcome of one train-then-validate round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRound {
    pub round: usize,
    /// First training iteration of the window.
    pub start: usize,
    /// Training batches actually processed.
    pub batches: usize,
    pub learning_rate: f64,
    pub train_loss: Option<f64>,
    pub val_task_acc: Option<ConfidenceInterval>,
}

/// Train for `schedule.total_batches` iterations, validating every
/// `schedule.val_interval` iterations.
///
/// Round `r` trains iterations `k..k + val_interval` and then evaluates
/// `validation()` with `meta_val` logging at step `k + val_interval - 1`.
/// The learning rate for round `r` is the configured base rate times
/// [`MetaScheduleConfig::lr_factor`]. Stops early when the training source
/// runs dry.
///
/// # Errors
///
/// Propagates checkpoint failures from either run.
pub fn train_with_validation<B, A, O, S, C, T, V, VI>(
    trainer: &mut MetaTrainer<B, A, O, S, C>,
    train: T,
    mut validation: V,
    schedule: &MetaScheduleConfig,
) -> Result<Vec<ValidationRound>>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B>,
    O: Optimizer<A, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
    T: IntoIterator,
    T::Item: Into<Episode<B>>,
    V: FnMut() -> VI,
    VI: IntoIterator,
    VI::Item: Into<Episode<B>>,
{
    let base_rate = trainer.config().learning_rate;
    let interval = trainer.config().optimizer_update_interval.max(1);
    let val_interval = schedule.val_interval.max(1);
    let end = schedule.total_batches + 1;

    let mut train = train.into_iter();
    let mut rounds = Vec::new();
    let mut start = 1;
    let mut round = 0;

    while start < end {
        let learning_rate = base_rate * schedule.lr_factor(round, interval);
        trainer.set_learning_rate(learning_rate);
        let stop = (start + val_interval).min(end);

        let trained = trainer.run(train.by_ref(), RunMode::Train, RunOptions::window(start, stop))?;
        if trained.batches == 0 {
            break;
        }
        let validated = trainer.run(
            validation(),
            RunMode::Eval,
            RunOptions::starting_at(stop - 1).with_meta_val(true),
        )?;

        info!(
            round,
            start,
            learning_rate,
            val_task_acc = %validated
                .val_task_acc
                .map(|ci| ci.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            "validation round"
        );
        rounds.push(ValidationRound {
            round,
            start,
            batches: trained.batches,
            learning_rate,
            train_loss: trained.test_mean(MetricKey::Loss),
            val_task_acc: validated.val_task_acc,
        });

        if trained.batches < stop - start {
            break;
        }
        start = stop;
        round += 1;
    }
    Ok(rounds)
}
