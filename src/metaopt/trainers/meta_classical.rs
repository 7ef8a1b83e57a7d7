//! Episodic trainer with classical bookkeeping.
//!
//! Each episode batch is adapted in a single batched call and stepped on at
//! once: no accumulation across batches and no per-task mode. Window means
//! are logged at the log interval during training and the algorithm is
//! checkpointed at epoch boundaries instead of iteration counts.

use std::marker::PhantomData;

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use super::checkpoint::{CheckpointSchedule, Checkpointer};
use super::config::{BatchingMode, MetaClassicalTrainerConfig, TrainerStrategy};
use super::contract::{Adaptation, InnerLoopAlgorithm, RunMode};
use super::episode::split_episode;
use super::grad::clip_grad_norm;
use super::loss_utils::{apply_scale, outer_loss, scalar};
use super::measurements::{
    average, update_sum, update_sum_trajectory, ConfidenceInterval, Measurements, MetricKey,
    MetricSchema, MetricWindow, Trajectories,
};
use super::meta::per_task_accuracy;
use super::run::{Episode, RunOptions, RunResult, RunState, Trainer};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

pub struct MetaClassicalTrainer<B, A, O, S, C>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B>,
    O: Optimizer<A, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    algorithm: A,
    optimizer: O,
    config: MetaClassicalTrainerConfig,
    sink: S,
    checkpointer: C,
    window: MetricWindow,
    phantom: PhantomData<B>,
}

impl<B, A, O, S, C> MetaClassicalTrainer<B, A, O, S, C>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B>,
    O: Optimizer<A, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    pub fn new(
        algorithm: A,
        optimizer: O,
        config: MetaClassicalTrainerConfig,
        sink: S,
        checkpointer: C,
    ) -> Self {
        Self {
            algorithm,
            optimizer,
            config,
            sink,
            checkpointer,
            window: MetricWindow::new(),
            phantom: PhantomData,
        }
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    pub fn into_algorithm(self) -> A {
        self.algorithm
    }

    /// One epoch over `episodes`.
    ///
    /// Eval runs report the per-task accuracy interval and never touch the
    /// window, the optimizer or the checkpointer.
    ///
    /// # Panics
    ///
    /// Panics with `CONFIG ERROR` if the algorithm cannot solve task batches
    /// or answers with an implicit adaptation.
    pub fn run<I>(&mut self, episodes: I, mode: RunMode, options: RunOptions) -> Result<RunResult>
    where
        I: IntoIterator,
        I::Item: Into<Episode<B>>,
    {
        if !self.algorithm.supports_batched() {
            panic!("CONFIG ERROR: episodic classical training needs an algorithm that solves task batches");
        }
        let schema = MetricSchema::new(self.algorithm.is_classification(), false);
        let eval_algorithm = match mode {
            RunMode::Train => None,
            RunMode::Eval => Some(self.algorithm.clone().no_grad()),
        };
        info!(mode = ?mode, epoch = options.epoch, "meta-classical run");

        let mut state = RunState::new();
        let mut index = options.start;
        for episode in episodes {
            if options.reached_stop(mode, index) {
                break;
            }
            let tasks = match episode.into() {
                Episode::Raw(batch) => split_episode(&batch, &self.config.episode),
                Episode::Split(tasks) => tasks,
            };

            let algorithm = eval_algorithm.as_ref().unwrap_or(&self.algorithm);
            let scale = algorithm.backbone_scale();
            let (logits, trajectory) = match algorithm.inner_loop_adapt(&tasks, scale.clone(), mode) {
                Adaptation::Direct { logits, trajectory } => (logits, trajectory),
                Adaptation::Implicit(_) => {
                    panic!("CONFIG ERROR: implicit adaptations cannot be trained episode-batched")
                }
            };
            schema.check(trajectory.keys(), "inner trajectory");

            let [t, q, n_way] = logits.dims();
            let logits = apply_scale(logits.reshape([t * q, n_way]), scale);
            let targets = tasks.flat_query_labels();
            let loss = outer_loss(self.config.outer_loss, logits.clone(), &targets);
            let per_task = per_task_accuracy(logits, &tasks.query_y);

            let mut measurements = Measurements::new();
            measurements.insert(MetricKey::Loss, vec![scalar(loss.clone())]);
            if schema.classification {
                measurements.insert(MetricKey::Accu, vec![average(&per_task)]);
            }
            let trajectories: Trajectories =
                trajectory.into_iter().map(|(k, v)| (k, vec![v])).collect();
            update_sum(&mut state.test, &measurements);
            state.test.count += 1;
            update_sum_trajectory(&mut state.train, &trajectories);
            state.train.count += 1;
            state
                .task_accuracies
                .extend(per_task.iter().map(|accu| accu * 100.0));

            if mode.is_train() {
                for (key, values) in &measurements {
                    self.window.push(&format!("outer_{}", key), values[0]);
                }
                for (key, values) in &trajectories {
                    if let Some(post) = values[0].last() {
                        self.window.push(&format!("inner_{}_post", key), *post);
                    }
                }

                let grads = GradientsParams::from_grads(loss.backward(), &self.algorithm);
                let (grads, norm) = clip_grad_norm(&self.algorithm, grads, self.config.grad_clip);
                self.sink
                    .add_scalar("meta_classical/grad_norm/before_clip", norm, index);
                self.algorithm =
                    self.optimizer
                        .step(self.config.learning_rate, self.algorithm.clone(), grads);

                if self.config.log_interval > 0 && index % self.config.log_interval == 0 {
                    self.flush_window(index);
                }
            }
            state.batches += 1;
            state.iteration = index;
            index += 1;
        }

        let mut result = RunResult {
            batches: state.batches,
            last_iteration: state.iteration,
            ..RunResult::default()
        };
        if mode.is_train() {
            if !self.window.is_empty() {
                self.flush_window(state.iteration);
            }
            for (name, value) in self.window.epoch_summary() {
                self.sink
                    .add_scalar(&format!("meta_classical/{}", name), value, options.epoch);
                result.epoch_metrics.insert(name, value);
            }
        } else {
            result.val_task_acc = ConfidenceInterval::from_accuracies(&state.task_accuracies);
            if let Some(ci) = result.val_task_acc {
                info!(val_task_acc = %ci, tasks = ci.n, "evaluation finished");
            }
        }
        result.train = state.train.into_mean();
        result.test = state.test.into_mean();

        let schedule = CheckpointSchedule::Epochal {
            every: self.config.save_every_epochs,
        };
        if mode.is_train() && schedule.should_save(options.epoch) {
            self.checkpointer.save_module(options.epoch, &self.algorithm)?;
            self.checkpointer
                .save_record(options.epoch, "optim", self.optimizer.to_record())?;
        }
        Ok(result)
    }

    fn flush_window(&mut self, step: usize) {
        for (name, mean) in self.window.flush() {
            self.sink
                .add_scalar(&format!("meta_classical/{}", name), mean, step);
            debug!(step, metric = %name, value = mean, "window");
        }
    }
}

impl<B, A, O, S, C, I> Trainer<I> for MetaClassicalTrainer<B, A, O, S, C>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B>,
    O: Optimizer<A, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
    I: IntoIterator,
    I::Item: Into<Episode<B>>,
{
    fn strategy(&self) -> TrainerStrategy {
        TrainerStrategy::episodic(BatchingMode::Batched)
    }

    fn run(&mut self, source: I, mode: RunMode, options: RunOptions) -> Result<RunResult> {
        MetaClassicalTrainer::run(self, source, mode, options)
    }
}
