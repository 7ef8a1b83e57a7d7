//! Episodic meta-trainer.
//!
//! One run walks the episode iterator through
//! `FETCH_BATCH -> SPLIT_EPISODE -> ADAPT -> OUTER_LOSS -> BACKPROP ->
//! AGGREGATE -> CLIP_AND_STEP -> CHECKPOINT -> LOG`, with everything after
//! `AGGREGATE` skipped in eval mode.

use std::marker::PhantomData;

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use tracing::{debug, info};

use super::checkpoint::{CheckpointSchedule, Checkpointer};
use super::config::{BatchingMode, MetaTrainerConfig, OuterLoss, TrainerStrategy};
use super::contract::{Adaptation, ImplicitAdaptation, InnerLoopAlgorithm, RunMode};
use super::episode::{split_episode, TaskBatch};
use super::grad::{accumulate_gradients, clip_grad_norm};
use super::loss_utils::{apply_scale, outer_loss, scalar};
use super::measurements::{
    update_sum, update_sum_trajectory, ConfidenceInterval, Measurements, MetricKey, MetricSchema,
    RunningAggregate, Trajectories,
};
use super::run::{Episode, RunOptions, RunResult, RunState, Trainer};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

/// Everything one batch contributes.
struct StepOutcome<B: AutodiffBackend> {
    trajectories: Trajectories,
    test: Measurements,
    /// Tasks (per-task mode) or 1 (batched mode).
    count: usize,
    task_accuracies: Vec<f64>,
    /// Batch-mean outer objective, tracked in train mode.
    objective: Option<Tensor<B, 1>>,
}

pub struct MetaTrainer<B, A, O, S, C>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B>,
    O: Optimizer<A, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    algorithm: A,
    optimizer: O,
    config: MetaTrainerConfig,
    sink: S,
    checkpointer: C,
    learning_rate: f64,
    pending: Option<GradientsParams>,
    phantom: PhantomData<B>,
}

impl<B, A, O, S, C> MetaTrainer<B, A, O, S, C>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B>,
    O: Optimizer<A, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    pub fn new(algorithm: A, optimizer: O, config: MetaTrainerConfig, sink: S, checkpointer: C) -> Self {
        let learning_rate = config.learning_rate;
        Self {
            algorithm,
            optimizer,
            config,
            sink,
            checkpointer,
            learning_rate,
            pending: None,
            phantom: PhantomData,
        }
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    pub fn config(&self) -> &MetaTrainerConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn into_algorithm(self) -> A {
        self.algorithm
    }

    fn schema(&self) -> MetricSchema {
        MetricSchema::new(self.algorithm.is_classification(), false)
    }

    /// Drive one run over `episodes`.
    ///
    /// Training stops before fetching iteration `options.stop`; both modes
    /// stop when the iterator is exhausted. The returned aggregates are the
    /// whole-run means over processed tasks (per-task mode) or batches
    /// (batched mode).
    ///
    /// # Errors
    ///
    /// Checkpoint write failures are returned as they happen.
    pub fn run<I>(&mut self, episodes: I, mode: RunMode, options: RunOptions) -> Result<RunResult>
    where
        I: IntoIterator,
        I::Item: Into<Episode<B>>,
    {
        let schema = self.schema();
        let schedule = CheckpointSchedule::Episodic {
            every: self.config.save_interval,
        };
        // Eval runs use a tape-free copy of the algorithm.
        let eval_algorithm = match mode {
            RunMode::Train => None,
            RunMode::Eval => Some(self.algorithm.clone().no_grad()),
        };
        info!(
            mode = ?mode,
            start = options.start,
            stop = ?options.stop,
            batching = ?self.config.batching,
            "meta-trainer run"
        );

        let mut state = RunState::new();
        let mut episodes = episodes.into_iter();
        let mut index = options.start;

        loop {
            if options.reached_stop(mode, index) {
                debug!(index, "stop bound reached");
                break;
            }
            let Some(episode) = episodes.next() else {
                break;
            };
            let tasks = match episode.into() {
                Episode::Raw(batch) => split_episode(&batch, &self.config.episode),
                Episode::Split(tasks) => tasks,
            };

            let outcome = {
                let algorithm = eval_algorithm.as_ref().unwrap_or(&self.algorithm);
                self.adapt_batch(algorithm, &tasks, mode, schema)
            };

            schema.check(outcome.trajectories.keys(), "inner trajectory");
            for aggregate in [&mut state.train, &mut state.window_train] {
                update_sum_trajectory(aggregate, &outcome.trajectories);
                aggregate.count += outcome.count;
            }
            for aggregate in [&mut state.test, &mut state.window_test] {
                update_sum(aggregate, &outcome.test);
                aggregate.count += outcome.count;
            }
            state.task_accuracies.extend(outcome.task_accuracies);
            state.batches += 1;
            state.iteration = index;

            if let Some(objective) = outcome.objective {
                self.backward_and_step(index, objective);

                if schedule.should_save(index) {
                    self.checkpointer.save_module(index, &self.algorithm)?;
                    self.checkpointer
                        .save_record(index, "optim", self.optimizer.to_record())?;
                }
                if self.config.log_interval > 0 && index % self.config.log_interval == 0 {
                    self.log_window(&mut state, index);
                }
            }
            index += 1;
        }

        Ok(self.finish(state, mode, options))
    }

    fn adapt_batch(
        &self,
        algorithm: &A,
        tasks: &TaskBatch<B>,
        mode: RunMode,
        schema: MetricSchema,
    ) -> StepOutcome<B> {
        let scale = algorithm.backbone_scale();
        match self.config.batching {
            BatchingMode::Batched => {
                if !algorithm.supports_batched() {
                    panic!("CONFIG ERROR: algorithm cannot solve task batches, use per-task batching");
                }
                self.adapt_batched(algorithm, tasks, scale, mode, schema)
            }
            BatchingMode::PerTask => self.adapt_per_task(algorithm, tasks, scale, mode, schema),
        }
    }

    fn adapt_batched(
        &self,
        algorithm: &A,
        tasks: &TaskBatch<B>,
        scale: Option<Tensor<B, 1>>,
        mode: RunMode,
        schema: MetricSchema,
    ) -> StepOutcome<B> {
        let adaptation = algorithm.inner_loop_adapt(tasks, scale.clone(), mode);
        let (logits, trajectory) = match adaptation {
            Adaptation::Direct { logits, trajectory } => (logits, trajectory),
            Adaptation::Implicit(_) => {
                panic!("CONFIG ERROR: implicit adaptations require per-task batching")
            }
        };
        let [t, q, n_way] = logits.dims();
        let logits = apply_scale(logits.reshape([t * q, n_way]), scale);
        let targets = tasks.flat_query_labels();
        let loss = outer_loss(self.config.outer_loss, logits.clone(), &targets);

        let per_task = per_task_accuracy(logits, &tasks.query_y);
        let mut test = Measurements::new();
        test.insert(MetricKey::Loss, vec![scalar(loss.clone())]);
        if schema.classification {
            let mean = per_task.iter().sum::<f64>() / per_task.len().max(1) as f64;
            test.insert(MetricKey::Accu, vec![mean]);
        }

        StepOutcome {
            trajectories: trajectory.into_iter().map(|(k, v)| (k, vec![v])).collect(),
            test,
            count: 1,
            task_accuracies: per_task.into_iter().map(|a| a * 100.0).collect(),
            objective: mode.is_train().then_some(loss),
        }
    }

    fn adapt_per_task(
        &self,
        algorithm: &A,
        tasks: &TaskBatch<B>,
        scale: Option<Tensor<B, 1>>,
        mode: RunMode,
        schema: MetricSchema,
    ) -> StepOutcome<B> {
        let batch_size = tasks.num_tasks();
        let mut trajectories = Trajectories::new();
        let mut test = Measurements::new();
        let mut task_accuracies = Vec::with_capacity(batch_size);
        let mut objective: Option<Tensor<B, 1>> = None;

        for index in 0..batch_size {
            let task = tasks.task(index);
            let targets = &task.query_y[0];
            let adaptation = algorithm.inner_loop_adapt(&task, scale.clone(), mode);
            for (key, values) in adaptation.trajectory() {
                trajectories.entry(*key).or_default().push(values.clone());
            }

            let (logits, correction) = match adaptation {
                Adaptation::Direct { logits, .. } => {
                    let [_, q, n_way] = logits.dims();
                    (apply_scale(logits.reshape([q, n_way]), scale.clone()), None)
                }
                Adaptation::Implicit(implicit) => {
                    let logits = apply_scale(
                        implicit
                            .query_features
                            .clone()
                            .matmul(implicit.weights.clone().transpose()),
                        scale.clone(),
                    );
                    let correction = mode.is_train().then(|| {
                        implicit_correction(&implicit, scale.clone(), targets, self.config.outer_loss)
                    });
                    (logits, correction)
                }
            };

            let loss = outer_loss(self.config.outer_loss, logits.clone(), targets);
            let accu = per_task_accuracy(logits, &task.query_y)[0];
            test.entry(MetricKey::Loss).or_default().push(scalar(loss.clone()));
            if schema.classification {
                test.entry(MetricKey::Accu).or_default().push(accu);
            }
            task_accuracies.push(accu * 100.0);

            if mode.is_train() {
                let contribution = match correction {
                    Some(correction) => loss + correction,
                    None => loss,
                }
                .div_scalar(batch_size as f64);
                objective = Some(match objective {
                    Some(total) => total + contribution,
                    None => contribution,
                });
            }
        }

        StepOutcome {
            trajectories,
            test,
            count: batch_size,
            task_accuracies,
            objective,
        }
    }

    /// BACKPROP, then CLIP_AND_STEP at the optimizer cadence.
    fn backward_and_step(&mut self, index: usize, objective: Tensor<B, 1>) {
        let grads = GradientsParams::from_grads(objective.backward(), &self.algorithm);
        let total = accumulate_gradients(&self.algorithm, self.pending.take(), grads);

        let interval = self.config.optimizer_update_interval.max(1);
        if index % interval != 0 {
            self.pending = Some(total);
            return;
        }
        let (grads, norm) = clip_grad_norm(&self.algorithm, total, self.config.grad_clip);
        self.sink
            .add_scalar("outer_grad/model_norm/before_clip", norm, index);
        self.algorithm = self
            .optimizer
            .step(self.learning_rate, self.algorithm.clone(), grads);
    }

    fn log_window(&mut self, state: &mut RunState, index: usize) {
        let (train, test) = state.take_window();
        let train = train.into_mean();
        let test = test.into_mean();
        emit(&mut self.sink, "meta_train", &train, &test, index);
        info!(
            iteration = index,
            loss = test.scalars.get(&MetricKey::Loss).copied().unwrap_or_default(),
            accu = test.scalars.get(&MetricKey::Accu).copied().unwrap_or_default(),
            "meta-train window"
        );
    }

    fn finish(&mut self, state: RunState, mode: RunMode, options: RunOptions) -> RunResult {
        let train = state.train.into_mean();
        let test = state.test.into_mean();
        let val_task_acc = match mode {
            RunMode::Eval => ConfidenceInterval::from_accuracies(&state.task_accuracies),
            RunMode::Train => None,
        };

        if mode == RunMode::Eval && options.meta_val {
            emit(&mut self.sink, "meta_val", &train, &test, options.start);
            if let Some(ci) = val_task_acc {
                self.sink.add_scalar("meta_val/val_task_acc", ci.mean, options.start);
            }
        }
        if let Some(ci) = val_task_acc {
            info!(val_task_acc = %ci, tasks = ci.n, "evaluation finished");
        }

        RunResult {
            train,
            test,
            val_task_acc,
            batches: state.batches,
            last_iteration: state.iteration,
            ..RunResult::default()
        }
    }
}

impl<B, A, O, S, C, I> Trainer<I> for MetaTrainer<B, A, O, S, C>
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
        TrainerStrategy::episodic(self.config.batching)
    }

    fn run(&mut self, source: I, mode: RunMode, options: RunOptions) -> Result<RunResult> {
        MetaTrainer::run(self, source, mode, options)
    }
}

/// Emit `<namespace>/train_<key>_post` and `<namespace>/test_<key>_post`.
fn emit<S: MetricsSink>(
    sink: &mut S,
    namespace: &str,
    train: &RunningAggregate,
    test: &RunningAggregate,
    step: usize,
) {
    for (key, trajectory) in &train.trajectories {
        if let Some(post) = trajectory.last() {
            sink.add_scalar(&format!("{}/train_{}_post", namespace, key), *post, step);
        }
    }
    for (key, value) in &test.scalars {
        sink.add_scalar(&format!("{}/test_{}_post", namespace, key), *value, step);
    }
}

/// Query accuracy of each task from task-major flat logits `[T * Q, n_way]`.
pub(super) fn per_task_accuracy<B: AutodiffBackend>(logits: Tensor<B, 2>, query_y: &[Vec<i64>]) -> Vec<f64> {
    let [rows, _] = logits.dims();
    let predictions: Vec<i64> = logits
        .argmax(1)
        .reshape([rows])
        .to_data()
        .iter::<i64>()
        .collect();
    let mut offset = 0;
    query_y
        .iter()
        .map(|targets| {
            let hits = predictions[offset..offset + targets.len()]
                .iter()
                .zip(targets)
                .filter(|(p, t)| p == t)
                .count();
            offset += targets.len();
            hits as f64 / targets.len().max(1) as f64
        })
        .collect()
}

/// Surrogate whose gradient in the support features is the implicit outer
/// gradient `-mixed(H^{-1} dL/dW*)`.
fn implicit_correction<B: AutodiffBackend>(
    implicit: &ImplicitAdaptation<B>,
    scale: Option<Tensor<B, 1>>,
    targets: &[i64],
    kind: OuterLoss,
) -> Tensor<B, 1> {
    let weights = implicit.weights.clone().detach().require_grad();
    let logits = apply_scale(
        implicit
            .query_features
            .clone()
            .detach()
            .matmul(weights.clone().transpose()),
        scale.map(|factor| factor.detach()),
    );
    let grads = outer_loss(kind, logits, targets).backward();
    let weight_grad = weights
        .grad(&grads)
        .map(Tensor::<B, 2>::from_inner)
        .unwrap_or_else(|| weights.zeros_like());

    let upstream = (implicit.mixed_partial_multiply)((implicit.hessian_inverse_multiply)(
        weight_grad,
    ))
    .neg()
    .detach();
    (implicit.support_features.clone() * upstream).sum()
}
