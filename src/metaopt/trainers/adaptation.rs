//! Test-time adaptation with an auxiliary objective.
//!
//! For every task batch the algorithm is copied, the copy takes a few
//! optimizer steps on an auxiliary objective over the support features, and
//! the adapted copy is then evaluated on the query sets. The original
//! algorithm and a fresh optimizer are used for the next batch.

use std::marker::PhantomData;

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use tracing::info;

use super::config::AdaptationConfig;
use super::contract::{
    Adaptation, AuxObjective, InnerLoopAlgorithm, RunMode, SupportEmbedding, Trajectory,
};
use super::episode::{split_episode, TaskBatch};
use super::loss_utils::{accuracy, apply_scale, cross_entropy, scalar};
use super::measurements::{
    update_sum, update_sum_trajectory, ConfidenceInterval, Measurements, MetricKey, MetricSchema,
    Trajectories,
};
use super::run::{Episode, RunOptions, RunResult, RunState};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

pub struct AdaptationTrainer<B, A, O, F, S>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B> + SupportEmbedding<B>,
    O: Optimizer<A, B>,
    F: Fn() -> O,
    S: MetricsSink,
{
    algorithm: A,
    make_optimizer: F,
    aux: Box<dyn AuxObjective<B>>,
    config: AdaptationConfig,
    sink: S,
    phantom: PhantomData<O>,
}

impl<B, A, O, F, S> AdaptationTrainer<B, A, O, F, S>
where
    B: AutodiffBackend,
    A: InnerLoopAlgorithm<B> + SupportEmbedding<B>,
    O: Optimizer<A, B>,
    F: Fn() -> O,
    S: MetricsSink,
{
    pub fn new(
        algorithm: A,
        make_optimizer: F,
        aux: impl AuxObjective<B> + 'static,
        config: AdaptationConfig,
        sink: S,
    ) -> Self {
        Self {
            algorithm,
            make_optimizer,
            aux: Box::new(aux),
            config,
            sink,
            phantom: PhantomData,
        }
    }

    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Auxiliary steps on a copy of the algorithm. Returns the copy and the
    /// auxiliary loss before each step.
    pub fn adapt_copy(&self, tasks: &TaskBatch<B>) -> (A, Vec<f64>) {
        let mut adapted = self.algorithm.clone();
        let mut optimizer = (self.make_optimizer)();
        // Keep classes of different tasks apart.
        let labels: Vec<i64> = tasks
            .support_y
            .iter()
            .enumerate()
            .flat_map(|(t, labels)| {
                let offset = (t * tasks.n_way) as i64;
                labels.iter().map(move |l| l + offset)
            })
            .collect();

        let mut losses = Vec::with_capacity(self.config.aux_steps);
        for _ in 0..self.config.aux_steps {
            let loss = self.aux.loss(adapted.embed_support(tasks), &labels);
            losses.push(scalar(loss.clone()));
            let grads = GradientsParams::from_grads(loss.backward(), &adapted);
            adapted = optimizer.step(self.config.aux_learning_rate, adapted, grads);
        }
        (adapted, losses)
    }

    /// Evaluate with auxiliary adaptation. Always an eval run.
    pub fn run<I>(&mut self, episodes: I, options: RunOptions) -> Result<RunResult>
    where
        I: IntoIterator,
        I::Item: Into<Episode<B>>,
    {
        let schema = MetricSchema::new(self.algorithm.is_classification(), true);
        info!(
            aux = self.aux.name(),
            steps = self.config.aux_steps,
            "adaptation run"
        );
        let mut state = RunState::new();
        let mut index = options.start;

        for episode in episodes {
            let tasks = match episode.into() {
                Episode::Raw(batch) => split_episode(&batch, &self.config.episode),
                Episode::Split(tasks) => tasks,
            };
            let (adapted, aux_losses) = self.adapt_copy(&tasks);
            let adapted = adapted.no_grad();
            let scale = adapted
                .backbone_scale()
                .unwrap_or_else(|| Tensor::ones([1], &tasks.device()));

            let mut trajectories = Trajectories::new();
            let mut test = Measurements::new();
            let singles: Vec<TaskBatch<B>> = if adapted.supports_batched() {
                vec![tasks.clone()]
            } else {
                (0..tasks.num_tasks()).map(|t| tasks.task(t)).collect()
            };
            for part in &singles {
                let adaptation = adapted.inner_loop_adapt(part, Some(scale.clone()), RunMode::Eval);
                let mut trajectory: Trajectory = adaptation.trajectory().clone();
                trajectory.insert(MetricKey::AuxLoss, aux_losses.clone());
                for (key, values) in trajectory {
                    trajectories.entry(key).or_default().push(values);
                }
                let logits = match adaptation {
                    Adaptation::Direct { logits, .. } => {
                        let [t, q, n_way] = logits.dims();
                        logits.reshape([t * q, n_way])
                    }
                    Adaptation::Implicit(implicit) => implicit
                        .query_features
                        .matmul(implicit.weights.transpose()),
                };
                let logits = apply_scale(logits, Some(scale.clone()));
                let q = part.query_len();
                for (t, targets) in part.query_y.iter().enumerate() {
                    let task_logits = logits.clone().narrow(0, t * q, q);
                    let accu = accuracy(task_logits.clone(), targets);
                    test.entry(MetricKey::Loss)
                        .or_default()
                        .push(scalar(cross_entropy(task_logits, targets)));
                    if schema.classification {
                        test.entry(MetricKey::Accu).or_default().push(accu);
                    }
                    state.task_accuracies.push(accu * 100.0);
                }
            }
            schema.check(trajectories.keys(), "adaptation trajectory");
            schema.check(test.keys(), "adaptation query");

            let tasks_seen = tasks.num_tasks();
            update_sum(&mut state.test, &test);
            state.test.count += tasks_seen;
            // Trajectories are per adaptation call, aux losses per batch.
            update_sum_trajectory(&mut state.train, &trajectories);
            state.train.count += singles.len();
            if let Some(last) = aux_losses.last() {
                self.sink.add_scalar("adaptation/aux_loss", *last, index);
            }
            state.batches += 1;
            state.iteration = index;
            index += 1;
        }

        let val_task_acc = ConfidenceInterval::from_accuracies(&state.task_accuracies);
        if let Some(ci) = val_task_acc {
            self.sink
                .add_scalar("adaptation/val_task_acc", ci.mean, options.start);
            info!(val_task_acc = %ci, tasks = ci.n, "adaptation finished");
        }
        Ok(RunResult {
            train: state.train.into_mean(),
            test: state.test.into_mean(),
            val_task_acc,
            batches: state.batches,
            last_iteration: state.iteration,
            ..RunResult::default()
        })
    }
}
