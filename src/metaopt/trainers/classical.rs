//! Classical (non-episodic) trainer.
//!
//! Plain empirical-risk minimisation over labeled batches with an optional
//! auxiliary objective, a gradient-moment diagnostic mode and a post-hoc
//! fine-tuning pass over concatenated episode data.

use std::marker::PhantomData;

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info};

use super::checkpoint::{CheckpointSchedule, Checkpointer};
use super::config::{ClassicalTrainerConfig, FineTuneConfig, TrainerStrategy};
use super::contract::{AuxObjective, FeatureClassifier, RunMode};
use super::episode::{raw_partitions, LabeledBatch};
use super::grad::{clip_grad_norm, GradientMoments, MomentReport};
use super::loss_utils::{accuracy, rebase_labels, scalar, smooth_cross_entropy};
use super::measurements::{update_sum, Measurements, MetricKey, MetricSchema, MetricWindow};
use super::run::{Episode, RunOptions, RunResult, RunState, Trainer};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

/// Concatenated shots and queries of a fine-tuning source, labels rebased.
#[derive(Debug, Clone)]
pub struct FineTuneSets<B: AutodiffBackend> {
    pub shots: LabeledBatch<B>,
    pub queries: LabeledBatch<B>,
}

pub struct ClassicalTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    model: M,
    optimizer: O,
    config: ClassicalTrainerConfig,
    sink: S,
    checkpointer: C,
    aux: Option<Box<dyn AuxObjective<B>>>,
    gamma: f64,
    window: MetricWindow,
    phantom: PhantomData<B>,
}

impl<B, M, O, S, C> ClassicalTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    pub fn new(model: M, optimizer: O, config: ClassicalTrainerConfig, sink: S, checkpointer: C) -> Self {
        let gamma = config.aux_gamma;
        Self {
            model,
            optimizer,
            config,
            sink,
            checkpointer,
            aux: None,
            gamma,
            window: MetricWindow::new(),
            phantom: PhantomData,
        }
    }

    /// Add an auxiliary objective weighted by the current gamma.
    pub fn with_aux_objective(mut self, aux: impl AuxObjective<B> + 'static) -> Self {
        self.aux = Some(Box::new(aux));
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// One pass over `batches`.
    ///
    /// In train mode the auxiliary weight grows by 1% (capped at 0.5) before
    /// the pass. With `options.grad_analysis` the optimizer is never stepped;
    /// moments of the clipped gradients over the non-head parameters are
    /// reported instead.
    /// A checkpoint is written after training epochs that are a multiple of
    /// `save_every_epochs`.
    pub fn run<I>(&mut self, batches: I, mode: RunMode, options: RunOptions) -> Result<RunResult>
    where
        I: IntoIterator<Item = LabeledBatch<B>>,
    {
        let schema = MetricSchema::new(true, self.aux.is_some());
        let analysis = mode.is_train() && options.grad_analysis;
        if mode.is_train() && self.aux.is_some() {
            self.gamma = (self.gamma * 1.01).min(0.5);
        }
        let mut moments = analysis.then(|| {
            GradientMoments::new::<B, M>(
                &self.model,
                TrainerStrategy::classical().moment_exclusions(self.model.head_param_ids()),
            )
        });
        let eval_model = match mode {
            RunMode::Train => None,
            RunMode::Eval => Some(self.model.clone().no_grad()),
        };
        info!(
            mode = ?mode,
            epoch = options.epoch,
            gamma = self.gamma,
            grad_analysis = analysis,
            "classical run"
        );

        let mut state = RunState::new();
        let mut index = options.start;
        for batch in batches {
            if options.reached_stop(mode, index) {
                break;
            }
            let targets = rebase_labels(&batch.y, self.config.label_offset);
            let model = eval_model.as_ref().unwrap_or(&self.model);
            let features = model.features(batch.x);
            let logits = model.classify(features.clone());
            let loss = smooth_cross_entropy(logits.clone(), &targets, self.config.smoothing_eps);

            let mut measurements = Measurements::new();
            measurements.insert(MetricKey::Loss, vec![scalar(loss.clone())]);
            measurements.insert(MetricKey::Accu, vec![accuracy(logits, &targets)]);

            let gap = self.config.aux_update_gap.max(1);
            let objective = match self.aux.as_ref() {
                Some(aux) if index % gap == 0 => {
                    let aux_loss = aux.loss(features, &targets);
                    measurements.insert(MetricKey::AuxLoss, vec![scalar(aux_loss.clone())]);
                    loss + aux_loss.mul_scalar(self.gamma)
                }
                _ => loss,
            };
            schema.check(measurements.keys(), "classical step");

            update_sum(&mut state.test, &measurements);
            state.test.count += 1;
            for (key, values) in &measurements {
                let name = match key {
                    MetricKey::Loss => "cross_ent",
                    other => other.as_str(),
                };
                self.window.push(name, values[0]);
            }

            if mode.is_train() {
                let grads = GradientsParams::from_grads(objective.backward(), &self.model);
                let (grads, norm) = clip_grad_norm(&self.model, grads, self.config.grad_clip);
                match moments.as_mut() {
                    Some(moments) => {
                        moments.accumulate::<B, M>(&self.model, &grads);
                    }
                    None => {
                        self.sink.add_scalar("classical/grad_norm/before_clip", norm, index);
                        self.model = self.optimizer.step(
                            self.config.learning_rate,
                            self.model.clone(),
                            grads,
                        );
                    }
                }
            }

            if self.config.log_interval > 0 && index % self.config.log_interval == 0 {
                self.flush_window(index);
            }
            state.batches += 1;
            state.iteration = index;
            index += 1;
        }
        if !self.window.is_empty() {
            self.flush_window(state.iteration);
        }

        let mut result = RunResult {
            batches: state.batches,
            last_iteration: state.iteration,
            ..RunResult::default()
        };
        for (name, value) in self.window.epoch_summary() {
            self.sink
                .add_scalar(&format!("classical/{}", name), value, options.epoch);
            result.epoch_metrics.insert(name, value);
        }
        result.test = state.test.into_mean();

        if let Some(mut moments) = moments {
            if moments.batches() > 0 {
                let report = moments.finalize();
                self.report_moments(&report, options.epoch);
                result.gradient_moments = Some(report);
            }
        }

        let schedule = CheckpointSchedule::Epochal {
            every: self.config.save_every_epochs,
        };
        if mode.is_train() && !analysis && schedule.should_save(options.epoch) {
            self.checkpointer.save_module(options.epoch, &self.model)?;
            self.checkpointer
                .save_record(options.epoch, "optim", self.optimizer.to_record())?;
        }
        Ok(result)
    }

    fn flush_window(&mut self, step: usize) {
        for (name, mean) in self.window.flush() {
            self.sink.add_scalar(&format!("classical/{}", name), mean, step);
            debug!(step, metric = %name, value = mean, "window");
        }
    }

    fn report_moments(&mut self, report: &MomentReport, epoch: usize) {
        for (name, value) in report.scalars() {
            self.sink
                .add_scalar(&format!("grad_analysis/{}", name), value, epoch);
        }
        info!(
            epoch,
            srm_g = report.srm_g,
            mean_g_norm = report.mean_g_norm,
            var_g = report.var_g,
            uncertainty = report.uncertainty,
            batches = report.batches,
            "gradient analysis"
        );
    }

    /// Fine-tune on every shot of an evaluation source.
    ///
    /// All episodes are partitioned with their raw labels, rebased by
    /// `label_offset` and concatenated. Each epoch then walks the per-episode
    /// shot sets as mini-batches. Returns the tuned model and the
    /// concatenated sets, ready for [`super::episode::TaskBatch::from_fixed_sets`].
    ///
    /// # Panics
    ///
    /// Panics with `LABEL ERROR` if a rebased label falls outside
    /// `0..n_classes`, or if the source yields no episodes.
    pub fn fine_tune<I>(&mut self, episodes: I, config: &FineTuneConfig) -> (M, FineTuneSets<B>)
    where
        I: IntoIterator,
        I::Item: Into<Episode<B>>,
    {
        let mut shot_sets = Vec::new();
        let mut query_sets = Vec::new();
        for episode in episodes {
            let (shots, queries) = match episode.into() {
                Episode::Raw(batch) => raw_partitions(&batch, &config.episode),
                Episode::Split(_) => {
                    panic!("LABEL ERROR: fine-tuning needs raw episodes, got relabelled tasks")
                }
            };
            shot_sets.push(rebased(shots, config));
            query_sets.push(rebased(queries, config));
        }
        let (Some(shots), Some(queries)) = (
            LabeledBatch::concat(shot_sets.clone()),
            LabeledBatch::concat(query_sets),
        ) else {
            panic!("LABEL ERROR: fine-tuning source yielded no episodes");
        };
        info!(
            shots = shots.len(),
            queries = queries.len(),
            epochs = config.epochs,
            "fine-tuning"
        );

        let mut window = MetricWindow::new();
        let mut step = 0;
        for _epoch in 0..config.epochs {
            for batch in &shot_sets {
                step += 1;
                let logits = self.model.forward(batch.x.clone());
                let loss = smooth_cross_entropy(logits.clone(), &batch.y, 0.0);
                window.push("train_loss", scalar(loss.clone()));
                window.push("train_acc", accuracy(logits, &batch.y));

                let grads = GradientsParams::from_grads(loss.backward(), &self.model);
                let (grads, _) = clip_grad_norm(&self.model, grads, config.grad_clip);
                self.model = self
                    .optimizer
                    .step(config.learning_rate, self.model.clone(), grads);

                if config.log_interval > 0 && step % config.log_interval == 0 {
                    for (name, mean) in window.flush() {
                        self.sink.add_scalar(&format!("fine_tune/{}", name), mean, step);
                    }
                }
            }
        }
        for (name, mean) in window.flush() {
            self.sink.add_scalar(&format!("fine_tune/{}", name), mean, step);
        }

        (self.model.clone(), FineTuneSets { shots, queries })
    }
}

fn rebased<B: AutodiffBackend>(batch: LabeledBatch<B>, config: &FineTuneConfig) -> LabeledBatch<B> {
    let y = rebase_labels(&batch.y, config.label_offset);
    if let Some(label) = y.iter().find(|l| **l < 0 || **l as usize >= config.n_classes) {
        panic!(
            "LABEL ERROR: rebased label {} outside 0..{} (offset {})",
            label, config.n_classes, config.label_offset
        );
    }
    LabeledBatch { x: batch.x, y }
}

impl<B, M, O, S, C, I> Trainer<I> for ClassicalTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
    I: IntoIterator<Item = LabeledBatch<B>>,
{
    fn strategy(&self) -> TrainerStrategy {
        TrainerStrategy::classical()
    }

    fn run(&mut self, source: I, mode: RunMode, options: RunOptions) -> Result<RunResult> {
        ClassicalTrainer::run(self, source, mode, options)
    }
}
