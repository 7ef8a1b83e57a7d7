//! Min-max trainer: a feature generator plays against the classifier.
//!
//! Before a training epoch the generator's class statistics are estimated
//! in two deterministic passes over the source (means, then standard
//! deviations). Each batch then takes a generator step that ascends the
//! classification loss with the model's features detached, followed by a
//! model step that descends it with the generated features detached. Each
//! optimizer only ever sees gradients of its own parameters. Both players
//! use the label-smoothed loss. In gradient-analysis mode neither player
//! steps; moments of the clipped model gradients are reported instead.

use std::marker::PhantomData;

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use tracing::{debug, info};

use super::checkpoint::{CheckpointSchedule, Checkpointer};
use super::config::{MinMaxTrainerConfig, TrainerStrategy};
use super::contract::{FeatureGenerator, GeneratorConditioned, RunMode};
use super::episode::LabeledBatch;
use super::grad::{clip_grad_norm, GradientMoments, MomentReport};
use super::loss_utils::{accuracy, rebase_labels, scalar, smooth_cross_entropy};
use super::measurements::{update_sum, Measurements, MetricKey, MetricSchema, MetricWindow};
use super::run::{RunOptions, RunResult, RunState, Trainer};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

pub struct MinMaxTrainer<B, M, G, OM, OG, S, C>
where
    B: AutodiffBackend,
    M: GeneratorConditioned<B>,
    G: FeatureGenerator<B>,
    OM: Optimizer<M, B>,
    OG: Optimizer<G, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    model: M,
    generator: G,
    model_optimizer: OM,
    generator_optimizer: OG,
    config: MinMaxTrainerConfig,
    sink: S,
    checkpointer: C,
    window: MetricWindow,
    phantom: PhantomData<B>,
}

impl<B, M, G, OM, OG, S, C> MinMaxTrainer<B, M, G, OM, OG, S, C>
where
    B: AutodiffBackend,
    M: GeneratorConditioned<B>,
    G: FeatureGenerator<B>,
    OM: Optimizer<M, B>,
    OG: Optimizer<G, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    pub fn new(
        model: M,
        generator: G,
        model_optimizer: OM,
        generator_optimizer: OG,
        config: MinMaxTrainerConfig,
        sink: S,
        checkpointer: C,
    ) -> Self {
        Self {
            model,
            generator,
            model_optimizer,
            generator_optimizer,
            config,
            sink,
            checkpointer,
            window: MetricWindow::new(),
            phantom: PhantomData,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    /// Two no-grad passes: class means first, then standard deviations.
    pub fn estimate_statistics<I>(&mut self, source: I)
    where
        I: IntoIterator<Item = LabeledBatch<B>> + Clone,
    {
        let model = self.model.clone().no_grad();
        self.generator.reset_statistics();
        let mut samples = 0;
        for batch in source.clone() {
            let targets = rebase_labels(&batch.y, self.config.label_offset);
            samples += targets.len();
            self.generator
                .update_mean(model.features(batch.x).detach(), &targets);
        }
        self.generator.finalize_mean();
        for batch in source {
            let targets = rebase_labels(&batch.y, self.config.label_offset);
            self.generator
                .update_stddev(model.features(batch.x).detach(), &targets);
        }
        self.generator.finalize_stddev();
        info!(samples, "generator statistics estimated");
    }

    /// Ascend the loss in the generator parameters. Returns the loss.
    pub fn generator_step(&mut self, batch: &LabeledBatch<B>, targets: &[i64]) -> f64 {
        let features = self.model.features(batch.x.clone()).detach();
        let class_features = self.generator.generate(&batch.x.device());
        let logits = self.model.classify_with(features, class_features);
        let loss = smooth_cross_entropy(logits, targets, self.config.smoothing_eps);
        let value = scalar(loss.clone());

        let grads = GradientsParams::from_grads(loss.neg().backward(), &self.generator);
        self.generator = self.generator_optimizer.step(
            self.config.generator_learning_rate,
            self.generator.clone(),
            grads,
        );
        value
    }

    /// Clipped model gradient of the loss against detached generated
    /// features, with the loss, accuracy and pre-clip norm.
    fn model_gradients(
        &self,
        batch: &LabeledBatch<B>,
        targets: &[i64],
    ) -> (GradientsParams, f64, f64, f64) {
        let features = self.model.features(batch.x.clone());
        let class_features = self.generator.generate(&batch.x.device()).detach();
        let logits = self.model.classify_with(features, class_features);
        let loss = smooth_cross_entropy(logits.clone(), targets, self.config.smoothing_eps);
        let value = scalar(loss.clone());
        let accu = accuracy(logits, targets);

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        let (grads, norm) = clip_grad_norm(&self.model, grads, self.config.grad_clip);
        (grads, value, accu, norm)
    }

    /// Descend the loss in the model parameters. Returns the loss and accuracy.
    pub fn model_step(&mut self, batch: &LabeledBatch<B>, targets: &[i64], index: usize) -> (f64, f64) {
        let (grads, value, accu, norm) = self.model_gradients(batch, targets);
        self.sink.add_scalar("minmax/grad_norm/before_clip", norm, index);
        self.model = self
            .model_optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);
        (value, accu)
    }

    fn evaluate(&self, model: &M, batch: &LabeledBatch<B>, targets: &[i64]) -> (f64, f64) {
        let features = model.features(batch.x.clone());
        let class_features: Tensor<B, 2> = self.generator.generate(&batch.x.device()).detach();
        let logits = model.classify_with(features, class_features);
        let loss = smooth_cross_entropy(logits.clone(), targets, self.config.smoothing_eps);
        (scalar(loss), accuracy(logits, targets))
    }

    /// One epoch. Training re-estimates the generator statistics first.
    ///
    /// With `options.grad_analysis` neither optimizer steps and no
    /// checkpoint is written; moments of the clipped model gradients over
    /// the non-head parameters are reported instead.
    pub fn run<I>(&mut self, batches: I, mode: RunMode, options: RunOptions) -> Result<RunResult>
    where
        I: IntoIterator<Item = LabeledBatch<B>> + Clone,
    {
        let analysis = mode.is_train() && options.grad_analysis;
        info!(mode = ?mode, epoch = options.epoch, grad_analysis = analysis, "min-max run");
        let schema = MetricSchema::new(true, false);
        if mode.is_train() {
            self.estimate_statistics(batches.clone());
        }
        let mut moments = analysis.then(|| {
            GradientMoments::new::<B, M>(
                &self.model,
                TrainerStrategy::min_max().moment_exclusions(self.model.head_param_ids()),
            )
        });
        let eval_model = match mode {
            RunMode::Train => None,
            RunMode::Eval => Some(self.model.clone().no_grad()),
        };

        let mut state = RunState::new();
        let mut index = options.start;
        for batch in batches {
            if options.reached_stop(mode, index) {
                break;
            }
            let targets = rebase_labels(&batch.y, self.config.label_offset);
            let (loss, accu) = match (eval_model.as_ref(), moments.as_mut()) {
                (Some(model), _) => self.evaluate(model, &batch, &targets),
                (None, Some(moments)) => {
                    let (grads, loss, accu, _) = self.model_gradients(&batch, &targets);
                    moments.accumulate::<B, M>(&self.model, &grads);
                    (loss, accu)
                }
                (None, None) => {
                    let generator_loss = self.generator_step(&batch, &targets);
                    self.window.push("generator_loss", generator_loss);
                    self.model_step(&batch, &targets, index)
                }
            };

            let mut measurements = Measurements::new();
            measurements.insert(MetricKey::Loss, vec![loss]);
            measurements.insert(MetricKey::Accu, vec![accu]);
            schema.check(measurements.keys(), "min-max step");
            update_sum(&mut state.test, &measurements);
            state.test.count += 1;
            self.window.push("cross_ent", loss);
            self.window.push("accu", accu);

            if mode.is_train() && self.config.log_interval > 0 && index % self.config.log_interval == 0 {
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
            test: state.test.into_mean(),
            ..RunResult::default()
        };
        for (name, value) in self.window.epoch_summary() {
            self.sink
                .add_scalar(&format!("minmax/{}", name), value, options.epoch);
            result.epoch_metrics.insert(name, value);
        }
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
            let epoch = options.epoch;
            self.checkpointer.save_module(epoch, &self.model)?;
            self.checkpointer
                .save_record(epoch, "generator", self.generator.clone().into_record())?;
            self.checkpointer
                .save_record(epoch, "optim", self.model_optimizer.to_record())?;
            self.checkpointer.save_record(
                epoch,
                "generator_optim",
                self.generator_optimizer.to_record(),
            )?;
        }
        Ok(result)
    }

    fn flush_window(&mut self, step: usize) {
        for (name, mean) in self.window.flush() {
            self.sink.add_scalar(&format!("minmax/{}", name), mean, step);
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
            var_g = report.var_g,
            batches = report.batches,
            "min-max gradient analysis"
        );
    }
}

impl<B, M, G, OM, OG, S, C, I> Trainer<I> for MinMaxTrainer<B, M, G, OM, OG, S, C>
where
    B: AutodiffBackend,
    M: GeneratorConditioned<B>,
    G: FeatureGenerator<B>,
    OM: Optimizer<M, B>,
    OG: Optimizer<G, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
    I: IntoIterator<Item = LabeledBatch<B>> + Clone,
{
    fn strategy(&self) -> TrainerStrategy {
        TrainerStrategy::min_max()
    }

    fn run(&mut self, source: I, mode: RunMode, options: RunOptions) -> Result<RunResult> {
        MinMaxTrainer::run(self, source, mode, options)
    }
}
