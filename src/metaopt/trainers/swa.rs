//! Stochastic weight averaging over fine-tuning cycles.
//!
//! Every training run restarts the live model from the weights the trainer
//! was built with, fine-tunes it for `fine_tune_epochs` passes over the
//! source and folds the result into a running parameter average
//! `swa <- swa + (live - swa) / (n + 1)`. Evaluation measures the average
//! once one exists.

use std::marker::PhantomData;

use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use tracing::{debug, info};

use super::checkpoint::{CheckpointSchedule, Checkpointer};
use super::config::{SwaTrainerConfig, TrainerStrategy};
use super::contract::{FeatureClassifier, RunMode};
use super::episode::LabeledBatch;
use super::grad::clip_grad_norm;
use super::loss_utils::{accuracy, rebase_labels, scalar, smooth_cross_entropy};
use super::measurements::{update_sum, Measurements, MetricKey, MetricWindow};
use super::run::{RunOptions, RunResult, RunState, Trainer};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

struct CollectVisitor<B: AutodiffBackend> {
    params: GradientsParams,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for CollectVisitor<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.params
            .register::<B::InnerBackend, D>(id, tensor.clone().inner());
    }
}

struct BlendMapper<B: AutodiffBackend> {
    live: GradientsParams,
    weight: f64,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleMapper<B> for BlendMapper<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(live) = self.live.remove::<B::InnerBackend, D>(id) else {
            panic!("LAYOUT ERROR: averaged parameter {:?} missing from the live model", id);
        };
        let current = tensor.inner();
        let blended = current.clone() + (live - current).mul_scalar(self.weight);
        Tensor::from_inner(blended)
    }
}

/// `average + (live - average) * weight`, parameter by parameter.
///
/// # Panics
///
/// Panics with `LAYOUT ERROR` if `live` lacks one of `average`'s parameters.
pub fn blend_parameters<B: AutodiffBackend, M: Module<B>>(average: M, live: &M, weight: f64) -> M {
    let mut collect = CollectVisitor::<B> {
        params: GradientsParams::new(),
        phantom: PhantomData,
    };
    live.visit(&mut collect);
    let mut mapper = BlendMapper::<B> {
        live: collect.params,
        weight,
        phantom: PhantomData,
    };
    average.map(&mut mapper)
}

pub struct SwaTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    initial: M,
    model: M,
    average: Option<M>,
    averaged: usize,
    optimizer: O,
    config: SwaTrainerConfig,
    sink: S,
    checkpointer: C,
    window: MetricWindow,
    phantom: PhantomData<B>,
}

impl<B, M, O, S, C> SwaTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    pub fn new(model: M, optimizer: O, config: SwaTrainerConfig, sink: S, checkpointer: C) -> Self {
        Self {
            initial: model.clone(),
            model,
            average: None,
            averaged: 0,
            optimizer,
            config,
            sink,
            checkpointer,
            window: MetricWindow::new(),
            phantom: PhantomData,
        }
    }

    /// Live model of the last cycle.
    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn average(&self) -> Option<&M> {
        self.average.as_ref()
    }

    /// Cycles folded into the average so far.
    pub fn models_averaged(&self) -> usize {
        self.averaged
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    /// The averaged model, or the live one before the first cycle.
    pub fn into_model(self) -> M {
        self.average.unwrap_or(self.model)
    }

    /// One cycle (train) or one measuring pass (eval) over `batches`.
    ///
    /// A training cycle checkpoints the average after epochs that are a
    /// multiple of `save_every_epochs`. Eval runs measure the average, or
    /// the live model if no cycle has finished yet.
    pub fn run<I>(&mut self, batches: I, mode: RunMode, options: RunOptions) -> Result<RunResult>
    where
        I: IntoIterator<Item = LabeledBatch<B>> + Clone,
    {
        info!(
            mode = ?mode,
            epoch = options.epoch,
            averaged = self.averaged,
            "swa run"
        );
        let mut state = RunState::new();
        match mode {
            RunMode::Train => self.fine_tune_cycle(batches, options, &mut state),
            RunMode::Eval => self.measure(batches, options, &mut state),
        }

        let mut result = RunResult {
            batches: state.batches,
            last_iteration: state.iteration,
            ..RunResult::default()
        };
        result.test = state.test.into_mean();
        if mode == RunMode::Eval {
            return Ok(result);
        }

        self.fold();
        self.sink
            .add_scalar("swa/models_averaged", self.averaged as f64, options.epoch);
        for (name, value) in self.window.epoch_summary() {
            self.sink.add_scalar(&format!("swa/{}", name), value, options.epoch);
            result.epoch_metrics.insert(name, value);
        }

        let schedule = CheckpointSchedule::Epochal {
            every: self.config.save_every_epochs,
        };
        if let Some(average) = self.average.as_ref() {
            if schedule.should_save(options.epoch) {
                self.checkpointer.save_module(options.epoch, average)?;
                self.checkpointer
                    .save_record(options.epoch, "optim", self.optimizer.to_record())?;
            }
        }
        Ok(result)
    }

    fn fine_tune_cycle<I>(&mut self, batches: I, options: RunOptions, state: &mut RunState)
    where
        I: IntoIterator<Item = LabeledBatch<B>> + Clone,
    {
        self.model = self.initial.clone();
        let mut index = options.start;
        for pass in 0..self.config.fine_tune_epochs {
            debug!(pass, "swa fine-tuning pass");
            for batch in batches.clone() {
                if options.reached_stop(RunMode::Train, index) {
                    break;
                }
                let targets = rebase_labels(&batch.y, self.config.label_offset);
                let logits = self.model.forward(batch.x);
                let loss = smooth_cross_entropy(logits.clone(), &targets, self.config.smoothing_eps);
                self.record(state, scalar(loss.clone()), accuracy(logits, &targets));

                let grads = GradientsParams::from_grads(loss.backward(), &self.model);
                let (grads, norm) = clip_grad_norm(&self.model, grads, self.config.grad_clip);
                self.sink.add_scalar("swa/grad_norm/before_clip", norm, index);
                self.model = self
                    .optimizer
                    .step(self.config.learning_rate, self.model.clone(), grads);

                if self.config.log_interval > 0 && index % self.config.log_interval == 0 {
                    self.flush_window(index);
                }
                state.iteration = index;
                index += 1;
            }
        }
        if !self.window.is_empty() {
            self.flush_window(state.iteration);
        }
    }

    fn measure<I>(&mut self, batches: I, options: RunOptions, state: &mut RunState)
    where
        I: IntoIterator<Item = LabeledBatch<B>>,
    {
        let model = self.average.as_ref().unwrap_or(&self.model).clone().no_grad();
        let mut index = options.start;
        for batch in batches {
            let targets = rebase_labels(&batch.y, self.config.label_offset);
            let logits = model.forward(batch.x);
            let loss = smooth_cross_entropy(logits.clone(), &targets, self.config.smoothing_eps);
            let mut measurements = Measurements::new();
            measurements.insert(MetricKey::Loss, vec![scalar(loss)]);
            measurements.insert(MetricKey::Accu, vec![accuracy(logits, &targets)]);
            update_sum(&mut state.test, &measurements);
            state.test.count += 1;
            state.batches += 1;
            state.iteration = index;
            index += 1;
        }
    }

    fn record(&mut self, state: &mut RunState, loss: f64, accu: f64) {
        let mut measurements = Measurements::new();
        measurements.insert(MetricKey::Loss, vec![loss]);
        measurements.insert(MetricKey::Accu, vec![accu]);
        update_sum(&mut state.test, &measurements);
        state.test.count += 1;
        state.batches += 1;
        self.window.push("cross_ent", loss);
        self.window.push("accu", accu);
    }

    fn fold(&mut self) {
        let live = self.model.clone();
        let average = match self.average.take() {
            None => live,
            Some(average) => {
                blend_parameters::<B, M>(average, &live, 1.0 / (self.averaged + 1) as f64)
            }
        };
        self.average = Some(average);
        self.averaged += 1;
    }

    fn flush_window(&mut self, step: usize) {
        for (name, mean) in self.window.flush() {
            self.sink.add_scalar(&format!("swa/{}", name), mean, step);
        }
    }
}

impl<B, M, O, S, C, I> Trainer<I> for SwaTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
    I: IntoIterator<Item = LabeledBatch<B>> + Clone,
{
    fn strategy(&self) -> TrainerStrategy {
        TrainerStrategy::weight_averaging()
    }

    fn run(&mut self, source: I, mode: RunMode, options: RunOptions) -> Result<RunResult> {
        SwaTrainer::run(self, source, mode, options)
    }
}
