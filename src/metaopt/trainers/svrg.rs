//! Variance-reduced (SVRG) classical trainer.
//!
//! Each training epoch first snapshots the live model into a frozen global
//! copy and averages its gradient over one full pass of a reference source.
//! Only then does the main pass start; every local gradient is corrected by
//! `g_local - g_global(batch) + g_global_average` and handed to the
//! optimizer unclipped. The snapshot is never stepped and is replaced
//! wholesale at the next epoch.

use std::marker::PhantomData;

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use tracing::info;

use super::checkpoint::{CheckpointSchedule, Checkpointer};
use super::config::{SvrgTrainerConfig, TrainerStrategy};
use super::contract::{FeatureClassifier, RunMode};
use super::episode::LabeledBatch;
use super::grad::{
    accumulate_gradients, assert_same_layout, grad_norm, scale_gradients, svrg_correct, GradientMoments,
    ParamLayout,
};
use super::loss_utils::{accuracy, rebase_labels, scalar, smooth_cross_entropy};
use super::measurements::{update_sum, Measurements, MetricKey, MetricWindow};
use super::run::{RunOptions, RunResult, RunState, Trainer};
use super::sink::MetricsSink;
use crate::metaopt::error::Result;

pub struct SvrgTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    local: M,
    optimizer: O,
    config: SvrgTrainerConfig,
    sink: S,
    checkpointer: C,
    window: MetricWindow,
    phantom: PhantomData<B>,
}

impl<B, M, O, S, C> SvrgTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
{
    pub fn new(model: M, optimizer: O, config: SvrgTrainerConfig, sink: S, checkpointer: C) -> Self {
        Self {
            local: model,
            optimizer,
            config,
            sink,
            checkpointer,
            window: MetricWindow::new(),
            phantom: PhantomData,
        }
    }

    pub fn model(&self) -> &M {
        &self.local
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn checkpointer(&self) -> &C {
        &self.checkpointer
    }

    pub fn into_model(self) -> M {
        self.local
    }

    fn loss_and_accuracy(&self, model: &M, batch: &LabeledBatch<B>) -> (Tensor<B, 1>, f64) {
        let targets = rebase_labels(&batch.y, self.config.label_offset);
        let logits = model.forward(batch.x.clone());
        let loss = smooth_cross_entropy(logits.clone(), &targets, self.config.smoothing_eps);
        (loss, accuracy(logits, &targets))
    }

    /// Average gradient of `global` over the whole reference source.
    ///
    /// # Panics
    ///
    /// Panics with `SVRG ERROR` if the reference source is empty.
    pub fn global_gradient<R>(&self, global: &M, reference: R) -> GradientsParams
    where
        R: IntoIterator<Item = LabeledBatch<B>>,
    {
        let mut total: Option<GradientsParams> = None;
        let mut batches = 0usize;
        for batch in reference {
            let (loss, _) = self.loss_and_accuracy(global, &batch);
            let grads = GradientsParams::from_grads(loss.backward(), global);
            total = Some(accumulate_gradients(global, total, grads));
            batches += 1;
        }
        let Some(total) = total else {
            panic!("SVRG ERROR: reference source yielded no batches for the global gradient");
        };
        info!(batches, "global gradient pass complete");
        scale_gradients(global, total, 1.0 / batches as f64)
    }

    /// One epoch using `batches` as its own reference source.
    pub fn run<I>(&mut self, batches: I, mode: RunMode, options: RunOptions) -> Result<RunResult>
    where
        I: IntoIterator<Item = LabeledBatch<B>> + Clone,
    {
        let reference = batches.clone();
        self.run_with_reference(batches, reference, mode, options)
    }

    /// One epoch over `batches`, with the global gradient averaged over `reference`.
    ///
    /// Eval runs only measure the live model; no snapshot is taken.
    pub fn run_with_reference<I, R>(
        &mut self,
        batches: I,
        reference: R,
        mode: RunMode,
        options: RunOptions,
    ) -> Result<RunResult>
    where
        I: IntoIterator<Item = LabeledBatch<B>>,
        R: IntoIterator<Item = LabeledBatch<B>>,
    {
        info!(mode = ?mode, epoch = options.epoch, "svrg run");
        let mut state = RunState::new();

        if mode == RunMode::Eval {
            let model = self.local.clone().no_grad();
            for batch in batches {
                let (loss, accu) = self.loss_and_accuracy(&model, &batch);
                let mut measurements = Measurements::new();
                measurements.insert(MetricKey::Loss, vec![scalar(loss)]);
                measurements.insert(MetricKey::Accu, vec![accu]);
                update_sum(&mut state.test, &measurements);
                state.test.count += 1;
                state.batches += 1;
            }
            return Ok(RunResult {
                test: state.test.into_mean(),
                batches: state.batches,
                ..RunResult::default()
            });
        }

        // The reference pass must finish before the first corrected step.
        let global = self.local.clone();
        let global_average = self.global_gradient(&global, reference);
        let global_layout = ParamLayout::of::<B, M>(&global);
        let mut moments = GradientMoments::new::<B, M>(
            &self.local,
            TrainerStrategy::svrg().moment_exclusions(self.local.head_param_ids()),
        );

        let mut index = options.start;
        for batch in batches {
            if options.reached_stop(mode, index) {
                break;
            }
            let (loss, accu) = self.loss_and_accuracy(&self.local, &batch);
            let (loss_global, _) = self.loss_and_accuracy(&global, &batch);

            let mut measurements = Measurements::new();
            measurements.insert(MetricKey::Loss, vec![scalar(loss.clone())]);
            measurements.insert(MetricKey::Accu, vec![accu]);
            measurements.insert(MetricKey::LossGlobal, vec![scalar(loss_global.clone())]);
            update_sum(&mut state.test, &measurements);
            state.test.count += 1;
            self.window.push("cross_ent", measurements[&MetricKey::Loss][0]);
            self.window.push("accu", accu);
            self.window
                .push("loss_global", measurements[&MetricKey::LossGlobal][0]);

            let local_grads = GradientsParams::from_grads(loss.backward(), &self.local);
            let global_grads = GradientsParams::from_grads(loss_global.backward(), &global);
            assert_same_layout(&ParamLayout::of::<B, M>(&self.local), &global_layout);
            let corrected = svrg_correct(&self.local, local_grads, &global_grads, &global_average);

            let covered = moments.accumulate::<B, M>(&self.local, &corrected);
            assert_eq!(
                covered,
                moments.len(),
                "MOMENT ERROR: gradient moments must cover every parameter"
            );

            if !options.grad_analysis {
                self.sink
                    .add_scalar("svrg/grad_norm", grad_norm(&self.local, &corrected), index);
                self.local = self.optimizer.step(
                    self.config.learning_rate,
                    self.local.clone(),
                    corrected,
                );
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
            test: state.test.into_mean(),
            ..RunResult::default()
        };
        for (name, value) in self.window.epoch_summary() {
            self.sink.add_scalar(&format!("svrg/{}", name), value, options.epoch);
            result.epoch_metrics.insert(name, value);
        }
        if moments.batches() > 0 {
            let report = moments.finalize();
            for (name, value) in report.scalars() {
                self.sink
                    .add_scalar(&format!("grad_analysis/{}", name), value, options.epoch);
            }
            info!(
                epoch = options.epoch,
                srm_g = report.srm_g,
                var_g = report.var_g,
                uncertainty = report.uncertainty,
                "svrg gradient moments"
            );
            result.gradient_moments = Some(report);
        }

        let schedule = CheckpointSchedule::Epochal {
            every: self.config.save_every_epochs,
        };
        if !options.grad_analysis && schedule.should_save(options.epoch) {
            self.checkpointer.save_module(options.epoch, &self.local)?;
            self.checkpointer
                .save_record(options.epoch, "optim", self.optimizer.to_record())?;
        }
        Ok(result)
    }

    fn flush_window(&mut self, step: usize) {
        for (name, mean) in self.window.flush() {
            self.sink.add_scalar(&format!("svrg/{}", name), mean, step);
        }
    }
}

impl<B, M, O, S, C, I> Trainer<I> for SvrgTrainer<B, M, O, S, C>
where
    B: AutodiffBackend,
    M: FeatureClassifier<B>,
    O: Optimizer<M, B>,
    S: MetricsSink,
    C: Checkpointer<B>,
    I: IntoIterator<Item = LabeledBatch<B>> + Clone,
{
    fn strategy(&self) -> TrainerStrategy {
        TrainerStrategy::svrg()
    }

    fn run(&mut self, source: I, mode: RunMode, options: RunOptions) -> Result<RunResult> {
        SvrgTrainer::run(self, source, mode, options)
    }
}
