use burn::config::Config;
use burn::module::ParamId;
use serde::{Deserialize, Serialize};

/// Episode geometry produced by the data-iteration collaborator.
#[derive(Config, Debug, PartialEq)]
pub struct EpisodeConfig {
    pub n_way: usize,
    pub n_shot: usize,
    pub n_query: usize,
    /// Tasks per outer step.
    pub batch_size: usize,
}

impl EpisodeConfig {
    pub fn samples_per_class(&self) -> usize {
        self.n_shot + self.n_query
    }

    pub fn support_len(&self) -> usize {
        self.n_way * self.n_shot
    }

    pub fn query_len(&self) -> usize {
        self.n_way * self.n_query
    }
}

/// Whether tasks are adapted one at a time or stacked along a task axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchingMode {
    /// One adaptation per task, loss divided by batch size, one backward per batch.
    PerTask,
    /// One adaptation for the whole task batch.
    Batched,
}

/// What a trainer does to the plain gradient of its model between the
/// backward pass and the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionPolicy {
    None,
    /// Control variate from a frozen global snapshot.
    Svrg,
    /// Alternating generator ascent before each model step.
    MinMax,
    /// Fine-tuned models are folded into a running weight average.
    Averaging,
}

/// Runtime description of a trainer variant.
///
/// The optimizer topology (one optimizer, a local/global pair or two
/// alternating optimizers) is fixed by each trainer's type parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerStrategy {
    pub batching: BatchingMode,
    pub correction: CorrectionPolicy,
}

impl TrainerStrategy {
    pub fn episodic(batching: BatchingMode) -> Self {
        Self {
            batching,
            correction: CorrectionPolicy::None,
        }
    }

    pub fn classical() -> Self {
        Self::episodic(BatchingMode::Batched)
    }

    pub fn svrg() -> Self {
        Self {
            batching: BatchingMode::Batched,
            correction: CorrectionPolicy::Svrg,
        }
    }

    pub fn min_max() -> Self {
        Self {
            batching: BatchingMode::Batched,
            correction: CorrectionPolicy::MinMax,
        }
    }

    pub fn weight_averaging() -> Self {
        Self {
            batching: BatchingMode::Batched,
            correction: CorrectionPolicy::Averaging,
        }
    }

    /// Parameters left out of gradient-moment diagnostics.
    ///
    /// Corrected SVRG gradients are measured over every parameter; all other
    /// variants skip the classifier head.
    pub fn moment_exclusions(&self, head: Vec<ParamId>) -> Vec<ParamId> {
        match self.correction {
            CorrectionPolicy::Svrg => Vec::new(),
            CorrectionPolicy::None | CorrectionPolicy::MinMax | CorrectionPolicy::Averaging => head,
        }
    }
}

/// Outer objective applied to scaled query logits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OuterLoss {
    CrossEntropy,
    /// Cross-entropy against targets smoothed to `1 - eps` / `eps / (C - 1)`.
    SmoothedCrossEntropy { eps: f64 },
}

/// Episodic meta-trainer configuration.
#[derive(Config, Debug)]
pub struct MetaTrainerConfig {
    pub episode: EpisodeConfig,
    #[config(default = "BatchingMode::Batched")]
    pub batching: BatchingMode,
    #[config(default = "OuterLoss::CrossEntropy")]
    pub outer_loss: OuterLoss,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    /// Global-norm clip threshold; `<= 0` disables clipping.
    #[config(default = 0.0)]
    pub grad_clip: f64,
    /// Optimizer steps every this many iterations, on gradients accumulated since the last step.
    #[config(default = 1)]
    pub optimizer_update_interval: usize,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 1000)]
    pub save_interval: usize,
    /// Checkpoint prefix, e.g. `protonet` -> `protonet_0001.mpk`.
    #[config(default = "String::from(\"meta\")")]
    pub model_type: String,
}

/// Classical (non-episodic) trainer configuration.
#[derive(Config, Debug)]
pub struct ClassicalTrainerConfig {
    pub n_classes: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 0.0)]
    pub grad_clip: f64,
    /// Subtracted from raw labels before the loss.
    #[config(default = 0)]
    pub label_offset: i64,
    /// Label-smoothing epsilon; `0.0` is plain cross-entropy.
    #[config(default = 0.0)]
    pub smoothing_eps: f64,
    /// Initial weight of the auxiliary objective; grown by 1% per run, capped at 0.5.
    #[config(default = 0.0)]
    pub aux_gamma: f64,
    /// Apply the auxiliary objective every this many iterations.
    #[config(default = 1)]
    pub aux_update_gap: usize,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 5)]
    pub save_every_epochs: usize,
    #[config(default = "String::from(\"classical\")")]
    pub model_type: String,
}

/// SVRG trainer configuration.
#[derive(Config, Debug)]
pub struct SvrgTrainerConfig {
    pub n_classes: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 0)]
    pub label_offset: i64,
    #[config(default = 0.0)]
    pub smoothing_eps: f64,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 5)]
    pub save_every_epochs: usize,
    #[config(default = "String::from(\"svrg\")")]
    pub model_type: String,
}

/// Min-max (generator vs. classifier) trainer configuration.
#[derive(Config, Debug)]
pub struct MinMaxTrainerConfig {
    pub n_classes: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 1.0e-3)]
    pub generator_learning_rate: f64,
    #[config(default = 0.0)]
    pub grad_clip: f64,
    #[config(default = 0)]
    pub label_offset: i64,
    /// Label-smoothing epsilon of both players' loss.
    #[config(default = 0.0)]
    pub smoothing_eps: f64,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 5)]
    pub save_every_epochs: usize,
    #[config(default = "String::from(\"minmax\")")]
    pub model_type: String,
}

/// Episodic trainer with per-epoch checkpoints and no gradient accumulation.
#[derive(Config, Debug)]
pub struct MetaClassicalTrainerConfig {
    pub episode: EpisodeConfig,
    #[config(default = "OuterLoss::CrossEntropy")]
    pub outer_loss: OuterLoss,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 0.0)]
    pub grad_clip: f64,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 1)]
    pub save_every_epochs: usize,
    #[config(default = "String::from(\"classical\")")]
    pub model_type: String,
}

/// Stochastic weight averaging over repeated fine-tuning cycles.
#[derive(Config, Debug)]
pub struct SwaTrainerConfig {
    pub n_classes: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 0.0)]
    pub grad_clip: f64,
    #[config(default = 0)]
    pub label_offset: i64,
    #[config(default = 0.0)]
    pub smoothing_eps: f64,
    /// Passes over the source in each cycle, starting from the initial weights.
    #[config(default = 10)]
    pub fine_tune_epochs: usize,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 5)]
    pub save_every_epochs: usize,
    #[config(default = "String::from(\"swa\")")]
    pub model_type: String,
}

/// Post-hoc fine-tuning over concatenated episode data.
#[derive(Config, Debug)]
pub struct FineTuneConfig {
    pub episode: EpisodeConfig,
    pub n_classes: usize,
    #[config(default = 10)]
    pub epochs: usize,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
    #[config(default = 0.0)]
    pub grad_clip: f64,
    #[config(default = 0)]
    pub label_offset: i64,
    #[config(default = 10)]
    pub log_interval: usize,
}

/// Test-time adaptation with an auxiliary objective.
#[derive(Config, Debug)]
pub struct AdaptationConfig {
    pub episode: EpisodeConfig,
    /// Optimizer steps on the auxiliary objective before each adaptation.
    #[config(default = 1)]
    pub aux_steps: usize,
    #[config(default = 1.0e-3)]
    pub aux_learning_rate: f64,
}

/// Train/validate alternation with a step-decay learning rate.
#[derive(Config, Debug)]
pub struct MetaScheduleConfig {
    /// Number of training batches in the whole schedule.
    pub total_batches: usize,
    /// Training batches between validation runs.
    #[config(default = 1000)]
    pub val_interval: usize,
    /// `(milestone, factor)`: the base rate is multiplied by `factor` once the
    /// validation round reaches `milestone * optimizer_update_interval`.
    #[config(default = "vec![(20, 0.06), (40, 0.012), (50, 0.0024)]")]
    pub step_milestones: Vec<(usize, f64)>,
}

impl MetaScheduleConfig {
    /// Learning-rate multiplier for the given validation round.
    pub fn lr_factor(&self, round: usize, optimizer_update_interval: usize) -> f64 {
        let mut factor = 1.0;
        for (milestone, value) in &self.step_milestones {
            if round >= milestone * optimizer_update_interval {
                factor = *value;
            }
        }
        factor
    }
}
