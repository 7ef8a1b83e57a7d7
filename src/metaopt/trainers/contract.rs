//! Contract between the trainers and their pluggable collaborators.
//!
//! An [`InnerLoopAlgorithm`] owns a backbone and adapts it to a batch of
//! tasks. Its result is an [`Adaptation`]: either query logits that ordinary
//! backpropagation handles, or an [`ImplicitAdaptation`] carrying the
//! operators the engine needs to inject the implicit-function gradient of a
//! convex inner solve.

use std::collections::BTreeMap;
use std::fmt;

use burn::module::{AutodiffModule, ParamId};
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor,
};

use super::episode::TaskBatch;
use super::measurements::MetricKey;

/// Whether a run builds a gradient tape and updates parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    Eval,
}

impl RunMode {
    pub fn is_train(&self) -> bool {
        matches!(self, RunMode::Train)
    }
}

/// Inner trajectory of one adaptation: key -> one value per inner step.
pub type Trajectory = BTreeMap<MetricKey, Vec<f64>>;

/// Linear operator on `[n_way, d]` or `[n_way, d] -> [n_support, d]` tensors.
pub type TensorOperator<B> = Box<dyn Fn(Tensor<B, 2>) -> Tensor<B, 2>>;

/// Closed-form adaptation of a single task.
///
/// `weights` are the inner solution `W*` (`[n_way, d]`), detached from the
/// graph. The engine computes query logits as `scale * query_features W*^T`
/// and, in training, the outer gradient `g = dL/dW*`, then injects
/// `-mixed_partial_multiply(hessian_inverse_multiply(g))` as the upstream
/// gradient of `support_features`.
pub struct ImplicitAdaptation<B: Backend> {
    /// `[n_support, d]`, tracked.
    pub support_features: Tensor<B, 2>,
    /// `[n_query, d]`, tracked.
    pub query_features: Tensor<B, 2>,
    /// `[n_way, d]`, detached.
    pub weights: Tensor<B, 2>,
    /// `v -> H^{-1} v` with `H` the inner objective's Hessian in `W`, `[n_way, d] -> [n_way, d]`.
    pub hessian_inverse_multiply: TensorOperator<B>,
    /// `v -> d<v, grad_W inner>/d support_features`, `[n_way, d] -> [n_support, d]`.
    pub mixed_partial_multiply: TensorOperator<B>,
    pub trajectory: Trajectory,
}

impl<B: Backend> fmt::Debug for ImplicitAdaptation<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplicitAdaptation")
            .field("support_features", &self.support_features.dims())
            .field("query_features", &self.query_features.dims())
            .field("weights", &self.weights.dims())
            .field("trajectory", &self.trajectory)
            .finish()
    }
}

/// Result of [`InnerLoopAlgorithm::inner_loop_adapt`].
#[derive(Debug)]
pub enum Adaptation<B: Backend> {
    /// Ordinary backpropagation through `logits` (`[T, Q, n_way]`, unscaled) suffices.
    Direct {
        logits: Tensor<B, 3>,
        trajectory: Trajectory,
    },
    /// The caller must inject the implicit gradient. Produced for one task at a time.
    Implicit(ImplicitAdaptation<B>),
}

impl<B: Backend> Adaptation<B> {
    pub fn trajectory(&self) -> &Trajectory {
        match self {
            Adaptation::Direct { trajectory, .. } => trajectory,
            Adaptation::Implicit(implicit) => &implicit.trajectory,
        }
    }
}

/// Inner model reached through [`Backbone::unwrap`].
pub trait InnerModel<B: Backend> {
    /// Learned or fixed logit scale, if the model has one.
    fn scale_factor(&self) -> Option<Tensor<B, 1>> {
        None
    }

    /// Parameters of the classifier head; excluded from gradient-moment diagnostics.
    fn head_param_ids(&self) -> Vec<ParamId> {
        Vec::new()
    }
}

/// A model handle that may be a data-parallel replica wrapper.
pub trait Backbone<B: Backend> {
    type Inner: InnerModel<B>;

    /// The wrapped inner model; identity when not replicated.
    fn unwrap(&self) -> &Self::Inner;
}

/// Pluggable inner-loop adaptation algorithm.
pub trait InnerLoopAlgorithm<B: AutodiffBackend>: AutodiffModule<B> {
    type Backbone: Backbone<B>;

    fn backbone(&self) -> &Self::Backbone;

    /// Classification algorithms add `accu` to every measurement.
    fn is_classification(&self) -> bool {
        true
    }

    /// Whether a whole task batch can be solved in one call.
    fn supports_batched(&self) -> bool {
        true
    }

    /// Adapt to the support sets of `tasks` and predict their query sets.
    ///
    /// `scale` is the backbone's logit scale when one exists; algorithms that
    /// apply it internally report trajectories on scaled logits. In
    /// [`RunMode::Eval`] the caller passes a module without gradient tracking.
    fn inner_loop_adapt(
        &self,
        tasks: &TaskBatch<B>,
        scale: Option<Tensor<B, 1>>,
        mode: RunMode,
    ) -> Adaptation<B>;

    /// Scale factor of the unwrapped backbone.
    fn backbone_scale(&self) -> Option<Tensor<B, 1>> {
        self.backbone().unwrap().scale_factor()
    }
}

/// Plain classifier used by the classical, SVRG and min-max trainers.
pub trait FeatureClassifier<B: AutodiffBackend>: AutodiffModule<B> + InnerModel<B> {
    /// `[N, C, H, W] -> [N, d]`
    fn features(&self, x: Tensor<B, 4>) -> Tensor<B, 2>;

    /// `[N, d] -> [N, n_classes]`
    fn classify(&self, features: Tensor<B, 2>) -> Tensor<B, 2>;

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.classify(self.features(x))
    }
}

/// Classifier whose head is built from externally synthesized class features.
pub trait GeneratorConditioned<B: AutodiffBackend>: FeatureClassifier<B> {
    /// `features: [N, d]`, `class_features: [n_classes, d]` -> `[N, n_classes]`
    fn classify_with(&self, features: Tensor<B, 2>, class_features: Tensor<B, 2>) -> Tensor<B, 2>;
}

/// Auxiliary objective computed on features.
pub trait AuxObjective<B: Backend> {
    fn name(&self) -> &str;

    fn loss(&self, features: Tensor<B, 2>, labels: &[i64]) -> Tensor<B, 1>;
}

/// Synthesizes per-class features for the min-max trainer.
///
/// Statistics are estimated in two passes over a reference source (means
/// first, then standard deviations around those means); `generate` then
/// produces one feature row per class from its learnable parameters.
pub trait FeatureGenerator<B: AutodiffBackend>: AutodiffModule<B> {
    fn reset_statistics(&mut self);

    /// Fold detached `features: [N, d]` with their rebased labels into the mean estimate.
    fn update_mean(&mut self, features: Tensor<B, 2>, labels: &[i64]);

    fn finalize_mean(&mut self);

    fn update_stddev(&mut self, features: Tensor<B, 2>, labels: &[i64]);

    fn finalize_stddev(&mut self);

    /// `[n_classes, d]`
    fn generate(&self, device: &B::Device) -> Tensor<B, 2>;
}

/// Algorithms whose support features can be reached directly.
pub trait SupportEmbedding<B: Backend> {
    /// `[T * S, d]`, task-major.
    fn embed_support(&self, tasks: &TaskBatch<B>) -> Tensor<B, 2>;
}
