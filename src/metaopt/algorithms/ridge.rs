//! Closed-form ridge-regression head with implicit outer gradients.
//!
//! The inner problem for support features `X` (`[n, d]`) and one-hot
//! targets `Y` (`[n, c]`) is
//!
//! ```text
//! f(W, X) = 1/2 ||X W^T - Y||^2 + lambda/2 ||W||^2,   W: [c, d]
//! ```
//!
//! with solution `W* = Y^T X A^{-1}`, `A = X^T X + lambda I`. The Hessian in
//! `W` acts as `V -> V A`, and the mixed partial is
//! `V -> d<V, grad_W f>/dX = R V + X V^T W*` with residual `R = X W*^T - Y`.

use burn::module::{Ignored, Module};
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor, TensorData,
};
use nalgebra::{Cholesky, DMatrix, Dyn};

use super::backbone::Replicated;
use crate::metaopt::trainers::contract::{
    Adaptation, Backbone, ImplicitAdaptation, InnerLoopAlgorithm, RunMode, SupportEmbedding,
    Trajectory,
};
use crate::metaopt::trainers::episode::TaskBatch;
use crate::metaopt::trainers::loss_utils::{accuracy, apply_scale, cross_entropy, scalar};
use crate::metaopt::trainers::measurements::MetricKey;

#[derive(Module, Debug)]
pub struct RidgeHead<B: Backend> {
    backbone: Replicated<B>,
    lambda: Ignored<f64>,
}

impl<B: Backend> RidgeHead<B> {
    pub fn new(backbone: Replicated<B>, lambda: f64) -> Self {
        Self {
            backbone,
            lambda: Ignored(lambda),
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda.0
    }
}

/// Row-major copy of a 2-D tensor.
pub fn to_matrix<B: Backend>(tensor: Tensor<B, 2>) -> DMatrix<f64> {
    let [rows, cols] = tensor.dims();
    let values: Vec<f64> = tensor.to_data().iter::<f32>().map(f64::from).collect();
    DMatrix::from_row_slice(rows, cols, &values)
}

pub fn from_matrix<B: Backend>(matrix: &DMatrix<f64>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = matrix.shape();
    let values: Vec<f32> = matrix
        .row_iter()
        .flat_map(|row| row.iter().map(|v| *v as f32).collect::<Vec<_>>())
        .collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}

/// Solved inner problem with the quantities the implicit operators need.
#[derive(Debug, Clone)]
pub struct RidgeSolution {
    /// `[c, d]`
    pub weights: DMatrix<f64>,
    /// `[n, c]`
    pub residual: DMatrix<f64>,
    /// `[n, d]`
    pub features: DMatrix<f64>,
    gram: Cholesky<f64, Dyn>,
}

impl RidgeSolution {
    /// # Panics
    ///
    /// Panics with `SOLVER ERROR` if `X^T X + lambda I` is not positive
    /// definite, which only happens for `lambda <= 0` on rank-deficient features.
    pub fn solve(features: DMatrix<f64>, targets: &DMatrix<f64>, lambda: f64) -> Self {
        let d = features.ncols();
        let gram = features.transpose() * &features + DMatrix::<f64>::identity(d, d) * lambda;
        let gram = gram.cholesky().unwrap_or_else(|| {
            panic!(
                "SOLVER ERROR: ridge system with lambda = {} is not positive definite",
                lambda
            )
        });
        // A W^T = X^T Y
        let weights = gram.solve(&(features.transpose() * targets)).transpose();
        let residual = &features * weights.transpose() - targets;
        Self {
            weights,
            residual,
            features,
            gram,
        }
    }

    /// `V -> V A^{-1}` for `V: [c, d]`.
    pub fn hessian_inverse_multiply(&self, v: &DMatrix<f64>) -> DMatrix<f64> {
        self.gram.solve(&v.transpose()).transpose()
    }

    /// `V -> R V + X V^T W*` for `V: [c, d]`, giving `[n, d]`.
    pub fn mixed_partial_multiply(&self, v: &DMatrix<f64>) -> DMatrix<f64> {
        &self.residual * v + &self.features * v.transpose() * &self.weights
    }
}

fn one_hot_matrix(labels: &[i64], classes: usize) -> DMatrix<f64> {
    let mut targets = DMatrix::zeros(labels.len(), classes);
    for (row, label) in labels.iter().enumerate() {
        targets[(row, *label as usize)] = 1.0;
    }
    targets
}

impl<B: AutodiffBackend> InnerLoopAlgorithm<B> for RidgeHead<B> {
    type Backbone = Replicated<B>;

    fn backbone(&self) -> &Self::Backbone {
        &self.backbone
    }

    fn supports_batched(&self) -> bool {
        false
    }

    fn inner_loop_adapt(
        &self,
        tasks: &TaskBatch<B>,
        scale: Option<Tensor<B, 1>>,
        _mode: RunMode,
    ) -> Adaptation<B> {
        if tasks.num_tasks() != 1 {
            panic!(
                "SHAPE ERROR: ridge head solves one task at a time, got {} tasks",
                tasks.num_tasks()
            );
        }
        let device = tasks.device();
        let model = self.backbone.unwrap();
        let support_features = model.embed(tasks.flat_support());
        let query_features = model.embed(tasks.flat_query());

        let labels = &tasks.support_y[0];
        let solution = RidgeSolution::solve(
            to_matrix(support_features.clone().detach()),
            &one_hot_matrix(labels, tasks.n_way),
            self.lambda.0,
        );
        let weights = from_matrix::<B>(&solution.weights, &device);

        let support_logits = apply_scale(
            support_features.clone().detach().matmul(weights.clone().transpose()),
            scale.map(|factor| factor.detach()),
        );
        let mut trajectory = Trajectory::new();
        trajectory.insert(
            MetricKey::Loss,
            vec![scalar(cross_entropy(support_logits.clone(), labels))],
        );
        trajectory.insert(MetricKey::Accu, vec![accuracy(support_logits, labels)]);

        let hinv_solution = solution.clone();
        let hinv_device = device.clone();
        let mixed_device = device;
        Adaptation::Implicit(ImplicitAdaptation {
            support_features,
            query_features,
            weights,
            hessian_inverse_multiply: Box::new(move |v| {
                from_matrix::<B>(
                    &hinv_solution.hessian_inverse_multiply(&to_matrix(v)),
                    &hinv_device,
                )
            }),
            mixed_partial_multiply: Box::new(move |v| {
                from_matrix::<B>(
                    &solution.mixed_partial_multiply(&to_matrix(v)),
                    &mixed_device,
                )
            }),
            trajectory,
        })
    }
}

impl<B: Backend> SupportEmbedding<B> for RidgeHead<B> {
    fn embed_support(&self, tasks: &TaskBatch<B>) -> Tensor<B, 2> {
        self.backbone.unwrap().embed(tasks.flat_support())
    }
}
