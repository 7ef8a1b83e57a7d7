//! Nearest-prototype classifier: class prototypes are support-feature means
//! and logits are negative squared Euclidean distances to them.

use burn::module::Module;
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor,
};

use super::backbone::MlpBackbone;
use crate::metaopt::trainers::contract::{
    Adaptation, InnerLoopAlgorithm, RunMode, SupportEmbedding, Trajectory,
};
use crate::metaopt::trainers::episode::{one_hot, TaskBatch};
use crate::metaopt::trainers::loss_utils::{accuracy, apply_scale, cross_entropy, scalar};
use crate::metaopt::trainers::measurements::MetricKey;

#[derive(Module, Debug)]
pub struct ProtoNet<B: Backend> {
    backbone: MlpBackbone<B>,
}

impl<B: Backend> ProtoNet<B> {
    pub fn new(backbone: MlpBackbone<B>) -> Self {
        Self { backbone }
    }

    pub fn model(&self) -> &MlpBackbone<B> {
        &self.backbone
    }
}

/// `-||a_i - b_j||^2` per task: `[T, M, d] x [T, K, d] -> [T, M, K]`.
pub fn negative_squared_distance<B: Backend>(a: Tensor<B, 3>, b: Tensor<B, 3>) -> Tensor<B, 3> {
    let a_sq = a.clone().powf_scalar(2.0).sum_dim(2);
    let b_sq = b.clone().powf_scalar(2.0).sum_dim(2).swap_dims(1, 2);
    let cross = a.matmul(b.swap_dims(1, 2));
    cross.mul_scalar(2.0) - a_sq - b_sq
}

/// Per-task class means: `[T, n_way, d]`.
pub fn prototypes<B: Backend>(
    features: Tensor<B, 3>,
    labels: &[Vec<i64>],
    n_way: usize,
) -> Tensor<B, 3> {
    let [tasks, samples, _] = features.dims();
    let flat: Vec<i64> = labels.iter().flatten().copied().collect();
    let membership = one_hot::<B>(&flat, n_way, &features.device()).reshape([tasks, samples, n_way]);
    let counts = membership.clone().sum_dim(1).swap_dims(1, 2).clamp_min(1.0);
    membership.swap_dims(1, 2).matmul(features) / counts
}

impl<B: AutodiffBackend> InnerLoopAlgorithm<B> for ProtoNet<B> {
    type Backbone = MlpBackbone<B>;

    fn backbone(&self) -> &Self::Backbone {
        &self.backbone
    }

    fn inner_loop_adapt(
        &self,
        tasks: &TaskBatch<B>,
        scale: Option<Tensor<B, 1>>,
        _mode: RunMode,
    ) -> Adaptation<B> {
        let t = tasks.num_tasks();
        let s = tasks.support_len();
        let q = tasks.query_len();
        let d = self.backbone.feature_dim();

        let support = self.backbone.embed(tasks.flat_support()).reshape([t, s, d]);
        let query = self.backbone.embed(tasks.flat_query()).reshape([t, q, d]);
        let protos = prototypes(support.clone(), &tasks.support_y, tasks.n_way);

        // Fit on the support set itself, reported as a one-step trajectory.
        let support_logits = negative_squared_distance(support.detach(), protos.clone().detach())
            .reshape([t * s, tasks.n_way]);
        let support_logits = apply_scale(support_logits, scale.map(|factor| factor.detach()));
        let support_labels: Vec<i64> = tasks.support_y.iter().flatten().copied().collect();
        let mut trajectory = Trajectory::new();
        trajectory.insert(
            MetricKey::Loss,
            vec![scalar(cross_entropy(support_logits.clone(), &support_labels))],
        );
        trajectory.insert(
            MetricKey::Accu,
            vec![accuracy(support_logits, &support_labels)],
        );

        Adaptation::Direct {
            logits: negative_squared_distance(query, protos),
            trajectory,
        }
    }
}

impl<B: Backend> SupportEmbedding<B> for ProtoNet<B> {
    fn embed_support(&self, tasks: &TaskBatch<B>) -> Tensor<B, 2> {
        self.backbone.embed(tasks.flat_support())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_prototypes_are_class_means() {
        let device = Default::default();
        let features = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 3.0, 0.0, 0.0, 2.0, 0.0, 4.0], [1, 4, 2]),
            &device,
        );
        let protos = prototypes(features, &[vec![0, 0, 1, 1]], 2);
        let values: Vec<f32> = protos.to_data().iter::<f32>().collect();
        assert_eq!(values, vec![2.0, 0.0, 0.0, 3.0]);
    }

    #[test]
    fn test_negative_distance_prefers_nearest() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 3>::from_data(TensorData::new(vec![0.0f32, 0.0], [1, 1, 2]), &device);
        let b = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 3.0, 4.0], [1, 2, 2]),
            &device,
        );
        let logits: Vec<f32> = negative_squared_distance(a, b).to_data().iter::<f32>().collect();
        assert!((logits[0] + 1.0).abs() < 1e-6);
        assert!((logits[1] + 25.0).abs() < 1e-5);
    }
}
