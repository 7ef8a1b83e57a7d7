//! Reference feature extractor.
//!
//! A two-layer perceptron over flattened images with a linear classifier
//! head (used by the classical trainers) and a learnable logit scale.

use burn::config::Config;
use burn::module::{Ignored, Module, Param, ParamId};
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{
    activation,
    backend::{AutodiffBackend, Backend},
    Tensor,
};

use crate::metaopt::trainers::contract::{
    Backbone, FeatureClassifier, GeneratorConditioned, InnerModel,
};

#[derive(Config, Debug)]
pub struct MlpBackboneConfig {
    /// Flattened `C * H * W` input width.
    pub input_dim: usize,
    #[config(default = 32)]
    pub hidden_dim: usize,
    #[config(default = 16)]
    pub feature_dim: usize,
    /// Output width of the classifier head.
    #[config(default = 5)]
    pub n_classes: usize,
    #[config(default = 1.0)]
    pub initial_scale: f32,
}

impl MlpBackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpBackbone<B> {
        MlpBackbone {
            hidden: LinearConfig::new(self.input_dim, self.hidden_dim).init(device),
            output: LinearConfig::new(self.hidden_dim, self.feature_dim).init(device),
            classifier: LinearConfig::new(self.feature_dim, self.n_classes).init(device),
            scale: Param::from_tensor(Tensor::from_floats([self.initial_scale], device)),
        }
    }
}

#[derive(Module, Debug)]
pub struct MlpBackbone<B: Backend> {
    hidden: Linear<B>,
    output: Linear<B>,
    classifier: Linear<B>,
    scale: Param<Tensor<B, 1>>,
}

impl<B: Backend> MlpBackbone<B> {
    /// `[N, input_dim] -> [N, feature_dim]`
    pub fn embed(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let hidden = activation::relu(self.hidden.forward(x));
        self.output.forward(hidden)
    }

    /// `[N, C, H, W] -> [N, feature_dim]`
    pub fn embed_images(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let [n, c, h, w] = x.dims();
        self.embed(x.reshape([n, c * h * w]))
    }

    pub fn feature_dim(&self) -> usize {
        self.output.weight.dims()[1]
    }

    /// Per-layer activations, for embedding dumps.
    pub fn layer_outputs(&self, x: Tensor<B, 2>) -> Vec<Tensor<B, 2>> {
        let hidden = activation::relu(self.hidden.forward(x));
        let features = self.output.forward(hidden.clone());
        vec![hidden, features]
    }
}

impl<B: Backend> InnerModel<B> for MlpBackbone<B> {
    fn scale_factor(&self) -> Option<Tensor<B, 1>> {
        Some(self.scale.val())
    }

    fn head_param_ids(&self) -> Vec<ParamId> {
        let mut ids = vec![self.classifier.weight.id];
        ids.extend(self.classifier.bias.as_ref().map(|bias| bias.id));
        ids
    }
}

impl<B: Backend> Backbone<B> for MlpBackbone<B> {
    type Inner = Self;

    fn unwrap(&self) -> &Self::Inner {
        self
    }
}

impl<B: AutodiffBackend> FeatureClassifier<B> for MlpBackbone<B> {
    fn features(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.embed_images(x)
    }

    fn classify(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.classifier.forward(features)
    }
}

impl<B: AutodiffBackend> GeneratorConditioned<B> for MlpBackbone<B> {
    fn classify_with(&self, features: Tensor<B, 2>, class_features: Tensor<B, 2>) -> Tensor<B, 2> {
        let logits = features.matmul(class_features.transpose());
        logits * self.scale.val().reshape([1, 1])
    }
}

/// Data-parallel replica handle. Forward passes run on the primary replica.
#[derive(Module, Debug)]
pub struct Replicated<B: Backend> {
    primary: MlpBackbone<B>,
    replicas: Ignored<usize>,
}

impl<B: Backend> Replicated<B> {
    pub fn new(primary: MlpBackbone<B>, replicas: usize) -> Self {
        Self {
            primary,
            replicas: Ignored(replicas.max(1)),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas.0
    }
}

impl<B: Backend> Backbone<B> for Replicated<B> {
    type Inner = MlpBackbone<B>;

    fn unwrap(&self) -> &Self::Inner {
        &self.primary
    }
}
