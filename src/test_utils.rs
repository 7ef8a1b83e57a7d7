// Shared builders for trainer tests
//
// Everything here runs on the NdArray backend so tests stay deterministic
// and device-free. Collaborators record what the engine asked of them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn::module::{Ignored, Module};
use burn::record::Record;
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Shape, Tensor, TensorData,
};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

use crate::metaopt::algorithms::{MlpBackbone, MlpBackboneConfig, ProtoNet};
use crate::metaopt::error::{Result, TrainerError};
use crate::metaopt::synthetic::{SampleShape, SyntheticEpisodes};
use crate::metaopt::trainers::checkpoint::Checkpointer;
use crate::metaopt::trainers::config::EpisodeConfig;
use crate::metaopt::trainers::contract::{
    Adaptation, InnerLoopAlgorithm, RunMode, SupportEmbedding,
};
use crate::metaopt::trainers::episode::{EpisodeBatch, TaskBatch};

/// Backend used by every trainer test.
pub type TestBackend = Autodiff<NdArray<f32>>;

/// Sample shape of the synthetic test data: `[1, 2, 3]`, six features.
pub const SAMPLE_SHAPE: SampleShape = [1, 2, 3];

/// Create an f32 tensor of any rank from a flat slice.
pub fn tensor_from_f32_vec<B: Backend, const D: usize>(
    data: &[f32],
    shape: &[usize],
    device: &B::Device,
) -> Tensor<B, D> {
    let expected: usize = shape.iter().product();
    assert_eq!(
        data.len(),
        expected,
        "Data length {} doesn't match shape {:?}",
        data.len(),
        shape
    );
    Tensor::from_data(TensorData::new(data.to_vec(), Shape::from(shape.to_vec())), device)
}

/// 3-way, 1-shot, 2-query episodes with `batch_size` tasks.
pub fn episode_config(batch_size: usize) -> EpisodeConfig {
    EpisodeConfig::new(3, 1, 2, batch_size)
}

pub fn backbone<B: Backend>(n_classes: usize, device: &B::Device) -> MlpBackbone<B> {
    let input_dim = SAMPLE_SHAPE.iter().product();
    MlpBackboneConfig::new(input_dim)
        .with_hidden_dim(8)
        .with_feature_dim(4)
        .with_n_classes(n_classes)
        .init(device)
}

/// `count` synthetic episode batches over a 10-class universe.
pub fn episodes(config: &EpisodeConfig, count: usize, seed: u64) -> Vec<EpisodeBatch<TestBackend>> {
    SyntheticEpisodes::new(config.clone(), 10, SAMPLE_SHAPE, seed).batches(count, &Default::default())
}

/// Snapshot of every float parameter, in declaration order.
pub fn parameter_values<B: Backend, M: Module<B>>(module: &M) -> Vec<Vec<f32>> {
    struct Collect<B: Backend> {
        values: Vec<Vec<f32>>,
        phantom: std::marker::PhantomData<B>,
    }
    impl<B: Backend> burn::module::ModuleVisitor<B> for Collect<B> {
        fn visit_float<const D: usize>(&mut self, _id: burn::module::ParamId, tensor: &Tensor<B, D>) {
            self.values.push(tensor.to_data().iter::<f32>().collect());
        }
    }
    let mut visitor = Collect::<B> {
        values: Vec::new(),
        phantom: std::marker::PhantomData,
    };
    module.visit(&mut visitor);
    visitor.values
}

/// Prototype classifier that counts its adaptation calls.
#[derive(Module, Debug)]
pub struct CountingProtoNet<B: Backend> {
    inner: ProtoNet<B>,
    calls: Ignored<Arc<AtomicUsize>>,
}

impl<B: Backend> CountingProtoNet<B> {
    pub fn new(backbone: MlpBackbone<B>) -> Self {
        Self {
            inner: ProtoNet::new(backbone),
            calls: Ignored(Arc::new(AtomicUsize::new(0))),
        }
    }

    /// Shared counter; clones of the module keep counting into it.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.0.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.0.load(Ordering::SeqCst)
    }
}

impl<B: AutodiffBackend> InnerLoopAlgorithm<B> for CountingProtoNet<B> {
    type Backbone = MlpBackbone<B>;

    fn backbone(&self) -> &Self::Backbone {
        self.inner.model()
    }

    fn inner_loop_adapt(
        &self,
        tasks: &TaskBatch<B>,
        scale: Option<Tensor<B, 1>>,
        mode: RunMode,
    ) -> Adaptation<B> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        self.inner.inner_loop_adapt(tasks, scale, mode)
    }
}

impl<B: Backend> SupportEmbedding<B> for CountingProtoNet<B> {
    fn embed_support(&self, tasks: &TaskBatch<B>) -> Tensor<B, 2> {
        self.inner.embed_support(tasks)
    }
}

/// Records checkpoint requests without touching the filesystem.
#[derive(Debug, Clone, Default)]
pub struct CountingCheckpointer {
    pub modules: Vec<usize>,
    pub records: Vec<(usize, String)>,
}

impl CountingCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Backend> Checkpointer<B> for CountingCheckpointer {
    fn save_module<M: Module<B>>(&mut self, step: usize, _module: &M) -> Result<PathBuf> {
        self.modules.push(step);
        Ok(PathBuf::from(format!("memory_{}", step)))
    }

    fn save_record<R: Record<B>>(&mut self, step: usize, component: &str, _record: R) -> Result<PathBuf> {
        self.records.push((step, component.to_string()));
        Ok(PathBuf::from(format!("memory_{}_{}", component, step)))
    }
}

/// Fails every write, for error-propagation tests.
#[derive(Debug, Clone, Default)]
pub struct FailingCheckpointer;

impl<B: Backend> Checkpointer<B> for FailingCheckpointer {
    fn save_module<M: Module<B>>(&mut self, _step: usize, _module: &M) -> Result<PathBuf> {
        Err(TrainerError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "checkpoint folder is read-only",
        )))
    }

    fn save_record<R: Record<B>>(&mut self, _step: usize, _component: &str, _record: R) -> Result<PathBuf> {
        Err(TrainerError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "checkpoint folder is read-only",
        )))
    }
}
