//! Seeded synthetic few-shot data.
//!
//! Every class of the label universe owns a Gaussian center; samples are
//! the center plus isotropic noise. Used by the demo binary, the tests and
//! the benches.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::metaopt::trainers::config::EpisodeConfig;
use crate::metaopt::trainers::episode::{EpisodeBatch, LabeledBatch};

/// `[C, H, W]` of one sample.
pub type SampleShape = [usize; 3];

#[derive(Debug, Clone)]
pub struct ClassCenters {
    centers: Vec<Vec<f32>>,
    noise: f32,
    shape: SampleShape,
}

impl ClassCenters {
    pub fn new(universe: usize, shape: SampleShape, noise: f32, rng: &mut ChaCha8Rng) -> Self {
        let dim = shape.iter().product::<usize>();
        let centers = (0..universe)
            .map(|_| (0..dim).map(|_| rng.sample::<f32, _>(StandardNormal)).collect())
            .collect();
        Self {
            centers,
            noise,
            shape,
        }
    }

    pub fn universe(&self) -> usize {
        self.centers.len()
    }

    pub fn dim(&self) -> usize {
        self.shape.iter().product()
    }

    fn sample_into(&self, class: usize, out: &mut Vec<f32>, rng: &mut ChaCha8Rng) {
        out.extend(
            self.centers[class]
                .iter()
                .map(|c| c + self.noise * rng.sample::<f32, _>(StandardNormal)),
        );
    }
}

/// Endless source of flat episode batches.
#[derive(Debug, Clone)]
pub struct SyntheticEpisodes {
    config: EpisodeConfig,
    centers: ClassCenters,
    rng: ChaCha8Rng,
}

impl SyntheticEpisodes {
    /// # Panics
    ///
    /// Panics with `CONFIG ERROR` if the universe has fewer than `n_way` classes.
    pub fn new(config: EpisodeConfig, universe: usize, shape: SampleShape, seed: u64) -> Self {
        if universe < config.n_way {
            panic!(
                "CONFIG ERROR: label universe of {} classes cannot host {}-way tasks",
                universe, config.n_way
            );
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let centers = ClassCenters::new(universe, shape, 0.3, &mut rng);
        Self {
            config,
            centers,
            rng,
        }
    }

    pub fn config(&self) -> &EpisodeConfig {
        &self.config
    }

    /// `[batch_size * n_way, n_shot + n_query, C, H, W]` with raw universe labels.
    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> EpisodeBatch<B> {
        let rows = self.config.batch_size * self.config.n_way;
        let per_class = self.config.samples_per_class();
        let [c, h, w] = self.centers.shape;
        let mut x = Vec::with_capacity(rows * per_class * self.centers.dim());
        let mut y = Vec::with_capacity(rows * per_class);

        for _ in 0..self.config.batch_size {
            let classes = sample(&mut self.rng, self.centers.universe(), self.config.n_way);
            for class in classes.iter() {
                for _ in 0..per_class {
                    self.centers.sample_into(class, &mut x, &mut self.rng);
                    y.push(class as i64);
                }
            }
        }
        EpisodeBatch {
            x: Tensor::from_data(TensorData::new(x, [rows, per_class, c, h, w]), device),
            y: Tensor::from_data(TensorData::new(y, [rows, per_class]), device),
        }
    }

    pub fn batches<B: Backend>(&mut self, count: usize, device: &B::Device) -> Vec<EpisodeBatch<B>> {
        (0..count).map(|_| self.next_batch(device)).collect()
    }
}

/// Labeled batches over `n_classes` classes, labels shifted by `label_offset`.
pub fn labeled_batches<B: Backend>(
    count: usize,
    batch_size: usize,
    n_classes: usize,
    label_offset: i64,
    shape: SampleShape,
    seed: u64,
    device: &B::Device,
) -> Vec<LabeledBatch<B>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let centers = ClassCenters::new(n_classes, shape, 0.3, &mut rng);
    let [c, h, w] = shape;
    (0..count)
        .map(|_| {
            let mut x = Vec::with_capacity(batch_size * centers.dim());
            let mut y = Vec::with_capacity(batch_size);
            for _ in 0..batch_size {
                let class = rng.gen_range(0..n_classes);
                centers.sample_into(class, &mut x, &mut rng);
                y.push(class as i64 + label_offset);
            }
            LabeledBatch::new(
                Tensor::from_data(TensorData::new(x, [batch_size, c, h, w]), device),
                y,
            )
        })
        .collect()
}
