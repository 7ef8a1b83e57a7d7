//! Per-class Gaussian feature generator for the min-max trainer.
//!
//! Class means and standard deviations are estimated on the host from
//! detached features; the learnable `offset` moves each synthesized class
//! feature by `offset * stddev` away from its mean.

use burn::config::Config;
use burn::module::{Ignored, Module, Param};
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor, TensorData,
};

use crate::metaopt::trainers::contract::FeatureGenerator;

#[derive(Config, Debug)]
pub struct GaussianClassGeneratorConfig {
    pub n_classes: usize,
    pub feature_dim: usize,
}

impl GaussianClassGeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GaussianClassGenerator<B> {
        GaussianClassGenerator {
            offset: Param::from_tensor(Tensor::zeros([self.n_classes, self.feature_dim], device)),
            stats: Ignored(ClassStats::new(self.n_classes, self.feature_dim)),
        }
    }
}

/// Host-side running class statistics.
#[derive(Debug, Clone)]
pub struct ClassStats {
    sum: Vec<Vec<f64>>,
    count: Vec<usize>,
    pub mean: Vec<Vec<f64>>,
    pub stddev: Vec<Vec<f64>>,
}

impl ClassStats {
    pub fn new(n_classes: usize, feature_dim: usize) -> Self {
        Self {
            sum: vec![vec![0.0; feature_dim]; n_classes],
            count: vec![0; n_classes],
            mean: vec![vec![0.0; feature_dim]; n_classes],
            stddev: vec![vec![0.0; feature_dim]; n_classes],
        }
    }

    fn clear_sums(&mut self) {
        for row in &mut self.sum {
            row.iter_mut().for_each(|v| *v = 0.0);
        }
        self.count.iter_mut().for_each(|c| *c = 0);
    }

    fn fold(&mut self, rows: &[f32], labels: &[i64], centered: bool) {
        let dim = self.sum.first().map_or(0, Vec::len);
        for (row, label) in rows.chunks(dim.max(1)).zip(labels) {
            let class = *label as usize;
            if class >= self.sum.len() {
                panic!(
                    "LABEL ERROR: generator label {} outside 0..{}",
                    label,
                    self.sum.len()
                );
            }
            for (j, value) in row.iter().enumerate() {
                let value = *value as f64;
                self.sum[class][j] += if centered {
                    (value - self.mean[class][j]).powi(2)
                } else {
                    value
                };
            }
            self.count[class] += 1;
        }
    }

    fn divided(&self) -> Vec<Vec<f64>> {
        self.sum
            .iter()
            .zip(&self.count)
            .map(|(row, count)| {
                let n = (*count).max(1) as f64;
                row.iter().map(|v| v / n).collect()
            })
            .collect()
    }
}

#[derive(Module, Debug)]
pub struct GaussianClassGenerator<B: Backend> {
    offset: Param<Tensor<B, 2>>,
    stats: Ignored<ClassStats>,
}

impl<B: Backend> GaussianClassGenerator<B> {
    pub fn stats(&self) -> &ClassStats {
        &self.stats.0
    }

    pub fn offset(&self) -> Tensor<B, 2> {
        self.offset.val()
    }
}

fn host_rows<B: Backend>(features: Tensor<B, 2>) -> Vec<f32> {
    features.to_data().iter::<f32>().collect()
}

fn to_tensor<B: Backend>(rows: &[Vec<f64>], device: &B::Device) -> Tensor<B, 2> {
    let n = rows.len();
    let d = rows.first().map_or(0, Vec::len);
    let values: Vec<f32> = rows.iter().flatten().map(|v| *v as f32).collect();
    Tensor::from_data(TensorData::new(values, [n, d]), device)
}

impl<B: AutodiffBackend> FeatureGenerator<B> for GaussianClassGenerator<B> {
    fn reset_statistics(&mut self) {
        let [n, d] = self.offset.val().dims();
        self.stats = Ignored(ClassStats::new(n, d));
    }

    fn update_mean(&mut self, features: Tensor<B, 2>, labels: &[i64]) {
        self.stats.0.fold(&host_rows(features), labels, false);
    }

    fn finalize_mean(&mut self) {
        self.stats.0.mean = self.stats.0.divided();
        self.stats.0.clear_sums();
    }

    fn update_stddev(&mut self, features: Tensor<B, 2>, labels: &[i64]) {
        self.stats.0.fold(&host_rows(features), labels, true);
    }

    fn finalize_stddev(&mut self) {
        self.stats.0.stddev = self
            .stats
            .0
            .divided()
            .into_iter()
            .map(|row| row.into_iter().map(f64::sqrt).collect())
            .collect();
        self.stats.0.clear_sums();
    }

    fn generate(&self, device: &B::Device) -> Tensor<B, 2> {
        let mean = to_tensor::<B>(&self.stats.0.mean, device);
        let stddev = to_tensor::<B>(&self.stats.0.stddev, device);
        mean + self.offset.val() * stddev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_two_pass_statistics() {
        let device = Default::default();
        let mut generator = GaussianClassGeneratorConfig::new(2, 2).init::<TestBackend>(&device);
        let features = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 0.0, 3.0, 0.0, 5.0, 5.0], [3, 2]),
            &device,
        );
        let labels = [0, 0, 1];

        generator.reset_statistics();
        generator.update_mean(features.clone(), &labels);
        generator.finalize_mean();
        generator.update_stddev(features, &labels);
        generator.finalize_stddev();

        assert_eq!(generator.stats().mean, vec![vec![2.0, 0.0], vec![5.0, 5.0]]);
        assert_eq!(generator.stats().stddev, vec![vec![1.0, 0.0], vec![0.0, 0.0]]);

        // Zero offset reproduces the class means.
        let generated: Vec<f32> = generator.generate(&device).to_data().iter::<f32>().collect();
        assert_eq!(generated, vec![2.0, 0.0, 5.0, 5.0]);
    }

    #[test]
    #[should_panic(expected = "LABEL ERROR")]
    fn test_out_of_range_label_panics() {
        let device = Default::default();
        let mut generator = GaussianClassGeneratorConfig::new(2, 1).init::<TestBackend>(&device);
        generator.update_mean(Tensor::zeros([1, 1], &device), &[4]);
    }
}
