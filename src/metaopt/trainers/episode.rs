//! Episode reshaping and per-task label remapping.
//!
//! The data-iteration collaborator yields flat batches with the 5-dimensional
//! convention `[batch_size * n_way, n_shot + n_query, C, H, W]`: each row
//! holds the samples of one class of one task, the first `n_shot` columns
//! are shots and the remaining `n_query` columns are queries.

use std::collections::{BTreeMap, BTreeSet};

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

use super::config::EpisodeConfig;

/// One flat batch as produced by the data iterator.
#[derive(Debug, Clone)]
pub struct EpisodeBatch<B: Backend> {
    /// `[batch_size * n_way, n_shot + n_query, C, H, W]`
    pub x: Tensor<B, 5>,
    /// Raw labels from the full label universe, `[batch_size * n_way, n_shot + n_query]`.
    pub y: Tensor<B, 2, Int>,
}

/// Plain `(x, y)` batch consumed by the classical trainers.
#[derive(Debug, Clone)]
pub struct LabeledBatch<B: Backend> {
    /// `[N, C, H, W]`
    pub x: Tensor<B, 4>,
    /// Raw labels, one per sample.
    pub y: Vec<i64>,
}

impl<B: Backend> LabeledBatch<B> {
    pub fn new(x: Tensor<B, 4>, y: Vec<i64>) -> Self {
        if x.dims()[0] != y.len() {
            panic!(
                "SHAPE ERROR: batch carries {} samples but {} labels",
                x.dims()[0],
                y.len()
            );
        }
        Self { x, y }
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Concatenate along the sample axis. `None` for an empty input.
    pub fn concat(batches: Vec<Self>) -> Option<Self> {
        if batches.is_empty() {
            return None;
        }
        let y = batches.iter().flat_map(|b| b.y.iter().copied()).collect();
        let x = Tensor::cat(batches.into_iter().map(|b| b.x).collect(), 0);
        Some(Self { x, y })
    }
}

/// Shot and query partitions of a flat episode batch with raw labels kept.
///
/// Used where labels must stay in the global label universe, e.g. when
/// fine-tuning a classifier over every class seen in an evaluation set.
///
/// # Panics
///
/// Panics with `SHAPE ERROR` under the same conditions as [`split_episode`].
pub fn raw_partitions<B: Backend>(
    batch: &EpisodeBatch<B>,
    config: &EpisodeConfig,
) -> (LabeledBatch<B>, LabeledBatch<B>) {
    let [rows, per_class, c, h, w] = batch.x.dims();
    let n_shot = config.n_shot;
    if per_class != n_shot + config.n_query {
        panic!(
            "SHAPE ERROR: episode batch has {} samples per class, expected n_shot + n_query = {} + {}",
            per_class, n_shot, config.n_query
        );
    }
    let n_query = per_class - n_shot;
    let raw = host_labels(&batch.y);

    let mut shot_y = Vec::with_capacity(rows * n_shot);
    let mut query_y = Vec::with_capacity(rows * n_query);
    for class_row in raw.chunks(per_class) {
        shot_y.extend_from_slice(&class_row[..n_shot]);
        query_y.extend_from_slice(&class_row[n_shot..]);
    }
    let shots = batch
        .x
        .clone()
        .narrow(1, 0, n_shot)
        .reshape([rows * n_shot, c, h, w]);
    let queries = batch
        .x
        .clone()
        .narrow(1, n_shot, n_query)
        .reshape([rows * n_query, c, h, w]);
    (LabeledBatch::new(shots, shot_y), LabeledBatch::new(queries, query_y))
}

/// Support / query partitions of a task batch with labels remapped per task.
#[derive(Debug, Clone)]
pub struct TaskBatch<B: Backend> {
    /// `[T, n_way * n_shot, C, H, W]`, class-major.
    pub support_x: Tensor<B, 5>,
    /// `[T, n_way * n_query, C, H, W]`, class-major.
    pub query_x: Tensor<B, 5>,
    /// Remapped labels in `0..n_way`, one vector per task.
    pub support_y: Vec<Vec<i64>>,
    pub query_y: Vec<Vec<i64>>,
    pub n_way: usize,
}

fn host_labels<B: Backend, const D: usize>(labels: &Tensor<B, D, Int>) -> Vec<i64> {
    labels.to_data().iter::<i64>().collect()
}

/// Dense `raw -> 0..k` map over the sorted distinct labels.
fn dense_label_map(raw: &[i64]) -> BTreeMap<i64, i64> {
    raw.iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(dense, raw)| (raw, dense as i64))
        .collect()
}

fn label_set(labels: &[i64]) -> BTreeSet<i64> {
    labels.iter().copied().collect()
}

/// Split a flat episode batch into support/query and remap labels per task.
///
/// # Panics
///
/// * `SHAPE ERROR` if the batch does not match `config`;
/// * `LABEL ERROR` if a task does not carry exactly `n_way` distinct raw
///   labels, or if its support and query label sets differ after remapping.
pub fn split_episode<B: Backend>(batch: &EpisodeBatch<B>, config: &EpisodeConfig) -> TaskBatch<B> {
    let [rows, per_class, c, h, w] = batch.x.dims();
    let n_way = config.n_way;
    let n_shot = config.n_shot;
    let n_query = config.n_query;

    if rows % n_way != 0 || rows / n_way != config.batch_size {
        panic!(
            "SHAPE ERROR: episode batch has {} class rows, expected batch_size * n_way = {} * {}",
            rows, config.batch_size, n_way
        );
    }
    if per_class != n_shot + n_query {
        panic!(
            "SHAPE ERROR: episode batch has {} samples per class, expected n_shot + n_query = {} + {}",
            per_class, n_shot, n_query
        );
    }
    if batch.y.dims() != [rows, per_class] {
        panic!(
            "SHAPE ERROR: label tensor {:?} does not match covariates [{}, {}]",
            batch.y.dims(),
            rows,
            per_class
        );
    }

    let tasks = rows / n_way;
    let grid = batch.x.clone().reshape([tasks, n_way, per_class, c * h, w]);
    let support_x = grid
        .clone()
        .narrow(2, 0, n_shot)
        .reshape([tasks, n_way * n_shot, c, h, w]);
    let query_x = grid
        .narrow(2, n_shot, n_query)
        .reshape([tasks, n_way * n_query, c, h, w]);

    let raw = host_labels(&batch.y);
    let task_len = n_way * per_class;
    let mut support_y = Vec::with_capacity(tasks);
    let mut query_y = Vec::with_capacity(tasks);

    for (task, task_raw) in raw.chunks(task_len).enumerate() {
        let map = dense_label_map(task_raw);
        if map.len() != n_way {
            panic!(
                "LABEL ERROR: task {} carries {} distinct labels, expected n_way = {}",
                task,
                map.len(),
                n_way
            );
        }

        let mut shots = Vec::with_capacity(n_way * n_shot);
        let mut queries = Vec::with_capacity(n_way * n_query);
        for class_row in task_raw.chunks(per_class) {
            shots.extend(class_row[..n_shot].iter().map(|l| map[l]));
            queries.extend(class_row[n_shot..].iter().map(|l| map[l]));
        }

        if label_set(&shots) != label_set(&queries) {
            panic!(
                "LABEL ERROR: task {} support labels {:?} differ from query labels {:?}",
                task,
                label_set(&shots),
                label_set(&queries)
            );
        }
        support_y.push(shots);
        query_y.push(queries);
    }

    TaskBatch {
        support_x,
        query_x,
        support_y,
        query_y,
        n_way,
    }
}

impl<B: Backend> TaskBatch<B> {
    /// Build a single-task batch from pre-assembled shots and queries.
    ///
    /// Labels are remapped jointly over the support set; the query set must
    /// use exactly the same raw labels.
    ///
    /// # Panics
    ///
    /// Panics with `LABEL ERROR` if the two raw label sets differ, or
    /// `SHAPE ERROR` if a label vector does not match its covariates.
    pub fn from_fixed_sets(
        support_x: Tensor<B, 4>,
        support_y: &[i64],
        query_x: Tensor<B, 4>,
        query_y: &[i64],
    ) -> Self {
        if support_x.dims()[0] != support_y.len() || query_x.dims()[0] != query_y.len() {
            panic!(
                "SHAPE ERROR: fixed sets carry {}/{} samples but {}/{} labels",
                support_x.dims()[0],
                query_x.dims()[0],
                support_y.len(),
                query_y.len()
            );
        }
        if label_set(support_y) != label_set(query_y) {
            panic!(
                "LABEL ERROR: fixed support labels {:?} differ from query labels {:?}",
                label_set(support_y),
                label_set(query_y)
            );
        }
        let map = dense_label_map(support_y);

        Self {
            support_x: support_x.unsqueeze_dim(0),
            query_x: query_x.unsqueeze_dim(0),
            support_y: vec![support_y.iter().map(|l| map[l]).collect()],
            query_y: vec![query_y.iter().map(|l| map[l]).collect()],
            n_way: map.len(),
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.support_y.len()
    }

    pub fn support_len(&self) -> usize {
        self.support_x.dims()[1]
    }

    pub fn query_len(&self) -> usize {
        self.query_x.dims()[1]
    }

    pub fn device(&self) -> B::Device {
        self.support_x.device()
    }

    /// The single task at `index` as a batch of one.
    pub fn task(&self, index: usize) -> Self {
        Self {
            support_x: self.support_x.clone().narrow(0, index, 1),
            query_x: self.query_x.clone().narrow(0, index, 1),
            support_y: vec![self.support_y[index].clone()],
            query_y: vec![self.query_y[index].clone()],
            n_way: self.n_way,
        }
    }

    /// Support covariates with task and sample axes merged: `[T * S, C * H * W]`.
    pub fn flat_support(&self) -> Tensor<B, 2> {
        flatten_samples(self.support_x.clone())
    }

    /// Query covariates with task and sample axes merged: `[T * Q, C * H * W]`.
    pub fn flat_query(&self) -> Tensor<B, 2> {
        flatten_samples(self.query_x.clone())
    }

    /// All query labels, task-major.
    pub fn flat_query_labels(&self) -> Vec<i64> {
        self.query_y.iter().flatten().copied().collect()
    }

    pub fn support_labels_tensor(&self) -> Tensor<B, 2, Int> {
        labels_tensor(&self.support_y, &self.device())
    }

    pub fn query_labels_tensor(&self) -> Tensor<B, 2, Int> {
        labels_tensor(&self.query_y, &self.device())
    }
}

fn flatten_samples<B: Backend>(x: Tensor<B, 5>) -> Tensor<B, 2> {
    let [t, n, c, h, w] = x.dims();
    x.reshape([t * n, c * h * w])
}

fn labels_tensor<B: Backend>(labels: &[Vec<i64>], device: &B::Device) -> Tensor<B, 2, Int> {
    let tasks = labels.len();
    let per_task = labels.first().map_or(0, Vec::len);
    let flat: Vec<i64> = labels.iter().flatten().copied().collect();
    Tensor::from_data(TensorData::new(flat, [tasks, per_task]), device)
}

/// One-hot encoding of host labels, `[labels.len(), num_classes]`.
///
/// # Panics
///
/// Panics with `LABEL ERROR` if a label falls outside `0..num_classes`.
pub fn one_hot<B: Backend>(labels: &[i64], num_classes: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut data = vec![0.0f32; labels.len() * num_classes];
    for (row, label) in labels.iter().enumerate() {
        if *label < 0 || *label as usize >= num_classes {
            panic!(
                "LABEL ERROR: label {} outside 0..{} at position {}",
                label, num_classes, row
            );
        }
        data[row * num_classes + *label as usize] = 1.0;
    }
    Tensor::from_data(TensorData::new(data, [labels.len(), num_classes]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn batch(raw_rows: &[[i64; 3]], n_way: usize) -> EpisodeBatch<TestBackend> {
        let device = Default::default();
        let rows = raw_rows.len();
        let x: Vec<f32> = (0..rows * 3 * 2).map(|i| i as f32).collect();
        let y: Vec<i64> = raw_rows.iter().flatten().copied().collect();
        assert_eq!(rows % n_way, 0);
        EpisodeBatch {
            x: Tensor::from_data(TensorData::new(x, [rows, 3, 1, 1, 2]), &device),
            y: Tensor::from_data(TensorData::new(y, [rows, 3]), &device),
        }
    }

    #[test]
    fn test_labels_are_remapped_per_task() {
        // Two tasks, 2-way, 1 shot + 2 queries; the tasks use disjoint raw labels.
        let batch = batch(&[[7, 7, 7], [3, 3, 3], [40, 40, 40], [12, 12, 12]], 2);
        let config = EpisodeConfig::new(2, 1, 2, 2);

        let tasks = split_episode(&batch, &config);

        assert_eq!(tasks.num_tasks(), 2);
        assert_eq!(tasks.support_y, vec![vec![1, 0], vec![1, 0]]);
        assert_eq!(tasks.query_y, vec![vec![1, 1, 0, 0], vec![1, 1, 0, 0]]);
        for (support, query) in tasks.support_y.iter().zip(&tasks.query_y) {
            let expected: BTreeSet<i64> = (0..2).collect();
            assert_eq!(label_set(support), expected);
            assert_eq!(label_set(query), expected);
        }
    }

    #[test]
    fn test_support_takes_first_shots_per_class() {
        let batch = batch(&[[0, 0, 0], [1, 1, 1]], 2);
        let config = EpisodeConfig::new(2, 1, 2, 1);

        let tasks = split_episode(&batch, &config);

        assert_eq!(tasks.support_x.dims(), [1, 2, 1, 1, 2]);
        assert_eq!(tasks.query_x.dims(), [1, 4, 1, 1, 2]);
        let support: Vec<f32> = tasks.support_x.to_data().iter::<f32>().collect();
        // Row 0 starts at 0, row 1 starts at 6 (3 samples * 2 values).
        assert_eq!(support, vec![0.0, 1.0, 6.0, 7.0]);
        let query: Vec<f32> = tasks.query_x.to_data().iter::<f32>().collect();
        assert_eq!(query, vec![2.0, 3.0, 4.0, 5.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    #[should_panic(expected = "LABEL ERROR")]
    fn test_mismatched_label_sets_panic() {
        // Class row 1 has a query sample labelled with a third class.
        let batch = batch(&[[5, 5, 5], [6, 6, 9]], 2);
        let config = EpisodeConfig::new(2, 1, 2, 1);
        split_episode(&batch, &config);
    }

    #[test]
    #[should_panic(expected = "SHAPE ERROR")]
    fn test_wrong_batch_size_panics() {
        let batch = batch(&[[0, 0, 0], [1, 1, 1]], 2);
        let config = EpisodeConfig::new(2, 1, 2, 3);
        split_episode(&batch, &config);
    }

    #[test]
    fn test_fixed_sets_remap_jointly() {
        let device = Default::default();
        let support = Tensor::<TestBackend, 4>::zeros([4, 1, 1, 2], &device);
        let query = Tensor::<TestBackend, 4>::zeros([2, 1, 1, 2], &device);

        let tasks = TaskBatch::from_fixed_sets(support, &[10, 20, 20, 10], query, &[20, 10]);

        assert_eq!(tasks.n_way, 2);
        assert_eq!(tasks.support_y, vec![vec![0, 1, 1, 0]]);
        assert_eq!(tasks.query_y, vec![vec![1, 0]]);
        assert_eq!(tasks.support_x.dims(), [1, 4, 1, 1, 2]);
    }

    #[test]
    fn test_raw_partitions_keep_universe_labels() {
        let batch = batch(&[[7, 7, 7], [3, 3, 3]], 2);
        let config = EpisodeConfig::new(2, 1, 2, 1);

        let (shots, queries) = raw_partitions(&batch, &config);

        assert_eq!(shots.y, vec![7, 3]);
        assert_eq!(queries.y, vec![7, 7, 3, 3]);
        assert_eq!(shots.x.dims(), [2, 1, 1, 2]);
        let values: Vec<f32> = shots.x.to_data().iter::<f32>().collect();
        assert_eq!(values, vec![0.0, 1.0, 6.0, 7.0]);

        let merged = LabeledBatch::concat(vec![shots, queries]).expect("two batches");
        assert_eq!(merged.len(), 6);
    }

    #[test]
    fn test_one_hot_rows() {
        let device = Default::default();
        let encoded = one_hot::<TestBackend>(&[2, 0], 3, &device);
        let values: Vec<f32> = encoded.to_data().iter::<f32>().collect();
        assert_eq!(values, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }
}
