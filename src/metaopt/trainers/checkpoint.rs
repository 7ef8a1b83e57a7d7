//! Checkpoint cadence and persistence.
//!
//! Module parameters land at `<folder>/<prefix>_<step>.mpk` with the step
//! zero-padded; companion records (optimizer or generator state) land at
//! `<folder>/<prefix>_<component>_<step>.mpk`. Write failures propagate as
//! [`TrainerError::Checkpoint`].

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{CompactRecorder, FileRecorder, Record, Recorder};
use burn::tensor::backend::Backend;
use tracing::info;

use crate::metaopt::error::{Result, TrainerError};

/// When to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSchedule {
    /// Iteration `1` and every `every` iterations.
    Episodic { every: usize },
    /// Every `every` epochs.
    Epochal { every: usize },
}

impl CheckpointSchedule {
    pub fn should_save(&self, index: usize) -> bool {
        match *self {
            CheckpointSchedule::Episodic { every } => {
                index == 1 || (every > 0 && index % every == 0)
            }
            CheckpointSchedule::Epochal { every } => every > 0 && index % every == 0,
        }
    }
}

/// Persists module parameters and companion records.
pub trait Checkpointer<B: Backend> {
    fn save_module<M: Module<B>>(&mut self, step: usize, module: &M) -> Result<PathBuf>;

    fn save_record<R: Record<B>>(&mut self, step: usize, component: &str, record: R)
        -> Result<PathBuf>;
}

/// File checkpointer built on Burn's compact (half-precision MessagePack) recorder.
#[derive(Debug, Clone)]
pub struct FileCheckpointer {
    folder: PathBuf,
    prefix: String,
    width: usize,
    recorder: CompactRecorder,
}

impl FileCheckpointer {
    pub fn new(folder: impl AsRef<Path>, prefix: impl Into<String>, width: usize) -> Self {
        Self {
            folder: folder.as_ref().to_path_buf(),
            prefix: prefix.into(),
            width,
            recorder: CompactRecorder::new(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Same folder and width under a different prefix.
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self.clone()
        }
    }

    fn stem(&self, component: Option<&str>, step: usize) -> PathBuf {
        let name = match component {
            Some(component) => format!(
                "{}_{}_{:0width$}",
                self.prefix,
                component,
                step,
                width = self.width
            ),
            None => format!("{}_{:0width$}", self.prefix, step, width = self.width),
        };
        self.folder.join(name)
    }

    /// Full path of the module checkpoint for `step`, extension included.
    pub fn module_path<B: Backend>(&self, step: usize) -> PathBuf {
        self.stem(None, step)
            .with_extension(<CompactRecorder as FileRecorder<B>>::file_extension())
    }

    pub fn record_path<B: Backend>(&self, step: usize, component: &str) -> PathBuf {
        self.stem(Some(component), step)
            .with_extension(<CompactRecorder as FileRecorder<B>>::file_extension())
    }

    /// Load the module checkpoint written for `step` into `module`.
    pub fn load_module<B: Backend, M: Module<B>>(
        &self,
        step: usize,
        module: M,
        device: &B::Device,
    ) -> Result<M> {
        let stem = self.stem(None, step);
        module
            .load_file(stem.clone(), &self.recorder, device)
            .map_err(|source| TrainerError::Checkpoint { path: stem, source })
    }

    /// Load a companion record written by [`Checkpointer::save_record`].
    pub fn load_record<B: Backend, R: Record<B>>(
        &self,
        step: usize,
        component: &str,
        device: &B::Device,
    ) -> Result<R> {
        let stem = self.stem(Some(component), step);
        Recorder::<B>::load(&self.recorder, stem.clone(), device)
            .map_err(|source| TrainerError::Checkpoint { path: stem, source })
    }
}

impl<B: Backend> Checkpointer<B> for FileCheckpointer {
    fn save_module<M: Module<B>>(&mut self, step: usize, module: &M) -> Result<PathBuf> {
        fs::create_dir_all(&self.folder)?;
        let stem = self.stem(None, step);
        module
            .clone()
            .save_file(stem.clone(), &self.recorder)
            .map_err(|source| TrainerError::Checkpoint {
                path: stem.clone(),
                source,
            })?;
        let path = self.module_path::<B>(step);
        info!(path = %path.display(), step, "checkpoint written");
        Ok(path)
    }

    fn save_record<R: Record<B>>(
        &mut self,
        step: usize,
        component: &str,
        record: R,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.folder)?;
        let stem = self.stem(Some(component), step);
        Recorder::<B>::record(&self.recorder, record, stem.clone()).map_err(|source| {
            TrainerError::Checkpoint {
                path: stem.clone(),
                source,
            }
        })?;
        Ok(self.record_path::<B>(step, component))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_episodic_cadence_first_and_every_interval() {
        let schedule = CheckpointSchedule::Episodic { every: 1000 };
        let writes: Vec<usize> = (1..=2500).filter(|i| schedule.should_save(*i)).collect();
        assert_eq!(writes, vec![1, 1000, 2000]);
    }

    #[test]
    fn test_epochal_cadence() {
        let schedule = CheckpointSchedule::Epochal { every: 5 };
        let writes: Vec<usize> = (1..=12).filter(|e| schedule.should_save(*e)).collect();
        assert_eq!(writes, vec![5, 10]);
        assert!(!CheckpointSchedule::Epochal { every: 0 }.should_save(5));
    }

    #[test]
    fn test_paths_are_zero_padded() {
        let checkpointer = FileCheckpointer::new("/tmp/run", "protonet", 4);
        assert_eq!(
            checkpointer.module_path::<TestBackend>(7),
            PathBuf::from("/tmp/run/protonet_0007.mpk")
        );
        assert_eq!(
            checkpointer
                .with_prefix("classical")
                .record_path::<TestBackend>(15, "optim"),
            PathBuf::from("/tmp/run/classical_optim_0015.mpk")
        );
    }
}
