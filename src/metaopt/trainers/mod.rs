//! Trainer engine modules

pub mod adaptation;
pub mod checkpoint;
pub mod classical;
pub mod config;
pub mod contract;
pub mod driver;
pub mod episode;
pub mod grad;
pub mod loss_utils;
pub mod measurements;
pub mod meta;
pub mod meta_classical;
pub mod minmax;
pub mod run;
pub mod sink;
pub mod svrg;
pub mod swa;

pub use contract::{Adaptation, InnerLoopAlgorithm, RunMode};
pub use meta::MetaTrainer;
pub use run::{Episode, RunOptions, RunResult, Trainer};
