//! meta-opt-rs: bi-level meta-learning trainers for few-shot classification on Burn

pub mod metaopt;

pub use metaopt::error::{Result, TrainerError};
pub use metaopt::settings::{settings, Settings};

/// Shared builders for unit and integration tests
///
/// Synthetic episodes, small models and recording collaborators that the
/// trainer tests assemble into full runs.
pub mod test_utils;
