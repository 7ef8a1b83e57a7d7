//! Bi-level meta-learning trainers and their collaborators.

pub mod algorithms;
pub mod error;
pub mod settings;
pub mod synthetic;
pub mod trainers;
