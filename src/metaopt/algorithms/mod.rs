//! Reference inner-loop algorithms, backbones and feature generators

pub mod backbone;
pub mod generator;
pub mod protonet;
pub mod ridge;

pub use backbone::{MlpBackbone, MlpBackboneConfig, Replicated};
pub use generator::{GaussianClassGenerator, GaussianClassGeneratorConfig};
pub use protonet::ProtoNet;
pub use ridge::RidgeHead;
