//! `fusiondet-detector` – camera + LiDAR fusion detector orchestration.
//!
//! Wires the voxel core from `fusiondet-voxel` to pluggable learned
//! components and exposes the training and inference entry points.
//!
//! # Modules
//!
//! - [`tensor`] – [`FeatureMap`][tensor::FeatureMap] and
//!   [`ImageBatch`][tensor::ImageBatch] dense buffers.
//! - [`modules`] – collaborator traits (encoders, backbones, necks, heads,
//!   augmentation merger).
//! - [`encoders`] – reference voxel encoder and BEV scatter.
//! - [`trainability`] – enumerated freeze policy resolved at build time.
//! - [`detector`] – [`SparseFusionDetector`][detector::SparseFusionDetector]
//!   and its builder.
//! - [`config`] – TOML configuration with environment overrides.
//! - [`evaluation`] – [`run_single_pass_test`][evaluation::run_single_pass_test].
//! - [`telemetry`] – `tracing` subscriber setup.

pub mod config;
pub mod detector;
pub mod encoders;
pub mod evaluation;
pub mod modules;
pub mod telemetry;
pub mod tensor;
pub mod trainability;

pub use config::DetectorConfig;
pub use detector::{
    DetectorBuilder, ExtractedFeatures, SparseFusionDetector, TestBatch, TrainBatch,
    VoxelizedBatch,
};
pub use encoders::{BevScatter, MeanVoxelEncoder};
pub use evaluation::run_single_pass_test;
pub use modules::{
    AugmentationMerger, Backbone, FusionHead, GroundTruth, HeadOutput, ImageBackbone, ImageHead,
    ImageNeck, LossMap, MiddleEncoder, Neck, VoxelEncoder, VoxelFeatures,
};
pub use tensor::{FeatureMap, ImageBatch};
pub use trainability::{Component, Mode, TrainabilityFlags, TrainabilityPolicy};
