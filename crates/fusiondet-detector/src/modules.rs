//! Contracts for the detector's external collaborators.
//!
//! The CNN backbones and necks, the transformer fusion head, the image
//! detection head, and test-time augmentation merging are black boxes to
//! this crate. Each is a trait object plugged into
//! [`SparseFusionDetector`][crate::detector::SparseFusionDetector]; only
//! the shapes flowing across the boundary are fixed here.
//!
//! Implementations report their own failures as
//! [`FusionError::Component`].

use std::collections::BTreeMap;

use fusiondet_types::{BatchVoxelCoord, Box3d, Detections, FusionError, ImgMeta};
use fusiondet_voxel::VoxelBatch;

use crate::tensor::{FeatureMap, ImageBatch};

/// Named scalar losses, e.g. `"loss_heatmap"`.
pub type LossMap = BTreeMap<String, f32>;

// ────────────────────────────────────────────────────────────────────────────
// Shared payloads
// ────────────────────────────────────────────────────────────────────────────

/// One encoded feature row per voxel, aligned with the batch coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelFeatures {
    pub channels: usize,
    pub data: Vec<f32>,
}

impl VoxelFeatures {
    /// Number of encoded voxels.
    pub fn len(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encoded row of voxel `index`.
    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.channels)?;
        self.data.get(start..start + self.channels)
    }
}

/// Raw output of the fusion head's forward pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadOutput {
    /// Per-layer prediction maps, opaque to the detector.
    pub predictions: Vec<FeatureMap>,
    /// Head-internal query features, passed untouched from `forward` to the
    /// same head's `loss`; the detector never reads them.
    pub pts_query_feat: Option<FeatureMap>,
    pub img_query_feat: Option<FeatureMap>,
}

/// Ground truth for one sample, consumed only by the heads' losses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruth {
    pub boxes_3d: Vec<Box3d>,
    pub labels_3d: Vec<u32>,
    /// Per-view 2-D boxes `(x1, y1, x2, y2)`.
    pub boxes_2d: Vec<[f32; 4]>,
    pub labels_2d: Vec<u32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Point branch
// ────────────────────────────────────────────────────────────────────────────

/// Per-voxel feature encoder.
pub trait VoxelEncoder: Send + Sync {
    fn encode(&self, voxels: &VoxelBatch) -> Result<VoxelFeatures, FusionError>;
}

/// Scatters sparse voxel features into a dense pseudo-image.
pub trait MiddleEncoder: Send + Sync {
    /// `batch_size` comes from the sample count, not from `coords`.
    fn scatter(
        &self,
        features: &VoxelFeatures,
        coords: &[BatchVoxelCoord],
        batch_size: usize,
    ) -> Result<FeatureMap, FusionError>;
}

/// 2-D convolutional backbone over the pseudo-image.
pub trait Backbone: Send + Sync {
    fn forward(&self, x: FeatureMap) -> Result<Vec<FeatureMap>, FusionError>;
}

/// Multi-scale neck; the first output scale receives the height channels.
pub trait Neck: Send + Sync {
    fn forward(&self, x: Vec<FeatureMap>) -> Result<Vec<FeatureMap>, FusionError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Image branch
// ────────────────────────────────────────────────────────────────────────────

/// Image backbone; always receives `(B * N_views, C, H, W)` input.
pub trait ImageBackbone: Send + Sync {
    fn forward(&self, images: &ImageBatch) -> Result<Vec<FeatureMap>, FusionError>;
}

pub trait ImageNeck: Send + Sync {
    fn forward(&self, x: Vec<FeatureMap>) -> Result<Vec<FeatureMap>, FusionError>;
}

/// Standalone 2-D detection head on image features.
pub trait ImageHead: Send + Sync {
    fn loss(
        &self,
        img_feats: &[FeatureMap],
        metas: &[ImgMeta],
        targets: &[GroundTruth],
    ) -> Result<LossMap, FusionError>;

    fn predict(
        &self,
        img_feats: &[FeatureMap],
        metas: &[ImgMeta],
        rescale: bool,
    ) -> Result<Vec<Detections>, FusionError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Fusion head & augmentation
// ────────────────────────────────────────────────────────────────────────────

/// Transformer-based camera + LiDAR detection head.
pub trait FusionHead: Send + Sync {
    /// `pts_feats[0]` carries the backbone channels plus two height channels.
    fn forward(
        &self,
        pts_feats: &[FeatureMap],
        img_feats: Option<&[FeatureMap]>,
        metas: &[ImgMeta],
    ) -> Result<HeadOutput, FusionError>;

    fn loss(
        &self,
        output: &HeadOutput,
        targets: &[GroundTruth],
        metas: &[ImgMeta],
    ) -> Result<LossMap, FusionError>;

    /// Decode one [`Detections`] per sample.
    fn get_bboxes(
        &self,
        output: &HeadOutput,
        metas: &[ImgMeta],
        rescale: bool,
    ) -> Result<Vec<Detections>, FusionError>;
}

/// Merges per-augmentation detections into one result per sample.
pub trait AugmentationMerger: Send + Sync {
    /// `per_aug[a][s]` is sample `s` under augmentation `a`.
    fn merge(
        &self,
        per_aug: Vec<Vec<Detections>>,
        metas: &[Vec<ImgMeta>],
    ) -> Result<Vec<Detections>, FusionError>;
}
