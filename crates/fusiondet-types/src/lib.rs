//! `fusiondet-types` – shared data model for the camera + LiDAR detector.
//!
//! Every crate in the workspace speaks in these types: raw point clouds,
//! voxel coordinates (with and without a batch index), per-sample image
//! metadata, detection results, and the workspace-wide [`FusionError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Per-sample metadata mapping handed over by the dataset loader.
///
/// Arbitrary key/value pairs; the image branch writes [`INPUT_SHAPE_KEY`].
pub type ImgMeta = Map<String, Value>;

/// Metadata key under which the image branch records `[height, width]`.
pub const INPUT_SHAPE_KEY: &str = "input_shape";

/// Number of values describing one 3-D box:
/// `(x, y, z, w, l, h, yaw, vx, vy)`.
pub const BOX_DIM: usize = 9;

/// A single predicted 3-D box.
pub type Box3d = [f32; BOX_DIM];

// ────────────────────────────────────────────────────────────────────────────
// PointCloud
// ────────────────────────────────────────────────────────────────────────────

/// One sensor sweep: an unordered set of fixed-width points.
///
/// Each row is `(x, y, z, ...features)`; all rows share `point_dim`.
/// Rows are stored back to back in a single flat buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    point_dim: usize,
    values: Vec<f32>,
}

impl PointCloud {
    /// Every point carries at least `x`, `y` and `z`.
    pub const MIN_POINT_DIM: usize = 3;

    /// Create an empty cloud whose rows will be `point_dim` wide.
    pub fn new(point_dim: usize) -> Result<Self, FusionError> {
        if point_dim < Self::MIN_POINT_DIM {
            return Err(FusionError::InvalidPointCloud(format!(
                "point_dim must be >= {}, got {point_dim}",
                Self::MIN_POINT_DIM
            )));
        }
        Ok(Self {
            point_dim,
            values: Vec::new(),
        })
    }

    /// Wrap an already-flattened buffer of `point_dim`-wide rows.
    pub fn from_flat(point_dim: usize, values: Vec<f32>) -> Result<Self, FusionError> {
        let mut cloud = Self::new(point_dim)?;
        if values.len() % point_dim != 0 {
            return Err(FusionError::InvalidPointCloud(format!(
                "buffer of {} values is not a multiple of point_dim {point_dim}",
                values.len()
            )));
        }
        cloud.values = values;
        Ok(cloud)
    }

    /// Build a cloud from individual rows, rejecting ragged input.
    pub fn from_rows<I, R>(point_dim: usize, rows: I) -> Result<Self, FusionError>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[f32]>,
    {
        let mut cloud = Self::new(point_dim)?;
        for row in rows {
            cloud.push(row.as_ref())?;
        }
        Ok(cloud)
    }

    /// Append one point.
    pub fn push(&mut self, row: &[f32]) -> Result<(), FusionError> {
        if row.len() != self.point_dim {
            return Err(FusionError::InvalidPointCloud(format!(
                "point {} has {} values, expected {}",
                self.len(),
                row.len(),
                self.point_dim
            )));
        }
        self.values.extend_from_slice(row);
        Ok(())
    }

    pub fn point_dim(&self) -> usize {
        self.point_dim
    }

    /// Number of points in the sweep.
    pub fn len(&self) -> usize {
        self.values.len() / self.point_dim
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Row `index`, or `None` when out of bounds.
    pub fn point(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.point_dim)?;
        self.values.get(start..start + self.point_dim)
    }

    /// Iterate over rows in storage order.
    pub fn iter(&self) -> std::slice::ChunksExact<'_, f32> {
        self.values.chunks_exact(self.point_dim)
    }

    pub fn as_flat(&self) -> &[f32] {
        &self.values
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Voxel coordinates
// ────────────────────────────────────────────────────────────────────────────

/// Quantised cell of one sample's voxel grid, in `(z, y, x)` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoxelIndex {
    /// Height layer.
    pub z: u32,
    pub y: u32,
    pub x: u32,
}

impl VoxelIndex {
    pub fn new(z: u32, y: u32, x: u32) -> Self {
        Self { z, y, x }
    }

    /// Prefix the sample's position in the batch.
    pub fn with_batch(self, batch: u32) -> BatchVoxelCoord {
        BatchVoxelCoord {
            batch,
            z: self.z,
            y: self.y,
            x: self.x,
        }
    }
}

/// Voxel coordinate after batch assembly: `(batch_index, z, y, x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchVoxelCoord {
    pub batch: u32,
    pub z: u32,
    pub y: u32,
    pub x: u32,
}

impl BatchVoxelCoord {
    /// Drop the batch index.
    pub fn voxel(&self) -> VoxelIndex {
        VoxelIndex::new(self.z, self.y, self.x)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Detection results
// ────────────────────────────────────────────────────────────────────────────

/// Post-processed output of a detection head for one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detections {
    pub boxes: Vec<Box3d>,
    pub scores: Vec<f32>,
    pub labels: Vec<u32>,
}

impl Detections {
    /// Bundle boxes, scores and labels, which must have matching lengths.
    pub fn new(boxes: Vec<Box3d>, scores: Vec<f32>, labels: Vec<u32>) -> Result<Self, FusionError> {
        if boxes.len() != scores.len() || boxes.len() != labels.len() {
            return Err(FusionError::ShapeMismatch(format!(
                "detections: {} boxes, {} scores, {} labels",
                boxes.len(),
                scores.len(),
                labels.len()
            )));
        }
        Ok(Self {
            boxes,
            scores,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }
}

/// Result for one sample, keyed by the modality that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pts_bbox: Option<Detections>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_bbox: Option<Detections>,
}

// ────────────────────────────────────────────────────────────────────────────
// Test-time inputs
// ────────────────────────────────────────────────────────────────────────────

/// A test-time argument as collated by the data loader.
///
/// Test inputs are expected as a list of augmented variants. A loader that
/// hands over a single un-wrapped batch produces [`Collated::Bare`], which
/// the detector rejects before doing any work.
#[derive(Debug, Clone, PartialEq)]
pub enum Collated<T> {
    /// One entry per test-time augmentation.
    Augmented(Vec<T>),
    /// A single batch that was not wrapped in an augmentation list.
    Bare(T),
}

impl<T> Collated<T> {
    /// Short description of the received shape, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Collated::Augmented(_) => "list",
            Collated::Bare(_) => "bare batch",
        }
    }

    /// Unwrap the augmentation list, or fail naming the offending argument.
    pub fn into_augmentations(self, name: &str) -> Result<Vec<T>, FusionError> {
        match self {
            Collated::Augmented(items) => Ok(items),
            bare @ Collated::Bare(_) => Err(FusionError::InputType {
                name: name.to_string(),
                received: bare.kind().to_string(),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type for configuration, input-contract, and geometry faults.
///
/// An empty point branch is not an error; it is reported as `None` by the
/// detector's feature extraction.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FusionError {
    #[error("Invalid configuration `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("{name} must be a list of augmentations, but got {received}")]
    InputType { name: String, received: String },

    #[error("num of augmentations ({points}) != num of image meta ({metas})")]
    AugmentationCountMismatch { points: usize, metas: usize },

    #[error("Voxel coordinate out of range on axis {axis}: index {index} >= bound {bound}")]
    CoordOutOfRange { axis: String, index: u32, bound: u32 },

    #[error("Batch index {index} out of range for batch of {batch_size} samples")]
    BatchIndexOutOfRange { index: u32, batch_size: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid point cloud: {0}")]
    InvalidPointCloud(String),

    #[error("Component `{component}` failed: {details}")]
    Component { component: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),
}
