//! Batch coordinate assembly.
//!
//! Concatenates per-sample voxel sets into one [`VoxelBatch`], prefixing each
//! coordinate with its sample's 0-based position. Sample order and voxel
//! order inside each sample are preserved.
//!
//! The batch size is the number of input samples. It is never recovered
//! from the coordinates themselves: a trailing sample with no voxels would
//! otherwise shrink the batch.

use std::ops::Range;

use fusiondet_types::{BatchVoxelCoord, FusionError};

use crate::voxelizer::SampleVoxels;

/// Voxels of a whole batch, concatenated sample after sample.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelBatch {
    batch_size: usize,
    point_dim: usize,
    /// Start offset of each sample's voxels, plus a trailing total.
    offsets: Vec<usize>,
    pub coords: Vec<BatchVoxelCoord>,
    pub num_points: Vec<u32>,
    pub features: Vec<f32>,
    pub z_min: Vec<f32>,
    pub z_max: Vec<f32>,
}

impl VoxelBatch {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn point_dim(&self) -> usize {
        self.point_dim
    }

    /// Total voxel count across all samples.
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    /// True when no sample contributed a voxel.
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Voxel count contributed by each sample.
    pub fn voxel_counts(&self) -> Vec<usize> {
        self.offsets.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Rows belonging to sample `batch`.
    pub fn sample_range(&self, batch: usize) -> Option<Range<usize>> {
        Some(*self.offsets.get(batch)?..*self.offsets.get(batch + 1)?)
    }

    /// Mean feature row of voxel `index`.
    pub fn feature(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.point_dim)?;
        self.features.get(start..start + self.point_dim)
    }
}

/// Concatenate per-sample voxels into one batch.
///
/// # Errors
///
/// Returns [`FusionError::ShapeMismatch`] when `samples` is empty or the
/// samples disagree on point width.
pub fn assemble_batch(samples: Vec<SampleVoxels>) -> Result<VoxelBatch, FusionError> {
    let Some(first) = samples.first() else {
        return Err(FusionError::ShapeMismatch(
            "cannot assemble a batch from zero samples".to_string(),
        ));
    };
    let point_dim = first.point_dim;
    let total: usize = samples.iter().map(SampleVoxels::len).sum();

    let mut batch = VoxelBatch {
        batch_size: samples.len(),
        point_dim,
        offsets: Vec::with_capacity(samples.len() + 1),
        coords: Vec::with_capacity(total),
        num_points: Vec::with_capacity(total),
        features: Vec::with_capacity(total * point_dim),
        z_min: Vec::with_capacity(total),
        z_max: Vec::with_capacity(total),
    };
    batch.offsets.push(0);

    for (i, sample) in samples.into_iter().enumerate() {
        if sample.point_dim != point_dim {
            return Err(FusionError::ShapeMismatch(format!(
                "sample {i} has point_dim {}, expected {point_dim}",
                sample.point_dim
            )));
        }
        let batch_index = u32::try_from(i).map_err(|_| {
            FusionError::ShapeMismatch(format!("batch index {i} does not fit in u32"))
        })?;

        batch
            .coords
            .extend(sample.coords.iter().map(|c| c.with_batch(batch_index)));
        batch.num_points.extend(sample.num_points);
        batch.features.extend(sample.features);
        batch.z_min.extend(sample.z_min);
        batch.z_max.extend(sample.z_max);
        batch.offsets.push(batch.coords.len());
    }

    Ok(batch)
}
