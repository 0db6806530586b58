//! Dynamic voxelization.
//!
//! Groups the points of one sweep by the voxel they quantise into. Only
//! occupied voxels are materialised and there is no cap on points per voxel
//! or on voxel count, so dense regions never lose points. Each voxel is
//! aggregated exactly once: its point count, the mean point feature, and
//! the raw z extent consumed by the [`height`][crate::height] extractor.
//!
//! Zero-valued z is the "missing" marker for the minimum: it is skipped by
//! the min search (the voxel keeps [`MIN_HEIGHT_SENTINEL`] if all of its
//! points sit at exactly zero) but still takes part in the max search.

use std::collections::HashMap;

use fusiondet_types::{PointCloud, VoxelIndex};
use rayon::prelude::*;
use tracing::debug;

use crate::grid::VoxelGridConfig;
use crate::height::{MAX_HEIGHT_SENTINEL, MIN_HEIGHT_SENTINEL};

// ────────────────────────────────────────────────────────────────────────────
// SampleVoxels
// ────────────────────────────────────────────────────────────────────────────

/// Occupied voxels of a single sample, in first-seen order.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleVoxels {
    /// Width of each row of `features`.
    pub point_dim: usize,
    /// Unique voxel coordinates.
    pub coords: Vec<VoxelIndex>,
    /// Points aggregated into each voxel.
    pub num_points: Vec<u32>,
    /// Mean point row per voxel, voxel-major.
    pub features: Vec<f32>,
    /// Lowest non-zero raw z per voxel.
    pub z_min: Vec<f32>,
    /// Highest raw z per voxel.
    pub z_max: Vec<f32>,
    /// Voxel slot of every input point; `None` for points outside the range.
    pub point_to_voxel: Vec<Option<u32>>,
}

impl SampleVoxels {
    /// A sample with no voxels.
    pub fn empty(point_dim: usize) -> Self {
        Self {
            point_dim,
            coords: Vec::new(),
            num_points: Vec::new(),
            features: Vec::new(),
            z_min: Vec::new(),
            z_max: Vec::new(),
            point_to_voxel: Vec::new(),
        }
    }

    /// Number of occupied voxels.
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Mean feature row of voxel `slot`.
    pub fn feature(&self, slot: usize) -> Option<&[f32]> {
        let start = slot.checked_mul(self.point_dim)?;
        self.features.get(start..start + self.point_dim)
    }

    /// Points that fell inside the range.
    pub fn kept_points(&self) -> usize {
        self.point_to_voxel.iter().filter(|slot| slot.is_some()).count()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DynamicVoxelizer
// ────────────────────────────────────────────────────────────────────────────

/// Assigns points to voxels without any capacity limit.
#[derive(Debug, Clone)]
pub struct DynamicVoxelizer {
    grid: VoxelGridConfig,
}

impl DynamicVoxelizer {
    pub fn new(grid: VoxelGridConfig) -> Self {
        Self { grid }
    }

    pub fn grid(&self) -> &VoxelGridConfig {
        &self.grid
    }

    /// Voxelize one sweep.
    ///
    /// Points outside the configured range (or with non-finite coordinates)
    /// are dropped. An empty or fully out-of-range cloud yields an empty
    /// [`SampleVoxels`].
    pub fn voxelize(&self, cloud: &PointCloud) -> SampleVoxels {
        let dim = cloud.point_dim();
        let mut voxels = SampleVoxels::empty(dim);
        voxels.point_to_voxel.reserve(cloud.len());
        let mut slots: HashMap<VoxelIndex, u32> = HashMap::new();

        for point in cloud.iter() {
            let (x, y, z) = (point[0], point[1], point[2]);
            let Some(index) = self.grid.quantize(x, y, z) else {
                voxels.point_to_voxel.push(None);
                continue;
            };

            let slot = *slots.entry(index).or_insert_with(|| {
                voxels.coords.push(index);
                voxels.num_points.push(0);
                voxels.features.resize(voxels.features.len() + dim, 0.0);
                voxels.z_min.push(MIN_HEIGHT_SENTINEL);
                voxels.z_max.push(MAX_HEIGHT_SENTINEL);
                (voxels.coords.len() - 1) as u32
            });
            let s = slot as usize;

            voxels.num_points[s] += 1;
            for (acc, value) in voxels.features[s * dim..(s + 1) * dim]
                .iter_mut()
                .zip(point)
            {
                *acc += value;
            }
            if z != 0.0 {
                voxels.z_min[s] = voxels.z_min[s].min(z);
            }
            voxels.z_max[s] = voxels.z_max[s].max(z);
            voxels.point_to_voxel.push(Some(slot));
        }

        for (row, &count) in voxels.features.chunks_exact_mut(dim).zip(&voxels.num_points) {
            let inv = 1.0 / count as f32;
            row.iter_mut().for_each(|v| *v *= inv);
        }

        debug!(
            points = cloud.len(),
            kept = voxels.kept_points(),
            voxels = voxels.len(),
            "voxelized sample"
        );
        voxels
    }

    /// Voxelize every sample of a batch in parallel, preserving order.
    pub fn voxelize_batch(&self, clouds: &[PointCloud]) -> Vec<SampleVoxels> {
        clouds.par_iter().map(|cloud| self.voxelize(cloud)).collect()
    }
}
