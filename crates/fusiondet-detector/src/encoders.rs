//! Reference point-branch encoders.
//!
//! - [`MeanVoxelEncoder`] uses the voxelizer's per-voxel mean point as the
//!   voxel feature (a parameter-free "simple" encoder).
//! - [`BevScatter`] writes voxel features into a dense bird's-eye-view
//!   pseudo-image at full voxel resolution, keyed by voxel coordinate;
//!   voxels stacked in the same column are combined by elementwise max.

use fusiondet_types::{BatchVoxelCoord, FusionError};
use fusiondet_voxel::{VoxelBatch, VoxelGridConfig};

use crate::modules::{MiddleEncoder, VoxelEncoder, VoxelFeatures};
use crate::tensor::FeatureMap;

// ────────────────────────────────────────────────────────────────────────────
// MeanVoxelEncoder
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanVoxelEncoder;

impl VoxelEncoder for MeanVoxelEncoder {
    fn encode(&self, voxels: &VoxelBatch) -> Result<VoxelFeatures, FusionError> {
        Ok(VoxelFeatures {
            channels: voxels.point_dim(),
            data: voxels.features.clone(),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BevScatter
// ────────────────────────────────────────────────────────────────────────────

/// Dense `(B, C, grid_y, grid_x)` scatter.
#[derive(Debug, Clone)]
pub struct BevScatter {
    grid: VoxelGridConfig,
}

impl BevScatter {
    pub fn new(grid: &VoxelGridConfig) -> Self {
        Self { grid: grid.clone() }
    }
}

impl MiddleEncoder for BevScatter {
    fn scatter(
        &self,
        features: &VoxelFeatures,
        coords: &[BatchVoxelCoord],
        batch_size: usize,
    ) -> Result<FeatureMap, FusionError> {
        if features.len() != coords.len() {
            return Err(FusionError::ShapeMismatch(format!(
                "{} voxel features for {} coordinates",
                features.len(),
                coords.len()
            )));
        }

        let [nx, ny, _] = self.grid.grid_size();
        let channels = features.channels;
        let mut canvas =
            FeatureMap::filled([batch_size, channels, ny as usize, nx as usize], f32::NEG_INFINITY);
        let mut occupied = vec![false; batch_size * (ny as usize) * (nx as usize)];

        for (i, coord) in coords.iter().enumerate() {
            if coord.batch as usize >= batch_size {
                return Err(FusionError::BatchIndexOutOfRange {
                    index: coord.batch,
                    batch_size,
                });
            }
            self.grid.check_index(coord.voxel())?;

            let (b, y, x) = (coord.batch as usize, coord.y as usize, coord.x as usize);
            occupied[(b * ny as usize + y) * nx as usize + x] = true;
            if let Some(row) = features.row(i) {
                for (c, &value) in row.iter().enumerate() {
                    if let Some(cell) = canvas.get_mut(b, c, y, x) {
                        *cell = cell.max(value);
                    }
                }
            }
        }

        // Empty columns carry zeros, not the max-reduction identity.
        let plane = (ny as usize) * (nx as usize);
        for b in 0..batch_size {
            for c in 0..channels {
                let start = (b * channels + c) * plane;
                let column_flags = &occupied[b * plane..(b + 1) * plane];
                for (value, &hit) in canvas.data_mut()[start..start + plane]
                    .iter_mut()
                    .zip(column_flags)
                {
                    if !hit {
                        *value = 0.0;
                    }
                }
            }
        }

        Ok(canvas)
    }
}
