//! Voxel grid geometry.
//!
//! [`VoxelGridConfig`] is the single source of truth for how continuous
//! point coordinates map onto the discrete voxel grid and how that grid is
//! down-sampled into the detector's feature-map resolution. It is validated
//! once, at construction or deserialisation, and passed explicitly to every
//! component that needs it.
//!
//! | Field | Meaning |
//! |---|---|
//! | `voxel_size` | Edge length of one voxel along `(x, y, z)` in metres. |
//! | `point_cloud_range` | `(x_min, y_min, z_min, x_max, y_max, z_max)`. |
//! | `grid_size` | Number of voxels along `(x, y, z)`. |
//! | `out_size_factor` | Down-sampling ratio from voxel grid to feature map. |

use fusiondet_types::{FusionError, VoxelIndex};
use serde::{Deserialize, Serialize};

use crate::height::{MAX_HEIGHT_SENTINEL, MIN_HEIGHT_SENTINEL};

/// Allowed drift between `grid_size` and `(max - min) / voxel_size`, in voxels.
const GRID_TOLERANCE: f64 = 1e-3;

const AXES: [&str; 3] = ["x", "y", "z"];

// ────────────────────────────────────────────────────────────────────────────
// VoxelGridConfig
// ────────────────────────────────────────────────────────────────────────────

/// Validated voxel grid geometry.
///
/// # Example
///
/// ```
/// use fusiondet_voxel::grid::VoxelGridConfig;
///
/// let grid = VoxelGridConfig::new(
///     [0.1, 0.1, 0.2],
///     [-51.2, -51.2, -5.0, 51.2, 51.2, 3.0],
///     [1024, 1024, 40],
///     8,
/// )
/// .unwrap();
/// assert_eq!((grid.y_cells(), grid.x_cells()), (128, 128));
///
/// // A grid_size that disagrees with the range is rejected.
/// assert!(VoxelGridConfig::new(
///     [0.1, 0.1, 0.2],
///     [-51.2, -51.2, -5.0, 51.2, 51.2, 3.0],
///     [1000, 1024, 40],
///     8,
/// )
/// .is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawVoxelGridConfig")]
pub struct VoxelGridConfig {
    voxel_size: [f32; 3],
    point_cloud_range: [f32; 6],
    grid_size: [u32; 3],
    out_size_factor: u32,
}

/// Unvalidated mirror used only for deserialisation.
#[derive(Deserialize)]
struct RawVoxelGridConfig {
    voxel_size: [f32; 3],
    point_cloud_range: [f32; 6],
    grid_size: [u32; 3],
    out_size_factor: u32,
}

impl TryFrom<RawVoxelGridConfig> for VoxelGridConfig {
    type Error = FusionError;

    fn try_from(raw: RawVoxelGridConfig) -> Result<Self, Self::Error> {
        Self::new(
            raw.voxel_size,
            raw.point_cloud_range,
            raw.grid_size,
            raw.out_size_factor,
        )
    }
}

impl Default for VoxelGridConfig {
    /// nuScenes geometry: 0.075 m pillars over ±54 m, 0.2 m layers over
    /// `[-5, 3]` m, feature map down-sampled by 8.
    fn default() -> Self {
        Self {
            voxel_size: [0.075, 0.075, 0.2],
            point_cloud_range: [-54.0, -54.0, -5.0, 54.0, 54.0, 3.0],
            grid_size: [1440, 1440, 40],
            out_size_factor: 8,
        }
    }
}

impl VoxelGridConfig {
    /// Build and validate a grid.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::InvalidConfig`] when any size is non-positive,
    /// a range axis is empty, `grid_size` disagrees with the range and voxel
    /// size, the x/y grid is not divisible by `out_size_factor`, or the
    /// z range reaches the height sentinels.
    pub fn new(
        voxel_size: [f32; 3],
        point_cloud_range: [f32; 6],
        grid_size: [u32; 3],
        out_size_factor: u32,
    ) -> Result<Self, FusionError> {
        let config = Self {
            voxel_size,
            point_cloud_range,
            grid_size,
            out_size_factor,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-run every construction check.
    pub fn validate(&self) -> Result<(), FusionError> {
        if self.out_size_factor == 0 {
            return Err(invalid("out_size_factor", "must be positive"));
        }

        for (axis, name) in AXES.iter().enumerate() {
            let size = self.voxel_size[axis];
            if !size.is_finite() || size <= 0.0 {
                return Err(invalid(
                    "voxel_size",
                    format!("{name} size must be finite and positive, got {size}"),
                ));
            }

            let (lo, hi) = (
                self.point_cloud_range[axis],
                self.point_cloud_range[axis + 3],
            );
            if !lo.is_finite() || !hi.is_finite() || hi <= lo {
                return Err(invalid(
                    "point_cloud_range",
                    format!("{name} range [{lo}, {hi}] is empty or non-finite"),
                ));
            }

            let cells = self.grid_size[axis];
            if cells == 0 {
                return Err(invalid("grid_size", format!("{name} must be positive")));
            }
            let expected = (f64::from(hi) - f64::from(lo)) / f64::from(size);
            if (expected - f64::from(cells)).abs() > GRID_TOLERANCE {
                return Err(invalid(
                    "grid_size",
                    format!("{name} has {cells} cells but range / voxel_size = {expected:.4}"),
                ));
            }
        }

        for (axis, name) in AXES.iter().take(2).enumerate() {
            if self.grid_size[axis] % self.out_size_factor != 0 {
                return Err(invalid(
                    "grid_size",
                    format!(
                        "{name} size {} is not divisible by out_size_factor {}",
                        self.grid_size[axis], self.out_size_factor
                    ),
                ));
            }
        }

        let (z_lo, z_hi) = (self.point_cloud_range[2], self.point_cloud_range[5]);
        if z_lo <= MAX_HEIGHT_SENTINEL || z_hi >= MIN_HEIGHT_SENTINEL {
            return Err(invalid(
                "point_cloud_range",
                format!(
                    "z range [{z_lo}, {z_hi}] must lie strictly inside \
                     ({MAX_HEIGHT_SENTINEL}, {MIN_HEIGHT_SENTINEL})"
                ),
            ));
        }

        Ok(())
    }

    pub fn voxel_size(&self) -> [f32; 3] {
        self.voxel_size
    }

    pub fn point_cloud_range(&self) -> [f32; 6] {
        self.point_cloud_range
    }

    /// Voxel counts along `(x, y, z)`.
    pub fn grid_size(&self) -> [u32; 3] {
        self.grid_size
    }

    pub fn out_size_factor(&self) -> u32 {
        self.out_size_factor
    }

    /// Number of height layers.
    pub fn height_num(&self) -> u32 {
        self.grid_size[2]
    }

    /// Feature-map width after down-sampling.
    pub fn x_cells(&self) -> usize {
        (self.grid_size[0] / self.out_size_factor) as usize
    }

    /// Feature-map height after down-sampling.
    pub fn y_cells(&self) -> usize {
        (self.grid_size[1] / self.out_size_factor) as usize
    }

    /// Fine voxels folded into one feature-map cell.
    pub fn subcells(&self) -> usize {
        (self.out_size_factor * self.out_size_factor) as usize
    }

    /// Return a copy with a different down-sampling factor, re-validated.
    pub fn with_out_size_factor(&self, out_size_factor: u32) -> Result<Self, FusionError> {
        Self::new(
            self.voxel_size,
            self.point_cloud_range,
            self.grid_size,
            out_size_factor,
        )
    }

    /// Quantise a location, or `None` when it falls outside the range.
    ///
    /// Cells are `floor((p - min) / voxel_size)`; a point lying exactly on
    /// the upper bound is outside.
    pub fn quantize(&self, x: f32, y: f32, z: f32) -> Option<VoxelIndex> {
        let ix = self.axis_cell(x, 0)?;
        let iy = self.axis_cell(y, 1)?;
        let iz = self.axis_cell(z, 2)?;
        Some(VoxelIndex::new(iz, iy, ix))
    }

    fn axis_cell(&self, value: f32, axis: usize) -> Option<u32> {
        if !value.is_finite() {
            return None;
        }
        let cell = ((value - self.point_cloud_range[axis]) / self.voxel_size[axis]).floor();
        if cell < 0.0 || cell >= self.grid_size[axis] as f32 {
            return None;
        }
        Some(cell as u32)
    }

    /// Fail when `index` lies outside the grid.
    ///
    /// Out-of-range coordinates indicate a misconfigured voxel size or range
    /// and are never clipped.
    pub fn check_index(&self, index: VoxelIndex) -> Result<(), FusionError> {
        let checks = [
            ("x", index.x, self.grid_size[0]),
            ("y", index.y, self.grid_size[1]),
            ("z", index.z, self.grid_size[2]),
        ];
        for (axis, value, bound) in checks {
            if value >= bound {
                return Err(FusionError::CoordOutOfRange {
                    axis: axis.to_string(),
                    index: value,
                    bound,
                });
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> FusionError {
    FusionError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}
