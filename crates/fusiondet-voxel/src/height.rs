//! Per-cell height extraction.
//!
//! Down-sampling the voxel grid by `out_size_factor` discards vertical
//! information. [`HeightExtractor`] keeps a cheap summary of it: for every
//! feature-map cell, the lowest and highest z observed across all voxels
//! that fold into that cell, over every fine sub-cell and every height
//! layer.
//!
//! The reduction runs in three steps:
//!
//! 1. Every voxel is mapped to a slot `(batch, y_cell, x_cell, subcell)`
//!    where `subcell = (y % f) * f + (x % f)` and `f = out_size_factor`.
//! 2. Per-voxel z extents are reduced into their slots with elementwise
//!    min/max accumulation. Two interchangeable strategies are provided
//!    (see [`ReductionStrategy`]); min/max being commutative and associative,
//!    both give identical grids.
//! 3. The subcell axis is collapsed, yielding `(batch, y_cells, x_cells)`.
//!
//! Untouched cells keep the sentinels [`MIN_HEIGHT_SENTINEL`] and
//! [`MAX_HEIGHT_SENTINEL`], which lie outside every valid z range.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use fusiondet_types::FusionError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::VoxelBatch;
use crate::grid::VoxelGridConfig;

/// Initial value of the min search. Above every valid z.
pub const MIN_HEIGHT_SENTINEL: f32 = 100.0;

/// Initial value of the max search. Below every valid z.
pub const MAX_HEIGHT_SENTINEL: f32 = -200.0;

// ────────────────────────────────────────────────────────────────────────────
// ReductionStrategy
// ────────────────────────────────────────────────────────────────────────────

/// How voxel z extents are reduced into their slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionStrategy {
    /// Walk height layers in order, accumulating into a hash map keyed by slot.
    #[default]
    Sequential,
    /// Sort `(slot, min, max)` triples and reduce each run in parallel.
    Parallel,
}

impl fmt::Display for ReductionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReductionStrategy::Sequential => write!(f, "sequential"),
            ReductionStrategy::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ReductionStrategy {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ReductionStrategy::Sequential),
            "parallel" => Ok(ReductionStrategy::Parallel),
            other => Err(FusionError::InvalidConfig {
                field: "height_reduction".to_string(),
                reason: format!("unknown strategy `{other}`"),
            }),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HeightGrids
// ────────────────────────────────────────────────────────────────────────────

/// Dense min/max height planes of shape `(batch, y_cells, x_cells)`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightGrids {
    batch: usize,
    y_cells: usize,
    x_cells: usize,
    min: Vec<f32>,
    max: Vec<f32>,
}

impl HeightGrids {
    /// Grids with every cell untouched.
    pub fn sentinel(batch: usize, y_cells: usize, x_cells: usize) -> Self {
        let n = batch * y_cells * x_cells;
        Self {
            batch,
            y_cells,
            x_cells,
            min: vec![MIN_HEIGHT_SENTINEL; n],
            max: vec![MAX_HEIGHT_SENTINEL; n],
        }
    }

    /// `(batch, y_cells, x_cells)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.batch, self.y_cells, self.x_cells)
    }

    fn offset(&self, b: usize, y: usize, x: usize) -> usize {
        (b * self.y_cells + y) * self.x_cells + x
    }

    /// Minimum height of a cell.
    ///
    /// # Panics
    ///
    /// Panics when the cell lies outside [`shape`][Self::shape].
    pub fn min_at(&self, b: usize, y: usize, x: usize) -> f32 {
        self.min[self.offset(b, y, x)]
    }

    /// Maximum height of a cell.
    ///
    /// # Panics
    ///
    /// Panics when the cell lies outside [`shape`][Self::shape].
    pub fn max_at(&self, b: usize, y: usize, x: usize) -> f32 {
        self.max[self.offset(b, y, x)]
    }

    /// True when at least one voxel contributed to the cell.
    pub fn is_touched(&self, b: usize, y: usize, x: usize) -> bool {
        let i = self.offset(b, y, x);
        self.min[i] != MIN_HEIGHT_SENTINEL || self.max[i] != MAX_HEIGHT_SENTINEL
    }

    /// Row-major min plane.
    pub fn min_plane(&self) -> &[f32] {
        &self.min
    }

    /// Row-major max plane.
    pub fn max_plane(&self) -> &[f32] {
        &self.max
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HeightExtractor
// ────────────────────────────────────────────────────────────────────────────

/// Per-voxel slot in the `(batch, y_cell, x_cell, subcell)` accumulator.
#[derive(Debug, Clone, Copy)]
struct VoxelSlot {
    layer: usize,
    slot: usize,
}

/// Builds [`HeightGrids`] from an assembled [`VoxelBatch`].
///
/// # Example
///
/// ```
/// use fusiondet_types::PointCloud;
/// use fusiondet_voxel::{assemble_batch, DynamicVoxelizer, HeightExtractor, ReductionStrategy, VoxelGridConfig};
///
/// let grid = VoxelGridConfig::new([1.0, 1.0, 1.0], [0.0, 0.0, -4.0, 8.0, 8.0, 4.0], [8, 8, 8], 4).unwrap();
/// let cloud = PointCloud::from_rows(3, [[0.5f32, 0.5, -1.5], [3.5, 3.5, 2.5]]).unwrap();
///
/// let voxelizer = DynamicVoxelizer::new(grid.clone());
/// let batch = assemble_batch(voxelizer.voxelize_batch(&[cloud])).unwrap();
/// let heights = HeightExtractor::new(grid, ReductionStrategy::Sequential).extract(&batch).unwrap();
///
/// assert_eq!(heights.shape(), (1, 2, 2));
/// assert_eq!(heights.min_at(0, 0, 0), -1.5);
/// assert_eq!(heights.max_at(0, 0, 0), 2.5);
/// assert!(!heights.is_touched(0, 1, 1));
/// ```
#[derive(Debug, Clone)]
pub struct HeightExtractor {
    grid: VoxelGridConfig,
    strategy: ReductionStrategy,
}

impl HeightExtractor {
    pub fn new(grid: VoxelGridConfig, strategy: ReductionStrategy) -> Self {
        Self { grid, strategy }
    }

    pub fn grid(&self) -> &VoxelGridConfig {
        &self.grid
    }

    pub fn strategy(&self) -> ReductionStrategy {
        self.strategy
    }

    /// Compute min/max height grids for every sample in `batch`.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::CoordOutOfRange`] or
    /// [`FusionError::BatchIndexOutOfRange`] when a coordinate does not fit
    /// the configured grid, and [`FusionError::ShapeMismatch`] when the
    /// batch's per-voxel arrays disagree in length.
    pub fn extract(&self, batch: &VoxelBatch) -> Result<HeightGrids, FusionError> {
        if batch.z_min.len() != batch.len() || batch.z_max.len() != batch.len() {
            return Err(FusionError::ShapeMismatch(format!(
                "{} coordinates but {} z_min / {} z_max entries",
                batch.len(),
                batch.z_min.len(),
                batch.z_max.len()
            )));
        }

        let slots = self.locate(batch)?;
        let subcells = self.grid.subcells();
        let slot_count = batch.batch_size() * self.grid.y_cells() * self.grid.x_cells() * subcells;

        let (slot_min, slot_max) = match self.strategy {
            ReductionStrategy::Sequential => self.reduce_sequential(batch, &slots, slot_count),
            ReductionStrategy::Parallel => reduce_parallel(batch, &slots, slot_count),
        };

        let mut grids =
            HeightGrids::sentinel(batch.batch_size(), self.grid.y_cells(), self.grid.x_cells());
        for (cell, chunk) in slot_min.chunks_exact(subcells).enumerate() {
            grids.min[cell] = chunk.iter().copied().fold(MIN_HEIGHT_SENTINEL, f32::min);
        }
        for (cell, chunk) in slot_max.chunks_exact(subcells).enumerate() {
            grids.max[cell] = chunk.iter().copied().fold(MAX_HEIGHT_SENTINEL, f32::max);
        }

        debug!(
            voxels = batch.len(),
            batch_size = batch.batch_size(),
            strategy = %self.strategy,
            "extracted height grids"
        );
        Ok(grids)
    }

    /// Map every voxel to its accumulator slot, checking bounds.
    fn locate(&self, batch: &VoxelBatch) -> Result<Vec<VoxelSlot>, FusionError> {
        let f = self.grid.out_size_factor();
        let (y_cells, x_cells) = (self.grid.y_cells(), self.grid.x_cells());
        let subcells = self.grid.subcells();

        batch
            .coords
            .iter()
            .map(|coord| {
                if coord.batch as usize >= batch.batch_size() {
                    return Err(FusionError::BatchIndexOutOfRange {
                        index: coord.batch,
                        batch_size: batch.batch_size(),
                    });
                }
                self.grid.check_index(coord.voxel())?;

                let (y_cell, x_cell) = ((coord.y / f) as usize, (coord.x / f) as usize);
                let subcell = ((coord.y % f) * f + coord.x % f) as usize;
                let slot = ((coord.batch as usize * y_cells + y_cell) * x_cells + x_cell)
                    * subcells
                    + subcell;
                Ok(VoxelSlot {
                    layer: coord.z as usize,
                    slot,
                })
            })
            .collect()
    }

    /// Layer-by-layer accumulation through a hash map.
    fn reduce_sequential(
        &self,
        batch: &VoxelBatch,
        slots: &[VoxelSlot],
        slot_count: usize,
    ) -> (Vec<f32>, Vec<f32>) {
        let mut layers: Vec<Vec<usize>> = vec![Vec::new(); self.grid.height_num() as usize];
        for (voxel, s) in slots.iter().enumerate() {
            layers[s.layer].push(voxel);
        }

        let mut acc: HashMap<usize, (f32, f32)> = HashMap::new();
        for layer in &layers {
            for &voxel in layer {
                let (lo, hi) = (batch.z_min[voxel], batch.z_max[voxel]);
                acc.entry(slots[voxel].slot)
                    .and_modify(|(mn, mx)| {
                        *mn = mn.min(lo);
                        *mx = mx.max(hi);
                    })
                    .or_insert((MIN_HEIGHT_SENTINEL.min(lo), MAX_HEIGHT_SENTINEL.max(hi)));
            }
        }

        let mut slot_min = vec![MIN_HEIGHT_SENTINEL; slot_count];
        let mut slot_max = vec![MAX_HEIGHT_SENTINEL; slot_count];
        for (slot, (mn, mx)) in acc {
            slot_min[slot] = mn;
            slot_max[slot] = mx;
        }
        (slot_min, slot_max)
    }
}

/// Segmented reduction: sort by slot, then reduce each run independently.
fn reduce_parallel(batch: &VoxelBatch, slots: &[VoxelSlot], slot_count: usize) -> (Vec<f32>, Vec<f32>) {
    let mut triples: Vec<(usize, f32, f32)> = slots
        .par_iter()
        .enumerate()
        .map(|(voxel, s)| (s.slot, batch.z_min[voxel], batch.z_max[voxel]))
        .collect();
    triples.par_sort_unstable_by_key(|t| t.0);

    let reduced: Vec<(usize, f32, f32)> = triples
        .par_chunk_by(|a, b| a.0 == b.0)
        .map(|run| {
            run.iter().fold(
                (run[0].0, MIN_HEIGHT_SENTINEL, MAX_HEIGHT_SENTINEL),
                |(slot, mn, mx), &(_, lo, hi)| (slot, mn.min(lo), mx.max(hi)),
            )
        })
        .collect();

    let mut slot_min = vec![MIN_HEIGHT_SENTINEL; slot_count];
    let mut slot_max = vec![MAX_HEIGHT_SENTINEL; slot_count];
    for (slot, mn, mx) in reduced {
        slot_min[slot] = mn;
        slot_max[slot] = mx;
    }
    (slot_min, slot_max)
}
