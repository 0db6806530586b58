//! `fusiondet-voxel` – point-cloud voxelization and height extraction.
//!
//! Turns unordered, variable-size LiDAR sweeps into sparse, batch-aligned
//! voxel sets and the dense height grids the fusion head consumes.
//!
//! # Modules
//!
//! - [`grid`] – [`VoxelGridConfig`][grid::VoxelGridConfig]: validated voxel
//!   size, point-cloud range, grid size, and down-sampling factor.
//! - [`voxelizer`] – [`DynamicVoxelizer`][voxelizer::DynamicVoxelizer]:
//!   capacity-free voxelization producing one aggregate per occupied voxel.
//! - [`batch`] – [`assemble_batch`][batch::assemble_batch]: concatenates
//!   per-sample voxels, prefixing the batch index.
//! - [`height`] – [`HeightExtractor`][height::HeightExtractor]: per-cell
//!   min/max z over all sub-cells and height layers, with sequential and
//!   parallel reduction strategies.

pub mod batch;
pub mod grid;
pub mod height;
pub mod voxelizer;

pub use batch::{VoxelBatch, assemble_batch};
pub use grid::VoxelGridConfig;
pub use height::{
    HeightExtractor, HeightGrids, MAX_HEIGHT_SENTINEL, MIN_HEIGHT_SENTINEL, ReductionStrategy,
};
pub use voxelizer::{DynamicVoxelizer, SampleVoxels};
