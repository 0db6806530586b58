//! [`SparseFusionDetector`] – camera + LiDAR 3-D detector orchestration.
//!
//! The detector owns the geometric core (voxelizer, batch assembly, height
//! extraction) and drives the learned collaborators from [`crate::modules`]:
//!
//! 1. **Image branch** – normalise `(B, N, C, H, W)` input to
//!    `(B * N, C, H, W)`, record the per-view input resolution into every
//!    sample's metadata, run the image backbone and neck.
//! 2. **Point branch** – voxelize every sample, assemble one batch, extract
//!    the min/max height grids, encode voxels, scatter to a pseudo-image, run
//!    the point backbone and neck, and append the two height grids as extra
//!    channels on the first neck scale.
//! 3. **Head** – hand both feature sets to the fusion head for losses
//!    (training) or decoded boxes (inference).
//!
//! An empty point branch is not an error. When no point survives
//! voxelization anywhere in the batch, [`SparseFusionDetector::extract_pts_feat`]
//! returns `None` and the point head is skipped.
//!
//! Collaborator traits carry no mode argument. The resolved per-component
//! [`Mode`] (frozen backbone parts stay in eval while training) is exposed
//! through [`SparseFusionDetector::component_modes`]; collaborators with
//! mode-dependent layers must be configured from it by the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! let detector = DetectorBuilder::new(DetectorConfig::default(), Box::new(my_backbone))
//!     .with_pts_neck(Box::new(my_neck))
//!     .with_pts_bbox(Box::new(my_head))
//!     .build()?;
//! let results = detector.forward_test(batch, true)?;
//! ```

use fusiondet_types::{
    Collated, Detections, FusionError, INPUT_SHAPE_KEY, ImgMeta, PointCloud, SampleResult,
};
use fusiondet_voxel::{
    DynamicVoxelizer, HeightExtractor, HeightGrids, VoxelBatch, VoxelGridConfig, assemble_batch,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::encoders::{BevScatter, MeanVoxelEncoder};
use crate::modules::{
    AugmentationMerger, Backbone, FusionHead, GroundTruth, ImageBackbone, ImageHead, ImageNeck,
    LossMap, MiddleEncoder, Neck, VoxelEncoder,
};
use crate::tensor::{FeatureMap, ImageBatch};
use crate::trainability::{Component, Mode, TrainabilityPolicy};

// ─────────────────────────────────────────────────────────────────────────────
// Inputs and intermediate results
// ─────────────────────────────────────────────────────────────────────────────

/// Output of [`SparseFusionDetector::voxelize`].
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelizedBatch {
    pub voxels: VoxelBatch,
    pub heights: HeightGrids,
}

/// Image and point features of one batch; either branch may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedFeatures {
    pub img_feats: Option<Vec<FeatureMap>>,
    pub pts_feats: Option<Vec<FeatureMap>>,
}

/// One training batch.
#[derive(Debug, Clone)]
pub struct TrainBatch {
    pub points: Vec<PointCloud>,
    pub img: Option<ImageBatch>,
    pub img_metas: Vec<ImgMeta>,
    /// One entry per sample.
    pub targets: Vec<GroundTruth>,
}

/// One inference batch as handed over by a test loader.
///
/// `points` and `img_metas` must both be augmentation lists; `img`, when
/// present, carries one image batch per augmentation.
#[derive(Debug, Clone)]
pub struct TestBatch {
    pub points: Collated<Vec<PointCloud>>,
    pub img_metas: Collated<Vec<ImgMeta>>,
    pub img: Option<Vec<ImageBatch>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Assembles a [`SparseFusionDetector`] from a config and its collaborators.
///
/// The point backbone is mandatory. The voxel encoder and middle encoder
/// default to [`MeanVoxelEncoder`] and [`BevScatter`]; every other branch is
/// optional.
pub struct DetectorBuilder {
    config: DetectorConfig,
    pts_backbone: Box<dyn Backbone>,
    pts_voxel_encoder: Option<Box<dyn VoxelEncoder>>,
    pts_middle_encoder: Option<Box<dyn MiddleEncoder>>,
    pts_neck: Option<Box<dyn Neck>>,
    pts_bbox_head: Option<Box<dyn FusionHead>>,
    img_backbone: Option<Box<dyn ImageBackbone>>,
    img_neck: Option<Box<dyn ImageNeck>>,
    img_bbox_head: Option<Box<dyn ImageHead>>,
    aug_merger: Option<Box<dyn AugmentationMerger>>,
}

impl DetectorBuilder {
    pub fn new(config: DetectorConfig, pts_backbone: Box<dyn Backbone>) -> Self {
        Self {
            config,
            pts_backbone,
            pts_voxel_encoder: None,
            pts_middle_encoder: None,
            pts_neck: None,
            pts_bbox_head: None,
            img_backbone: None,
            img_neck: None,
            img_bbox_head: None,
            aug_merger: None,
        }
    }

    pub fn with_voxel_encoder(mut self, encoder: Box<dyn VoxelEncoder>) -> Self {
        self.pts_voxel_encoder = Some(encoder);
        self
    }

    pub fn with_middle_encoder(mut self, encoder: Box<dyn MiddleEncoder>) -> Self {
        self.pts_middle_encoder = Some(encoder);
        self
    }

    pub fn with_pts_neck(mut self, neck: Box<dyn Neck>) -> Self {
        self.pts_neck = Some(neck);
        self
    }

    pub fn with_pts_bbox(mut self, head: Box<dyn FusionHead>) -> Self {
        self.pts_bbox_head = Some(head);
        self
    }

    pub fn with_img_backbone(mut self, backbone: Box<dyn ImageBackbone>) -> Self {
        self.img_backbone = Some(backbone);
        self
    }

    pub fn with_img_neck(mut self, neck: Box<dyn ImageNeck>) -> Self {
        self.img_neck = Some(neck);
        self
    }

    pub fn with_img_bbox(mut self, head: Box<dyn ImageHead>) -> Self {
        self.img_bbox_head = Some(head);
        self
    }

    pub fn with_aug_merger(mut self, merger: Box<dyn AugmentationMerger>) -> Self {
        self.aug_merger = Some(merger);
        self
    }

    /// Validate the config and resolve the trainability policy.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::InvalidConfig`] for an invalid grid or an image
    /// neck without an image backbone.
    pub fn build(self) -> Result<SparseFusionDetector, FusionError> {
        self.config.validate()?;
        if self.img_neck.is_some() && self.img_backbone.is_none() {
            return Err(FusionError::InvalidConfig {
                field: "img_neck".to_string(),
                reason: "an image neck requires an image backbone".to_string(),
            });
        }

        let grid = self.config.grid.clone();
        let policy = TrainabilityPolicy::resolve(&self.config.trainability);
        debug!(
            frozen = ?policy.frozen_components(),
            height_reduction = %self.config.height_reduction,
            "trainability policy resolved"
        );

        Ok(SparseFusionDetector {
            voxelizer: DynamicVoxelizer::new(grid.clone()),
            height_extractor: HeightExtractor::new(grid.clone(), self.config.height_reduction),
            pts_voxel_encoder: self
                .pts_voxel_encoder
                .unwrap_or_else(|| Box::new(MeanVoxelEncoder)),
            pts_middle_encoder: self
                .pts_middle_encoder
                .unwrap_or_else(|| Box::new(BevScatter::new(&grid))),
            pts_backbone: self.pts_backbone,
            pts_neck: self.pts_neck,
            pts_bbox_head: self.pts_bbox_head,
            img_backbone: self.img_backbone,
            img_neck: self.img_neck,
            img_bbox_head: self.img_bbox_head,
            aug_merger: self.aug_merger,
            policy,
            mode: Mode::Train,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SparseFusionDetector
// ─────────────────────────────────────────────────────────────────────────────

pub struct SparseFusionDetector {
    voxelizer: DynamicVoxelizer,
    height_extractor: HeightExtractor,
    pts_voxel_encoder: Box<dyn VoxelEncoder>,
    pts_middle_encoder: Box<dyn MiddleEncoder>,
    pts_backbone: Box<dyn Backbone>,
    pts_neck: Option<Box<dyn Neck>>,
    pts_bbox_head: Option<Box<dyn FusionHead>>,
    img_backbone: Option<Box<dyn ImageBackbone>>,
    img_neck: Option<Box<dyn ImageNeck>>,
    img_bbox_head: Option<Box<dyn ImageHead>>,
    aug_merger: Option<Box<dyn AugmentationMerger>>,
    policy: TrainabilityPolicy,
    mode: Mode,
}

impl SparseFusionDetector {
    pub fn grid(&self) -> &VoxelGridConfig {
        self.voxelizer.grid()
    }

    pub fn policy(&self) -> &TrainabilityPolicy {
        &self.policy
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Mode `component` actually runs in, honouring eval-pinned frozen parts.
    ///
    /// Collaborators are not told their mode; whoever owns the learned
    /// implementation applies this value to it.
    pub fn component_mode(&self, component: Component) -> Mode {
        self.policy.mode_of(component, self.mode)
    }

    /// Effective mode of every component, in [`Component::ALL`] order.
    pub fn component_modes(&self) -> Vec<(Component, Mode)> {
        Component::ALL
            .iter()
            .map(|&c| (c, self.component_mode(c)))
            .collect()
    }

    pub fn with_pts_bbox(&self) -> bool {
        self.pts_bbox_head.is_some()
    }

    pub fn with_img_backbone(&self) -> bool {
        self.img_backbone.is_some()
    }

    pub fn with_img_bbox(&self) -> bool {
        self.img_bbox_head.is_some()
    }

    // ── image branch ─────────────────────────────────────────────────────────

    /// Run the image backbone and neck.
    ///
    /// Records `input_shape = [H, W]` into every entry of `img_metas`.
    /// Returns `None` when there is no image backbone or no image.
    pub fn extract_img_feat(
        &self,
        img: Option<ImageBatch>,
        img_metas: &mut [ImgMeta],
    ) -> Result<Option<Vec<FeatureMap>>, FusionError> {
        let (Some(backbone), Some(img)) = (self.img_backbone.as_ref(), img) else {
            return Ok(None);
        };

        let (h, w) = img.input_shape();
        for meta in img_metas.iter_mut() {
            meta.insert(INPUT_SHAPE_KEY.to_string(), json!([h, w]));
        }

        let img = img.flatten_views();
        let mut feats = backbone.forward(&img)?;
        if let Some(neck) = self.img_neck.as_ref() {
            feats = neck.forward(feats)?;
        }
        Ok(Some(feats))
    }

    // ── point branch ─────────────────────────────────────────────────────────

    /// Voxelize every sample, assemble the batch, and extract height grids.
    pub fn voxelize(&self, points: &[PointCloud]) -> Result<VoxelizedBatch, FusionError> {
        let voxels = assemble_batch(self.voxelizer.voxelize_batch(points))?;
        let heights = self.height_extractor.extract(&voxels)?;
        Ok(VoxelizedBatch { voxels, heights })
    }

    /// Point-branch features with the height grids appended to scale 0.
    ///
    /// Returns `None` when there is no point head or when no point in the
    /// whole batch fell inside the grid.
    pub fn extract_pts_feat(
        &self,
        points: &[PointCloud],
    ) -> Result<Option<Vec<FeatureMap>>, FusionError> {
        if !self.with_pts_bbox() {
            return Ok(None);
        }

        let VoxelizedBatch { voxels, heights } = self.voxelize(points)?;
        if voxels.is_empty() {
            warn!(
                batch_size = voxels.batch_size(),
                "no points inside the grid; point branch contributes nothing"
            );
            return Ok(None);
        }

        let voxel_features = self.pts_voxel_encoder.encode(&voxels)?;
        let canvas =
            self.pts_middle_encoder
                .scatter(&voxel_features, &voxels.coords, voxels.batch_size())?;
        let mut feats = self.pts_backbone.forward(canvas)?;
        if let Some(neck) = self.pts_neck.as_ref() {
            feats = neck.forward(feats)?;
        }

        let Some(first) = feats.first_mut() else {
            return Err(FusionError::ShapeMismatch(
                "point neck produced no feature scales".to_string(),
            ));
        };
        *first = first.with_height_channels(&heights)?;

        debug!(
            voxels = voxels.len(),
            scales = feats.len(),
            channels = feats[0].channels(),
            "point features extracted"
        );
        Ok(Some(feats))
    }

    pub fn extract_feat(
        &self,
        points: &[PointCloud],
        img: Option<ImageBatch>,
        img_metas: &mut [ImgMeta],
    ) -> Result<ExtractedFeatures, FusionError> {
        let img_feats = self.extract_img_feat(img, img_metas)?;
        let pts_feats = self.extract_pts_feat(points)?;
        Ok(ExtractedFeatures {
            img_feats,
            pts_feats,
        })
    }

    // ── training ─────────────────────────────────────────────────────────────

    /// Losses of every active branch, merged into one map.
    pub fn forward_train(&self, batch: TrainBatch) -> Result<LossMap, FusionError> {
        let TrainBatch {
            points,
            img,
            mut img_metas,
            targets,
        } = batch;
        check_sample_count(points.len(), img_metas.len())?;
        if targets.len() != points.len() {
            return Err(FusionError::ShapeMismatch(format!(
                "{} ground-truth entries for {} samples",
                targets.len(),
                points.len()
            )));
        }
        debug!(
            samples = points.len(),
            trainable = ?self.policy.trainable_components(),
            "forward_train"
        );

        let features = self.extract_feat(&points, img, &mut img_metas)?;
        let mut losses = LossMap::new();

        if let (Some(pts_feats), Some(head)) = (&features.pts_feats, &self.pts_bbox_head) {
            let output = head.forward(pts_feats, features.img_feats.as_deref(), &img_metas)?;
            losses.extend(head.loss(&output, &targets, &img_metas)?);
        }
        if let (Some(img_feats), Some(head)) = (&features.img_feats, &self.img_bbox_head) {
            losses.extend(head.loss(img_feats, &img_metas, &targets)?);
        }

        Ok(losses)
    }

    // ── inference ────────────────────────────────────────────────────────────

    /// Single-pass inference: one [`SampleResult`] per sample.
    pub fn simple_test(
        &self,
        points: &[PointCloud],
        mut img_metas: Vec<ImgMeta>,
        img: Option<ImageBatch>,
        rescale: bool,
    ) -> Result<Vec<SampleResult>, FusionError> {
        check_sample_count(points.len(), img_metas.len())?;
        let features = self.extract_feat(points, img, &mut img_metas)?;
        let mut results = vec![SampleResult::default(); img_metas.len()];

        if let (Some(pts_feats), Some(head)) = (&features.pts_feats, &self.pts_bbox_head) {
            let output = head.forward(pts_feats, features.img_feats.as_deref(), &img_metas)?;
            let boxes = head.get_bboxes(&output, &img_metas, rescale)?;
            for (result, dets) in results.iter_mut().zip(per_sample(boxes, img_metas.len())?) {
                result.pts_bbox = Some(dets);
            }
        }
        if let (Some(img_feats), Some(head)) = (&features.img_feats, &self.img_bbox_head) {
            let boxes = head.predict(img_feats, &img_metas, rescale)?;
            for (result, dets) in results.iter_mut().zip(per_sample(boxes, img_metas.len())?) {
                result.img_bbox = Some(dets);
            }
        }

        Ok(results)
    }

    /// Test-time augmentation: run the point head on every augmentation and
    /// merge the per-augmentation boxes.
    ///
    /// The merger always receives one entry per augmentation, aligned with
    /// `img_metas`. An augmentation without point features contributes empty
    /// [`Detections`] for each sample.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::InvalidConfig`] when no augmentation merger was
    /// configured, [`FusionError::AugmentationCountMismatch`] when `points`
    /// and `img_metas` disagree on the augmentation count, and
    /// [`FusionError::ShapeMismatch`] when `imgs` does.
    pub fn aug_test(
        &self,
        points: Vec<Vec<PointCloud>>,
        mut img_metas: Vec<Vec<ImgMeta>>,
        imgs: Vec<Option<ImageBatch>>,
        rescale: bool,
    ) -> Result<Vec<SampleResult>, FusionError> {
        let Some(merger) = self.aug_merger.as_ref() else {
            return Err(FusionError::InvalidConfig {
                field: "aug_merger".to_string(),
                reason: "multiple augmentations need an augmentation merger".to_string(),
            });
        };

        if points.len() != img_metas.len() {
            return Err(FusionError::AugmentationCountMismatch {
                points: points.len(),
                metas: img_metas.len(),
            });
        }
        if imgs.len() != points.len() {
            return Err(FusionError::ShapeMismatch(format!(
                "{} image entries for {} augmentations",
                imgs.len(),
                points.len()
            )));
        }

        let samples = img_metas.first().map_or(0, Vec::len);
        let mut per_aug = Vec::with_capacity(points.len());
        let mut contributed = false;
        for ((aug_points, aug_metas), aug_img) in points.iter().zip(img_metas.iter_mut()).zip(imgs) {
            check_sample_count(aug_points.len(), aug_metas.len())?;
            if aug_metas.len() != samples {
                return Err(FusionError::ShapeMismatch(format!(
                    "augmentation has {} samples, expected {samples}",
                    aug_metas.len()
                )));
            }

            let features = self.extract_feat(aug_points, aug_img, aug_metas)?;
            if let (Some(pts_feats), Some(head)) = (&features.pts_feats, &self.pts_bbox_head) {
                let output = head.forward(pts_feats, features.img_feats.as_deref(), aug_metas)?;
                per_aug.push(per_sample(head.get_bboxes(&output, aug_metas, rescale)?, samples)?);
                contributed = true;
            } else {
                per_aug.push(vec![Detections::default(); samples]);
            }
        }

        if !contributed {
            return Ok(vec![SampleResult::default(); samples]);
        }
        let merged = per_sample(merger.merge(per_aug, &img_metas)?, samples)?;
        Ok(merged
            .into_iter()
            .map(|dets| SampleResult {
                pts_bbox: Some(dets),
                img_bbox: None,
            })
            .collect())
    }

    /// Validate a loader batch and dispatch to [`simple_test`] (one
    /// augmentation) or [`aug_test`] (several).
    ///
    /// Input checks run before any computation.
    ///
    /// [`simple_test`]: Self::simple_test
    /// [`aug_test`]: Self::aug_test
    pub fn forward_test(
        &self,
        batch: TestBatch,
        rescale: bool,
    ) -> Result<Vec<SampleResult>, FusionError> {
        let mut points = batch.points.into_augmentations("points")?;
        let mut img_metas = batch.img_metas.into_augmentations("img_metas")?;

        let num_augs = points.len();
        if num_augs != img_metas.len() {
            return Err(FusionError::AugmentationCountMismatch {
                points: num_augs,
                metas: img_metas.len(),
            });
        }
        if num_augs == 0 {
            return Err(FusionError::ShapeMismatch(
                "at least one augmentation is required".to_string(),
            ));
        }

        let mut imgs: Vec<Option<ImageBatch>> = match batch.img {
            Some(imgs) if imgs.len() != num_augs => {
                return Err(FusionError::ShapeMismatch(format!(
                    "{} image batches for {num_augs} augmentations",
                    imgs.len()
                )));
            }
            Some(imgs) => imgs.into_iter().map(Some).collect(),
            None => (0..num_augs).map(|_| None).collect(),
        };

        if num_augs == 1 {
            let (Some(points), Some(metas), Some(img)) = (points.pop(), img_metas.pop(), imgs.pop())
            else {
                return Err(FusionError::ShapeMismatch(
                    "at least one augmentation is required".to_string(),
                ));
            };
            return self.simple_test(&points, metas, img, rescale);
        }
        self.aug_test(points, img_metas, imgs, rescale)
    }
}

fn check_sample_count(points: usize, metas: usize) -> Result<(), FusionError> {
    if points != metas {
        return Err(FusionError::ShapeMismatch(format!(
            "{points} point clouds for {metas} image metas"
        )));
    }
    Ok(())
}

fn per_sample(dets: Vec<Detections>, samples: usize) -> Result<Vec<Detections>, FusionError> {
    if dets.len() != samples {
        return Err(FusionError::ShapeMismatch(format!(
            "head returned {} results for {samples} samples",
            dets.len()
        )));
    }
    Ok(dets)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use fusiondet_types::{BOX_DIM, Box3d};
    use fusiondet_voxel::{MAX_HEIGHT_SENTINEL, MIN_HEIGHT_SENTINEL, ReductionStrategy};

    use crate::modules::HeadOutput;
    use crate::trainability::TrainabilityFlags;

    // ── mock collaborators ──────────────────────────────────────────────────

    /// Down-samples the canvas by `factor` into `channels` constant channels.
    struct PoolBackbone {
        factor: usize,
        channels: usize,
    }

    impl Backbone for PoolBackbone {
        fn forward(&self, x: FeatureMap) -> Result<Vec<FeatureMap>, FusionError> {
            let [b, _, h, w] = x.shape();
            Ok(vec![FeatureMap::filled(
                [b, self.channels, h / self.factor, w / self.factor],
                1.0,
            )])
        }
    }

    struct EmptyNeck;

    impl Neck for EmptyNeck {
        fn forward(&self, _x: Vec<FeatureMap>) -> Result<Vec<FeatureMap>, FusionError> {
            Ok(Vec::new())
        }
    }

    /// Emits one box per sample whose first value is the scale-0 channel count.
    struct EchoHead;

    impl FusionHead for EchoHead {
        fn forward(
            &self,
            pts_feats: &[FeatureMap],
            _img_feats: Option<&[FeatureMap]>,
            _metas: &[ImgMeta],
        ) -> Result<HeadOutput, FusionError> {
            Ok(HeadOutput {
                predictions: pts_feats.to_vec(),
                ..HeadOutput::default()
            })
        }

        fn loss(
            &self,
            output: &HeadOutput,
            targets: &[GroundTruth],
            _metas: &[ImgMeta],
        ) -> Result<LossMap, FusionError> {
            let mut losses = LossMap::new();
            losses.insert(
                "loss_heatmap".to_string(),
                output.predictions[0].channels() as f32,
            );
            losses.insert(
                "loss_bbox".to_string(),
                targets.iter().map(|t| t.boxes_3d.len()).sum::<usize>() as f32,
            );
            Ok(losses)
        }

        fn get_bboxes(
            &self,
            output: &HeadOutput,
            metas: &[ImgMeta],
            _rescale: bool,
        ) -> Result<Vec<Detections>, FusionError> {
            let channels = output.predictions[0].channels() as f32;
            metas
                .iter()
                .map(|_| {
                    let mut b: Box3d = [0.0; BOX_DIM];
                    b[0] = channels;
                    Detections::new(vec![b], vec![0.5], vec![0])
                })
                .collect()
        }
    }

    struct HalvingImageBackbone;

    impl ImageBackbone for HalvingImageBackbone {
        fn forward(&self, images: &ImageBatch) -> Result<Vec<FeatureMap>, FusionError> {
            let shape = images.shape();
            Ok(vec![FeatureMap::zeros([shape[0], 2, shape[2] / 2, shape[3] / 2])])
        }
    }

    struct ConstImageHead;

    impl ImageHead for ConstImageHead {
        fn loss(
            &self,
            _img_feats: &[FeatureMap],
            _metas: &[ImgMeta],
            _targets: &[GroundTruth],
        ) -> Result<LossMap, FusionError> {
            Ok(LossMap::from([("loss_img_cls".to_string(), 0.25)]))
        }

        fn predict(
            &self,
            _img_feats: &[FeatureMap],
            metas: &[ImgMeta],
            _rescale: bool,
        ) -> Result<Vec<Detections>, FusionError> {
            Ok(metas.iter().map(|_| Detections::default()).collect())
        }
    }

    /// Keeps every augmentation's boxes.
    struct ConcatMerger;

    impl AugmentationMerger for ConcatMerger {
        fn merge(
            &self,
            per_aug: Vec<Vec<Detections>>,
            _metas: &[Vec<ImgMeta>],
        ) -> Result<Vec<Detections>, FusionError> {
            let samples = per_aug.first().map_or(0, Vec::len);
            let mut merged = vec![Detections::default(); samples];
            for aug in per_aug {
                for (out, dets) in merged.iter_mut().zip(aug) {
                    out.boxes.extend(dets.boxes);
                    out.scores.extend(dets.scores);
                    out.labels.extend(dets.labels);
                }
            }
            Ok(merged)
        }
    }

    // ── fixtures ────────────────────────────────────────────────────────────

    /// 16 x 16 x 4 grid of 1 m voxels, down-sampled by 4 to 4 x 4 cells.
    fn config(strategy: ReductionStrategy) -> DetectorConfig {
        DetectorConfig {
            grid: VoxelGridConfig::new(
                [1.0, 1.0, 1.0],
                [0.0, 0.0, -2.0, 16.0, 16.0, 2.0],
                [16, 16, 4],
                4,
            )
            .unwrap(),
            trainability: TrainabilityFlags::default(),
            height_reduction: strategy,
        }
    }

    fn builder() -> DetectorBuilder {
        DetectorBuilder::new(
            config(ReductionStrategy::Sequential),
            Box::new(PoolBackbone {
                factor: 4,
                channels: 3,
            }),
        )
    }

    fn cloud(rows: &[[f32; 4]]) -> PointCloud {
        PointCloud::from_rows(4, rows.iter().copied()).unwrap()
    }

    fn metas(n: usize) -> Vec<ImgMeta> {
        (0..n).map(|_| ImgMeta::new()).collect()
    }

    fn two_samples() -> Vec<PointCloud> {
        vec![
            cloud(&[[1.5, 1.5, 0.0, 1.0], [1.5, 1.5, -1.5, 1.0], [1.5, 1.5, 1.9, 1.0]]),
            cloud(&[[10.2, 6.7, 0.5, 1.0]]),
        ]
    }

    // ── point branch ────────────────────────────────────────────────────────

    #[test]
    fn voxelize_reports_heights_per_cell() {
        let detector = builder().build().unwrap();
        let VoxelizedBatch { voxels, heights } = detector.voxelize(&two_samples()).unwrap();
        assert_eq!(voxels.batch_size(), 2);
        assert_eq!(heights.shape(), (2, 4, 4));
        assert_eq!(heights.min_at(0, 0, 0), -1.5);
        assert_eq!(heights.max_at(0, 0, 0), 1.9);
        assert_eq!(heights.min_at(1, 1, 2), 0.5);
        assert_eq!(heights.min_at(1, 0, 0), MIN_HEIGHT_SENTINEL);
        assert_eq!(heights.max_at(1, 0, 0), MAX_HEIGHT_SENTINEL);
    }

    #[test]
    fn pts_feat_appends_two_height_channels() {
        let detector = builder().with_pts_bbox(Box::new(EchoHead)).build().unwrap();
        let feats = detector.extract_pts_feat(&two_samples()).unwrap().unwrap();
        assert_eq!(feats[0].shape(), [2, 5, 4, 4]);
        assert_eq!(feats[0].get(0, 3, 0, 0), Some(-1.5));
        assert_eq!(feats[0].get(0, 4, 0, 0), Some(1.9));
    }

    #[test]
    fn pts_feat_is_none_without_point_head() {
        let detector = builder().build().unwrap();
        assert!(detector.extract_pts_feat(&two_samples()).unwrap().is_none());
    }

    #[test]
    fn pts_feat_is_none_when_every_point_is_out_of_range() {
        let detector = builder().with_pts_bbox(Box::new(EchoHead)).build().unwrap();
        let points = vec![cloud(&[[-5.0, 0.0, 0.0, 1.0]]), cloud(&[])];
        assert!(detector.extract_pts_feat(&points).unwrap().is_none());
    }

    #[test]
    fn empty_trailing_sample_keeps_batch_size() {
        let detector = builder().with_pts_bbox(Box::new(EchoHead)).build().unwrap();
        let points = vec![cloud(&[[1.0, 1.0, 1.0, 1.0]]), cloud(&[])];
        let feats = detector.extract_pts_feat(&points).unwrap().unwrap();
        assert_eq!(feats[0].batch(), 2);
        assert_eq!(feats[0].get(1, 3, 0, 0), Some(MIN_HEIGHT_SENTINEL));
    }

    #[test]
    fn neck_without_scales_is_a_shape_error() {
        let detector = builder()
            .with_pts_neck(Box::new(EmptyNeck))
            .with_pts_bbox(Box::new(EchoHead))
            .build()
            .unwrap();
        assert!(matches!(
            detector.extract_pts_feat(&two_samples()),
            Err(FusionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn strategies_give_identical_point_features() {
        let points = two_samples();
        let run = |strategy| {
            DetectorBuilder::new(
                config(strategy),
                Box::new(PoolBackbone {
                    factor: 4,
                    channels: 3,
                }),
            )
            .with_pts_bbox(Box::new(EchoHead))
            .build()
            .unwrap()
            .extract_pts_feat(&points)
            .unwrap()
        };
        assert_eq!(run(ReductionStrategy::Sequential), run(ReductionStrategy::Parallel));
    }

    // ── image branch ────────────────────────────────────────────────────────

    #[test]
    fn img_feat_flattens_views_and_records_input_shape() {
        let detector = builder().with_img_backbone(Box::new(HalvingImageBackbone)).build().unwrap();
        let img = ImageBatch::new(vec![2, 3, 1, 8, 12], vec![0.0; 2 * 3 * 8 * 12]).unwrap();
        let mut m = metas(2);
        let feats = detector.extract_img_feat(Some(img), &mut m).unwrap().unwrap();
        assert_eq!(feats[0].shape(), [6, 2, 4, 6]);
        for meta in &m {
            assert_eq!(meta[INPUT_SHAPE_KEY], json!([8, 12]));
        }
    }

    #[test]
    fn img_feat_is_none_without_backbone_or_image() {
        let plain = builder().build().unwrap();
        let img = ImageBatch::new(vec![1, 1, 4, 4], vec![0.0; 16]).unwrap();
        let mut m = metas(1);
        assert!(plain.extract_img_feat(Some(img), &mut m).unwrap().is_none());
        assert!(m[0].get(INPUT_SHAPE_KEY).is_none());

        let with_backbone =
            builder().with_img_backbone(Box::new(HalvingImageBackbone)).build().unwrap();
        assert!(with_backbone.extract_img_feat(None, &mut m).unwrap().is_none());
    }

    #[test]
    fn img_neck_without_backbone_is_rejected() {
        struct PassNeck;
        impl ImageNeck for PassNeck {
            fn forward(&self, x: Vec<FeatureMap>) -> Result<Vec<FeatureMap>, FusionError> {
                Ok(x)
            }
        }
        assert!(matches!(
            builder().with_img_neck(Box::new(PassNeck)).build(),
            Err(FusionError::InvalidConfig { .. })
        ));
    }

    // ── training ────────────────────────────────────────────────────────────

    #[test]
    fn forward_train_merges_branch_losses() {
        let detector = builder()
            .with_pts_bbox(Box::new(EchoHead))
            .with_img_backbone(Box::new(HalvingImageBackbone))
            .with_img_bbox(Box::new(ConstImageHead))
            .build()
            .unwrap();
        let gt = GroundTruth {
            boxes_3d: vec![[0.0; BOX_DIM]; 2],
            labels_3d: vec![0, 1],
            ..GroundTruth::default()
        };
        let losses = detector
            .forward_train(TrainBatch {
                points: two_samples(),
                img: Some(ImageBatch::new(vec![2, 1, 4, 4], vec![0.0; 32]).unwrap()),
                img_metas: metas(2),
                targets: vec![gt.clone(), gt],
            })
            .unwrap();
        assert_eq!(losses["loss_heatmap"], 5.0);
        assert_eq!(losses["loss_bbox"], 4.0);
        assert_eq!(losses["loss_img_cls"], 0.25);
    }

    #[test]
    fn forward_train_checks_target_count() {
        let detector = builder().with_pts_bbox(Box::new(EchoHead)).build().unwrap();
        let err = detector
            .forward_train(TrainBatch {
                points: two_samples(),
                img: None,
                img_metas: metas(2),
                targets: vec![GroundTruth::default()],
            })
            .unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch(_)));
    }

    #[test]
    fn forward_train_hands_query_features_to_the_head_loss() {
        struct QueryHead;
        impl FusionHead for QueryHead {
            fn forward(
                &self,
                pts_feats: &[FeatureMap],
                _img_feats: Option<&[FeatureMap]>,
                _metas: &[ImgMeta],
            ) -> Result<HeadOutput, FusionError> {
                Ok(HeadOutput {
                    predictions: pts_feats.to_vec(),
                    pts_query_feat: Some(FeatureMap::filled([1, 7, 1, 1], 2.0)),
                    img_query_feat: None,
                })
            }

            fn loss(
                &self,
                output: &HeadOutput,
                _targets: &[GroundTruth],
                _metas: &[ImgMeta],
            ) -> Result<LossMap, FusionError> {
                let query = output.pts_query_feat.as_ref().ok_or_else(|| {
                    FusionError::Component {
                        component: "query_head".to_string(),
                        details: "point query features were dropped".to_string(),
                    }
                })?;
                Ok(LossMap::from([(
                    "loss_query".to_string(),
                    query.channels() as f32,
                )]))
            }

            fn get_bboxes(
                &self,
                _output: &HeadOutput,
                metas: &[ImgMeta],
                _rescale: bool,
            ) -> Result<Vec<Detections>, FusionError> {
                Ok(vec![Detections::default(); metas.len()])
            }
        }

        let detector = builder().with_pts_bbox(Box::new(QueryHead)).build().unwrap();
        let losses = detector
            .forward_train(TrainBatch {
                points: two_samples(),
                img: None,
                img_metas: metas(2),
                targets: vec![GroundTruth::default(); 2],
            })
            .unwrap();
        assert_eq!(losses["loss_query"], 7.0);
    }

    #[test]
    fn component_modes_pin_frozen_backbone_while_training() {
        let mut detector = builder().build().unwrap();
        let modes = detector.component_modes();
        assert_eq!(modes.len(), Component::ALL.len());
        assert!(modes.contains(&(Component::PtsMiddleEncoder, Mode::Eval)));
        assert!(modes.contains(&(Component::ImgBackbone, Mode::Eval)));
        assert!(modes.contains(&(Component::HeadCenterLoss, Mode::Train)));
        // Frozen but not pinned.
        assert!(modes.contains(&(Component::HeadOther, Mode::Train)));

        detector.set_mode(Mode::Eval);
        assert!(detector.component_modes().iter().all(|(_, m)| *m == Mode::Eval));
    }

    #[test]
    fn detector_mode_respects_pinned_components() {
        let mut detector = builder().build().unwrap();
        assert_eq!(detector.component_mode(Component::PtsBackbone), Mode::Eval);
        assert_eq!(detector.component_mode(Component::HeadCenterLoss), Mode::Train);
        detector.set_mode(Mode::Eval);
        assert_eq!(detector.component_mode(Component::HeadCenterLoss), Mode::Eval);
    }

    // ── inference ───────────────────────────────────────────────────────────

    fn test_batch(augs: usize) -> TestBatch {
        TestBatch {
            points: Collated::Augmented((0..augs).map(|_| two_samples()).collect()),
            img_metas: Collated::Augmented((0..augs).map(|_| metas(2)).collect()),
            img: None,
        }
    }

    #[test]
    fn forward_test_single_augmentation_runs_simple_test() {
        let detector = builder().with_pts_bbox(Box::new(EchoHead)).build().unwrap();
        let results = detector.forward_test(test_batch(1), true).unwrap();
        assert_eq!(results.len(), 2);
        let dets = results[0].pts_bbox.as_ref().unwrap();
        assert_eq!(dets.boxes[0][0], 5.0);
        assert!(results[0].img_bbox.is_none());
    }

    #[test]
    fn simple_test_fills_both_modalities() {
        let detector = builder()
            .with_pts_bbox(Box::new(EchoHead))
            .with_img_backbone(Box::new(HalvingImageBackbone))
            .with_img_bbox(Box::new(ConstImageHead))
            .build()
            .unwrap();
        let img = ImageBatch::new(vec![2, 1, 4, 4], vec![0.0; 32]).unwrap();
        let results = detector.simple_test(&two_samples(), metas(2), Some(img), false).unwrap();
        assert!(results.iter().all(|r| r.pts_bbox.is_some() && r.img_bbox.is_some()));
    }

    #[test]
    fn simple_test_without_points_yields_empty_results() {
        let detector = builder().with_pts_bbox(Box::new(EchoHead)).build().unwrap();
        let results = detector
            .simple_test(&[cloud(&[]), cloud(&[])], metas(2), None, false)
            .unwrap();
        assert_eq!(results, vec![SampleResult::default(); 2]);
    }

    #[test]
    fn forward_test_rejects_bare_points_first() {
        let detector = builder().build().unwrap();
        let batch = TestBatch {
            points: Collated::Bare(two_samples()),
            img_metas: Collated::Bare(metas(2)),
            img: None,
        };
        let err = detector.forward_test(batch, false).unwrap_err();
        assert_eq!(
            err,
            FusionError::InputType {
                name: "points".to_string(),
                received: "bare batch".to_string(),
            }
        );
    }

    #[test]
    fn forward_test_rejects_bare_metas() {
        let detector = builder().build().unwrap();
        let batch = TestBatch {
            points: Collated::Augmented(vec![two_samples()]),
            img_metas: Collated::Bare(metas(2)),
            img: None,
        };
        let err = detector.forward_test(batch, false).unwrap_err();
        assert!(err.to_string().starts_with("img_metas must be a list"));
    }

    #[test]
    fn forward_test_rejects_augmentation_count_mismatch() {
        let detector = builder().build().unwrap();
        let batch = TestBatch {
            points: Collated::Augmented(vec![two_samples(), two_samples()]),
            img_metas: Collated::Augmented(vec![metas(2)]),
            img: None,
        };
        let err = detector.forward_test(batch, false).unwrap_err();
        assert_eq!(err.to_string(), "num of augmentations (2) != num of image meta (1)");
    }

    #[test]
    fn forward_test_rejects_image_count_mismatch() {
        let detector = builder().build().unwrap();
        let mut batch = test_batch(2);
        batch.img = Some(vec![ImageBatch::new(vec![2, 1, 4, 4], vec![0.0; 32]).unwrap()]);
        assert!(matches!(
            detector.forward_test(batch, false),
            Err(FusionError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn multiple_augmentations_are_merged() {
        let detector = builder()
            .with_pts_bbox(Box::new(EchoHead))
            .with_aug_merger(Box::new(ConcatMerger))
            .build()
            .unwrap();
        let results = detector.forward_test(test_batch(3), false).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].pts_bbox.as_ref().unwrap().len(), 3);
    }

    /// Returns the detections of the augmentation whose metas are tagged
    /// `"keep"`, failing unless every augmentation has an entry.
    struct TaggedMerger;

    impl AugmentationMerger for TaggedMerger {
        fn merge(
            &self,
            per_aug: Vec<Vec<Detections>>,
            metas: &[Vec<ImgMeta>],
        ) -> Result<Vec<Detections>, FusionError> {
            if per_aug.len() != metas.len() {
                return Err(FusionError::ShapeMismatch(format!(
                    "{} detection lists for {} augmentations",
                    per_aug.len(),
                    metas.len()
                )));
            }
            let keep = metas
                .iter()
                .position(|m| m.iter().any(|meta| meta.contains_key("keep")))
                .ok_or_else(|| FusionError::Component {
                    component: "tagged_merger".to_string(),
                    details: "no tagged augmentation".to_string(),
                })?;
            per_aug
                .into_iter()
                .nth(keep)
                .ok_or_else(|| FusionError::Component {
                    component: "tagged_merger".to_string(),
                    details: "tagged augmentation missing".to_string(),
                })
        }
    }

    #[test]
    fn augmentation_without_points_keeps_its_slot() {
        let detector = builder()
            .with_pts_bbox(Box::new(EchoHead))
            .with_aug_merger(Box::new(TaggedMerger))
            .build()
            .unwrap();
        let mut tagged = metas(2);
        for meta in &mut tagged {
            meta.insert("keep".to_string(), json!(true));
        }
        let results = detector
            .aug_test(
                vec![vec![cloud(&[]), cloud(&[])], two_samples()],
                vec![metas(2), tagged],
                vec![None, None],
                false,
            )
            .unwrap();
        assert_eq!(results.len(), 2);
        for result in &results {
            let dets = result.pts_bbox.as_ref().unwrap();
            assert_eq!(dets.len(), 1);
            assert_eq!(dets.boxes[0][0], 5.0);
        }
    }

    #[test]
    fn augmentation_without_points_merges_as_empty() {
        let detector = builder()
            .with_pts_bbox(Box::new(EchoHead))
            .with_aug_merger(Box::new(ConcatMerger))
            .build()
            .unwrap();
        let results = detector
            .aug_test(
                vec![two_samples(), vec![cloud(&[]), cloud(&[])], two_samples()],
                vec![metas(2), metas(2), metas(2)],
                vec![None, None, None],
                false,
            )
            .unwrap();
        assert!(results.iter().all(|r| r.pts_bbox.as_ref().unwrap().len() == 2));
    }

    #[test]
    fn aug_test_rejects_mismatched_augmentation_lists() {
        let detector = builder()
            .with_pts_bbox(Box::new(EchoHead))
            .with_aug_merger(Box::new(ConcatMerger))
            .build()
            .unwrap();

        let err = detector
            .aug_test(
                vec![two_samples(), two_samples()],
                vec![metas(2)],
                vec![None, None],
                false,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "num of augmentations (2) != num of image meta (1)");

        let err = detector
            .aug_test(
                vec![two_samples(), two_samples()],
                vec![metas(2), metas(2)],
                vec![None],
                false,
            )
            .unwrap_err();
        assert!(matches!(err, FusionError::ShapeMismatch(_)));
    }

    #[test]
    fn multiple_augmentations_need_a_merger() {
        let detector = builder().with_pts_bbox(Box::new(EchoHead)).build().unwrap();
        assert!(matches!(
            detector.forward_test(test_batch(2), false),
            Err(FusionError::InvalidConfig { .. })
        ));
    }
}
