//! Trainability policy – which sub-components receive gradient updates.
//!
//! Freezing is declared with three flags and resolved exactly once, when the
//! detector is built. Nothing inspects parameter names at runtime; callers
//! ask the resolved [`TrainabilityPolicy`] about an enumerated [`Component`].
//!
//! Resolution order:
//!
//! 1. `freeze_img` freezes the image backbone and image neck. Combined with
//!    `freeze_img_head` it also freezes the fusion head's image transformer,
//!    shared image conv, and image heatmap head.
//! 2. `freeze_backbone` freezes the image backbone and neck, the point middle
//!    encoder, backbone, and neck, and every fusion-head part except the
//!    center loss and the feature aligner. Those two are forced trainable.
//!    Components frozen by this step also run in [`Mode::Eval`] during
//!    training.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Every independently freezable part of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    ImgBackbone,
    ImgNeck,
    PtsVoxelEncoder,
    PtsMiddleEncoder,
    PtsBackbone,
    PtsNeck,
    HeadImgTransformer,
    HeadSharedConvImg,
    HeadImgHeatmap,
    HeadCenterLoss,
    HeadFeatureAligner,
    /// Fusion-head parameters not covered by a more specific variant.
    HeadOther,
}

impl Component {
    pub const ALL: [Component; 12] = [
        Component::ImgBackbone,
        Component::ImgNeck,
        Component::PtsVoxelEncoder,
        Component::PtsMiddleEncoder,
        Component::PtsBackbone,
        Component::PtsNeck,
        Component::HeadImgTransformer,
        Component::HeadSharedConvImg,
        Component::HeadImgHeatmap,
        Component::HeadCenterLoss,
        Component::HeadFeatureAligner,
        Component::HeadOther,
    ];

    /// True for parts of the fusion head.
    pub fn is_head(self) -> bool {
        matches!(
            self,
            Component::HeadImgTransformer
                | Component::HeadSharedConvImg
                | Component::HeadImgHeatmap
                | Component::HeadCenterLoss
                | Component::HeadFeatureAligner
                | Component::HeadOther
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Component::ImgBackbone => "img_backbone",
            Component::ImgNeck => "img_neck",
            Component::PtsVoxelEncoder => "pts_voxel_encoder",
            Component::PtsMiddleEncoder => "pts_middle_encoder",
            Component::PtsBackbone => "pts_backbone",
            Component::PtsNeck => "pts_neck",
            Component::HeadImgTransformer => "head.img_transformer",
            Component::HeadSharedConvImg => "head.shared_conv_img",
            Component::HeadImgHeatmap => "head.img_heatmap_head",
            Component::HeadCenterLoss => "head.center_loss",
            Component::HeadFeatureAligner => "head.feature_aligner",
            Component::HeadOther => "head.other",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the detector (or a single component) is training or inferring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// Declarative freeze flags, as written in the detector configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainabilityFlags {
    #[serde(default = "default_true")]
    pub freeze_img: bool,
    #[serde(default)]
    pub freeze_img_head: bool,
    #[serde(default = "default_true")]
    pub freeze_backbone: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TrainabilityFlags {
    fn default() -> Self {
        Self {
            freeze_img: true,
            freeze_img_head: false,
            freeze_backbone: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    trainable: bool,
    pinned_eval: bool,
}

/// Resolved per-component trainability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainabilityPolicy {
    entries: BTreeMap<Component, Entry>,
}

impl TrainabilityPolicy {
    /// Every component trainable, nothing pinned to eval mode.
    pub fn all_trainable() -> Self {
        Self {
            entries: Component::ALL
                .iter()
                .map(|&c| {
                    (
                        c,
                        Entry {
                            trainable: true,
                            pinned_eval: false,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn resolve(flags: &TrainabilityFlags) -> Self {
        let mut policy = Self::all_trainable();

        if flags.freeze_img {
            policy.freeze(Component::ImgBackbone, false);
            policy.freeze(Component::ImgNeck, false);
            if flags.freeze_img_head {
                policy.freeze(Component::HeadImgTransformer, false);
                policy.freeze(Component::HeadSharedConvImg, false);
                policy.freeze(Component::HeadImgHeatmap, false);
            }
        }

        if flags.freeze_backbone {
            for c in [
                Component::ImgBackbone,
                Component::ImgNeck,
                Component::PtsBackbone,
                Component::PtsMiddleEncoder,
                Component::PtsNeck,
            ] {
                policy.freeze(c, true);
            }
            for c in Component::ALL.into_iter().filter(|c| c.is_head()) {
                let keep = matches!(c, Component::HeadCenterLoss | Component::HeadFeatureAligner);
                if let Some(entry) = policy.entries.get_mut(&c) {
                    entry.trainable = keep;
                }
            }
        }

        policy
    }

    fn freeze(&mut self, component: Component, pin_eval: bool) {
        if let Some(entry) = self.entries.get_mut(&component) {
            entry.trainable = false;
            entry.pinned_eval |= pin_eval;
        }
    }

    pub fn is_trainable(&self, component: Component) -> bool {
        self.entries.get(&component).is_some_and(|e| e.trainable)
    }

    /// Trainable components in declaration order.
    pub fn trainable_components(&self) -> Vec<Component> {
        self.entries
            .iter()
            .filter(|(_, e)| e.trainable)
            .map(|(&c, _)| c)
            .collect()
    }

    pub fn frozen_components(&self) -> Vec<Component> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.trainable)
            .map(|(&c, _)| c)
            .collect()
    }

    /// Effective mode of `component` while the detector runs in `detector_mode`.
    pub fn mode_of(&self, component: Component, detector_mode: Mode) -> Mode {
        match detector_mode {
            Mode::Eval => Mode::Eval,
            Mode::Train if self.entries.get(&component).is_some_and(|e| e.pinned_eval) => {
                Mode::Eval
            }
            Mode::Train => Mode::Train,
        }
    }
}

impl Default for TrainabilityPolicy {
    fn default() -> Self {
        Self::resolve(&TrainabilityFlags::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(freeze_img: bool, freeze_img_head: bool, freeze_backbone: bool) -> TrainabilityFlags {
        TrainabilityFlags {
            freeze_img,
            freeze_img_head,
            freeze_backbone,
        }
    }

    // ── freeze_img ──────────────────────────────────────────────────────────

    #[test]
    fn freeze_img_only_touches_image_branch() {
        let policy = TrainabilityPolicy::resolve(&flags(true, false, false));
        assert!(!policy.is_trainable(Component::ImgBackbone));
        assert!(!policy.is_trainable(Component::ImgNeck));
        assert!(policy.is_trainable(Component::HeadImgTransformer));
        assert!(policy.is_trainable(Component::PtsBackbone));
        assert_eq!(
            policy.mode_of(Component::ImgBackbone, Mode::Train),
            Mode::Train
        );
    }

    #[test]
    fn freeze_img_head_needs_freeze_img() {
        let without = TrainabilityPolicy::resolve(&flags(false, true, false));
        assert!(without.is_trainable(Component::HeadImgHeatmap));

        let with = TrainabilityPolicy::resolve(&flags(true, true, false));
        assert!(!with.is_trainable(Component::HeadImgTransformer));
        assert!(!with.is_trainable(Component::HeadSharedConvImg));
        assert!(!with.is_trainable(Component::HeadImgHeatmap));
        assert!(with.is_trainable(Component::HeadOther));
    }

    // ── freeze_backbone ─────────────────────────────────────────────────────

    #[test]
    fn freeze_backbone_leaves_only_calibration_parts() {
        let policy = TrainabilityPolicy::resolve(&flags(false, false, true));
        assert_eq!(
            policy.trainable_components(),
            vec![
                Component::PtsVoxelEncoder,
                Component::HeadCenterLoss,
                Component::HeadFeatureAligner,
            ]
        );
        assert_eq!(policy.mode_of(Component::PtsNeck, Mode::Train), Mode::Eval);
        assert_eq!(
            policy.mode_of(Component::HeadOther, Mode::Train),
            Mode::Train
        );
    }

    #[test]
    fn freeze_backbone_overrides_image_head_flags() {
        let policy = TrainabilityPolicy::resolve(&flags(true, true, true));
        assert!(policy.is_trainable(Component::HeadCenterLoss));
        assert!(!policy.is_trainable(Component::HeadImgTransformer));
    }

    #[test]
    fn defaults_match_calibration_training() {
        let policy = TrainabilityPolicy::default();
        assert_eq!(policy.frozen_components().len(), 9);
    }

    #[test]
    fn all_false_keeps_everything_trainable() {
        let policy = TrainabilityPolicy::resolve(&flags(false, false, false));
        assert_eq!(policy, TrainabilityPolicy::all_trainable());
    }

    #[test]
    fn eval_mode_applies_to_every_component() {
        let policy = TrainabilityPolicy::all_trainable();
        for c in Component::ALL {
            assert_eq!(policy.mode_of(c, Mode::Eval), Mode::Eval);
        }
    }

    #[test]
    fn component_serialises_snake_case() {
        let json = serde_json::to_string(&Component::HeadCenterLoss).unwrap();
        assert_eq!(json, "\"head_center_loss\"");
        assert_eq!(Component::HeadCenterLoss.to_string(), "head.center_loss");
    }
}
