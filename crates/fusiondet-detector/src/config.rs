//! Detector configuration – reads/writes a TOML file.
//!
//! ```toml
//! height_reduction = "parallel"
//!
//! [grid]
//! voxel_size = [0.075, 0.075, 0.2]
//! point_cloud_range = [-54.0, -54.0, -5.0, 54.0, 54.0, 3.0]
//! grid_size = [1440, 1440, 40]
//! out_size_factor = 8
//!
//! [trainability]
//! freeze_img = true
//! freeze_img_head = false
//! freeze_backbone = true
//! ```
//!
//! The grid is validated while parsing, so a loaded config is always
//! internally consistent.

use std::fs;
use std::path::Path;

use fusiondet_types::FusionError;
use fusiondet_voxel::{ReductionStrategy, VoxelGridConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::trainability::TrainabilityFlags;

/// Environment variable overriding `grid.out_size_factor`.
pub const ENV_OUT_SIZE_FACTOR: &str = "FUSIONDET_OUT_SIZE_FACTOR";
/// Environment variable overriding `height_reduction`.
pub const ENV_HEIGHT_REDUCTION: &str = "FUSIONDET_HEIGHT_REDUCTION";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default)]
    pub grid: VoxelGridConfig,

    #[serde(default)]
    pub trainability: TrainabilityFlags,

    /// Reduction used by the height extractor.
    #[serde(default)]
    pub height_reduction: ReductionStrategy,
}

impl DetectorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, FusionError> {
        toml::from_str(raw).map_err(|e| FusionError::Config(format!("failed to parse config: {e}")))
    }

    pub fn to_toml_string(&self) -> Result<String, FusionError> {
        toml::to_string_pretty(self)
            .map_err(|e| FusionError::Config(format!("failed to serialize config: {e}")))
    }

    pub fn validate(&self) -> Result<(), FusionError> {
        self.grid.validate()
    }
}

/// Load the config from `path`, then apply environment overrides.
///
/// Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<DetectorConfig>, FusionError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        FusionError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg = DetectorConfig::from_toml_str(&raw)?;
    apply_env_overrides(&mut cfg)?;
    Ok(Some(cfg))
}

/// Write `cfg` as pretty TOML, creating parent directories as needed.
pub fn save_to(cfg: &DetectorConfig, path: &Path) -> Result<(), FusionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            FusionError::Config(format!("failed to create config directory: {e}"))
        })?;
    }
    let raw = cfg.to_toml_string()?;
    fs::write(path, raw).map_err(|e| {
        FusionError::Config(format!("failed to write config at {}: {e}", path.display()))
    })
}

/// Apply `FUSIONDET_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FUSIONDET_OUT_SIZE_FACTOR` | `grid.out_size_factor` |
/// | `FUSIONDET_HEIGHT_REDUCTION` | `height_reduction` |
pub fn apply_env_overrides(cfg: &mut DetectorConfig) -> Result<(), FusionError> {
    apply_overrides_from(cfg, |key| std::env::var(key).ok())
}

/// Same as [`apply_env_overrides`] with an explicit variable lookup.
///
/// Unparsable values are logged and ignored. A parsable out-size factor that
/// does not divide the grid is an error and leaves `cfg` untouched.
pub fn apply_overrides_from<F>(cfg: &mut DetectorConfig, lookup: F) -> Result<(), FusionError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(ENV_OUT_SIZE_FACTOR) {
        match v.trim().parse::<u32>() {
            Ok(factor) => cfg.grid = cfg.grid.with_out_size_factor(factor)?,
            Err(_) => warn!(var = ENV_OUT_SIZE_FACTOR, value = %v, "ignoring unparsable override"),
        }
    }
    if let Some(v) = lookup(ENV_HEIGHT_REDUCTION) {
        match v.parse::<ReductionStrategy>() {
            Ok(strategy) => cfg.height_reduction = strategy,
            Err(_) => warn!(var = ENV_HEIGHT_REDUCTION, value = %v, "ignoring unparsable override"),
        }
    }
    cfg.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── file round-trip ─────────────────────────────────────────────────────

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("fusiondet").join("detector.toml");

        let cfg = DetectorConfig::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.grid, VoxelGridConfig::default());
        assert_eq!(loaded.trainability, TrainabilityFlags::default());
        assert_eq!(loaded.height_reduction, ReductionStrategy::Sequential);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join("absent.toml")).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg = DetectorConfig::from_toml_str("height_reduction = \"parallel\"\n").unwrap();
        assert_eq!(cfg.height_reduction, ReductionStrategy::Parallel);
        assert_eq!(cfg.grid.out_size_factor(), 8);
        assert!(cfg.trainability.freeze_img);
    }

    #[test]
    fn partial_trainability_table_keeps_other_defaults() {
        let cfg = DetectorConfig::from_toml_str("[trainability]\nfreeze_backbone = false\n").unwrap();
        assert!(!cfg.trainability.freeze_backbone);
        assert!(cfg.trainability.freeze_img);
        assert!(!cfg.trainability.freeze_img_head);
    }

    #[test]
    fn inconsistent_grid_is_rejected_while_parsing() {
        let raw = r#"
            [grid]
            voxel_size = [0.1, 0.1, 0.2]
            point_cloud_range = [-51.2, -51.2, -5.0, 51.2, 51.2, 3.0]
            grid_size = [1000, 1024, 40]
            out_size_factor = 8
        "#;
        let err = DetectorConfig::from_toml_str(raw).unwrap_err();
        assert!(matches!(err, FusionError::Config(_)));
        assert!(err.to_string().contains("grid_size"));
    }

    #[test]
    fn garbage_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("detector.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        assert!(matches!(load_from(&path), Err(FusionError::Config(_))));
    }

    // ── overrides ───────────────────────────────────────────────────────────

    #[test]
    fn overrides_change_factor_and_strategy() {
        let mut cfg = DetectorConfig::default();
        apply_overrides_from(
            &mut cfg,
            lookup(&[(ENV_OUT_SIZE_FACTOR, "4"), (ENV_HEIGHT_REDUCTION, "Parallel")]),
        )
        .unwrap();
        assert_eq!(cfg.grid.out_size_factor(), 4);
        assert_eq!(cfg.height_reduction, ReductionStrategy::Parallel);
    }

    #[test]
    fn unparsable_overrides_are_ignored() {
        let mut cfg = DetectorConfig::default();
        apply_overrides_from(
            &mut cfg,
            lookup(&[(ENV_OUT_SIZE_FACTOR, "eight"), (ENV_HEIGHT_REDUCTION, "gpu")]),
        )
        .unwrap();
        assert_eq!(cfg, DetectorConfig::default());
    }

    #[test]
    fn non_dividing_factor_is_rejected() {
        let mut cfg = DetectorConfig::default();
        let err = apply_overrides_from(&mut cfg, lookup(&[(ENV_OUT_SIZE_FACTOR, "7")])).unwrap_err();
        assert!(matches!(err, FusionError::InvalidConfig { .. }));
        assert_eq!(cfg.grid.out_size_factor(), 8);
    }

    #[test]
    fn no_overrides_is_a_no_op() {
        let mut cfg = DetectorConfig::default();
        apply_overrides_from(&mut cfg, |_| None).unwrap();
        assert_eq!(cfg, DetectorConfig::default());
    }
}
