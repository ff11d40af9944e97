//! Creation and open-time settings
//!
//! Both structs deserialize from TOML with every field optional.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Block edge used when none (or an unusable one) is requested
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Accepted block edges
pub const BLOCK_SIZE_RANGE: std::ops::RangeInclusive<usize> = 32..=2048;

/// Raster bytes above which new containers spill (2 GiB less 10 MB for the tree)
pub const DEFAULT_SPILL_THRESHOLD: u64 = 2_147_483_648 - 10_000_000;

/// Projected file size above which overviews spill
pub const DEFAULT_OVERVIEW_SPILL_THRESHOLD: u64 = 2_000_000_000;

/// Upper bound on overview names read from one band
pub const DEFAULT_MAX_OVERVIEW_NAMES: usize = 1000;

/// Options for creating a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateOptions {
    /// Edge of the square blocks
    pub block_size: usize,

    /// Run-length compress blocks (ignored when the raster spills)
    pub compressed: bool,

    /// Always store pixels in a spill file
    pub use_spill: bool,

    /// Name recorded in a `DependentFile` entry of the new container
    pub dependent_file: Option<String>,

    /// Raster size in bytes above which pixels go to a spill file
    pub spill_threshold: u64,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            compressed: false,
            use_spill: false,
            dependent_file: None,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
        }
    }
}

impl CreateOptions {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Requested block size, or the default when it is out of range
    pub fn effective_block_size(&self) -> usize {
        if BLOCK_SIZE_RANGE.contains(&self.block_size) {
            self.block_size
        } else {
            tracing::warn!(
                "Block size {} outside {:?}, using {}",
                self.block_size,
                BLOCK_SIZE_RANGE,
                DEFAULT_BLOCK_SIZE
            );
            DEFAULT_BLOCK_SIZE
        }
    }
}

/// Settings that apply while a container is open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HfaConfig {
    /// Put new overviews in a dependent `.rrd` file
    pub use_rrd: bool,

    /// Always put new overviews in a spill file
    pub use_spill: bool,

    /// Projected file size above which new overviews spill
    pub overview_spill_threshold: u64,

    /// Maximum names read from one overview name list
    pub max_overview_names: usize,
}

impl Default for HfaConfig {
    fn default() -> Self {
        HfaConfig {
            use_rrd: false,
            use_spill: false,
            overview_spill_threshold: DEFAULT_OVERVIEW_SPILL_THRESHOLD,
            max_overview_names: DEFAULT_MAX_OVERVIEW_NAMES,
        }
    }
}

impl HfaConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HfaError;

    #[test]
    fn test_create_options_defaults() {
        let opts = CreateOptions::from_toml_str("").unwrap();
        assert_eq!(opts, CreateOptions::default());
        assert_eq!(opts.block_size, 64);
        assert_eq!(opts.spill_threshold, 2_137_483_648);
    }

    #[test]
    fn test_create_options_from_toml() {
        let opts = CreateOptions::from_toml_str(
            r#"
            block_size = 256
            compressed = true
            dependent_file = "scene.img"
            "#,
        )
        .unwrap();
        assert_eq!(opts.block_size, 256);
        assert!(opts.compressed);
        assert!(!opts.use_spill);
        assert_eq!(opts.dependent_file.as_deref(), Some("scene.img"));
    }

    #[test]
    fn test_block_size_falls_back() {
        let mut opts = CreateOptions::default();
        opts.block_size = 16;
        assert_eq!(opts.effective_block_size(), 64);
        opts.block_size = 4096;
        assert_eq!(opts.effective_block_size(), 64);
        opts.block_size = 2048;
        assert_eq!(opts.effective_block_size(), 2048);
    }

    #[test]
    fn test_hfa_config_from_toml() {
        let config = HfaConfig::from_toml_str("use_rrd = true\nmax_overview_names = 10").unwrap();
        assert!(config.use_rrd);
        assert_eq!(config.max_overview_names, 10);
        assert_eq!(config.overview_spill_threshold, 2_000_000_000);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = HfaConfig::from_toml_str("use_rrd = \"maybe\"").unwrap_err();
        assert!(matches!(err, HfaError::Config(_)));
    }
}
