//! Database configuration.
//!
//! The cache budget can be given either in blocks or in megabytes; both
//! resolve to a block count. The structure cache takes 60% of that budget.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ArborError, ArborResult};
use crate::storage::layout::BLOCK_SIZE;

/// Default page-cache budget in blocks.
pub const DEFAULT_CACHE_SIZE: usize = 5000;

/// Share of the page-cache budget given to the structure cache.
const STRUCT_CACHE_RATIO: f64 = 0.6;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the data file.
    pub path: PathBuf,
    /// Page-cache budget in blocks.
    pub cache_size: usize,
    /// Page-cache budget in megabytes. Overrides `cache_size` when set.
    pub cache_size_mb: Option<f64>,
    /// Verbose diagnostics for recovery paths and boot.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("arbor.db"),
            cache_size: DEFAULT_CACHE_SIZE,
            cache_size_mb: None,
            debug: false,
        }
    }
}

impl Config {
    /// Configuration for the data file at `path` with default budgets.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Set the cache budget in blocks.
    pub fn with_cache_size(mut self, blocks: usize) -> Self {
        self.cache_size = blocks;
        self.cache_size_mb = None;
        self
    }

    /// Set the cache budget in megabytes.
    pub fn with_cache_size_mb(mut self, megabytes: f64) -> Self {
        self.cache_size_mb = Some(megabytes);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Effective cache budget in blocks.
    pub fn cache_blocks(&self) -> usize {
        match self.cache_size_mb {
            Some(mb) => megabytes_to_blocks(mb),
            None => self.cache_size,
        }
    }

    /// Effective cache budget in megabytes.
    pub fn cache_megabytes(&self) -> f64 {
        blocks_to_megabytes(self.cache_blocks())
    }

    /// Maximum number of block groups held by the structure cache.
    pub fn struct_cache_limit(&self) -> usize {
        ((self.cache_blocks() as f64 * STRUCT_CACHE_RATIO).floor() as usize).max(1)
    }

    /// Reject budgets the engine cannot run with.
    pub fn validate(&self) -> ArborResult<()> {
        if let Some(mb) = self.cache_size_mb
            && !(mb.is_finite() && mb > 0.0)
        {
            return Err(ArborError::Config(format!(
                "cache_size_mb must be a positive number, got {}",
                mb
            )));
        }
        if self.cache_blocks() == 0 {
            return Err(ArborError::Config("cache size must be at least one block".into()));
        }
        if self.path.as_os_str().is_empty() {
            return Err(ArborError::Config("data file path is empty".into()));
        }
        Ok(())
    }

    /// Load config from a TOML file, then apply `ARBOR_*` environment
    /// overrides. A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> ArborResult<Self> {
        let mut config = match fs::read_to_string(path.as_ref()) {
            Ok(s) => toml::from_str::<Config>(&s)
                .map_err(|e| ArborError::Config(format!("invalid config file: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ArborResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ARBOR_PATH") {
            self.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ARBOR_CACHE_SIZE") {
            let blocks = v.trim().parse::<usize>().map_err(|_| {
                ArborError::Config(format!("ARBOR_CACHE_SIZE is not a block count: {}", v))
            })?;
            self.cache_size = blocks;
            self.cache_size_mb = None;
        }
        if let Some(v) = lookup("ARBOR_CACHE_SIZE_MB") {
            let mb = v.trim().parse::<f64>().map_err(|_| {
                ArborError::Config(format!("ARBOR_CACHE_SIZE_MB is not a number: {}", v))
            })?;
            self.cache_size_mb = Some(mb);
        }
        if let Some(v) = lookup("ARBOR_DEBUG") {
            self.debug = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }
}

/// Convert a megabyte budget into whole blocks, rounding up.
pub fn megabytes_to_blocks(megabytes: f64) -> usize {
    let bytes = megabytes * 1024.0 * 1024.0;
    (bytes / BLOCK_SIZE as f64).ceil() as usize
}

pub fn blocks_to_megabytes(blocks: usize) -> f64 {
    (blocks * BLOCK_SIZE) as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_megabyte_conversion() {
        assert_eq!(megabytes_to_blocks(1.0), 256);
        assert_eq!(megabytes_to_blocks(0.001), 1);
        assert_eq!(blocks_to_megabytes(256), 1.0);

        let config = Config::new("x.db").with_cache_size_mb(20.0);
        assert_eq!(config.cache_blocks(), 5120);
        assert_eq!(config.struct_cache_limit(), 3072);
    }

    #[test]
    fn test_struct_cache_limit_floor() {
        let config = Config::new("x.db").with_cache_size(5000);
        assert_eq!(config.struct_cache_limit(), 3000);

        let tiny = Config::new("x.db").with_cache_size(1);
        assert_eq!(tiny.struct_cache_limit(), 1);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [("ARBOR_CACHE_SIZE_MB", "2"), ("ARBOR_DEBUG", "true")]
            .into_iter()
            .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert!(config.debug);
        assert_eq!(config.cache_blocks(), 512);

        let bad: HashMap<&str, &str> = [("ARBOR_CACHE_SIZE", "lots")].into_iter().collect();
        let err = config
            .apply_overrides(|k| bad.get(k).map(|v| v.to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbor.toml");
        fs::write(&path, "path = \"data/main.db\"\ncache_size = 64\ndebug = true\n").unwrap();

        let mut config: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        config.apply_overrides(|_| None).unwrap();
        assert_eq!(config.path, PathBuf::from("data/main.db"));
        assert_eq!(config.cache_blocks(), 64);
        assert!(config.debug);
    }

    #[test]
    fn test_validate_rejects_zero_cache() {
        assert!(Config::new("x.db").with_cache_size(0).validate().is_err());
        assert!(Config::new("x.db").with_cache_size_mb(-1.0).validate().is_err());
        assert!(Config::new("x.db").validate().is_ok());
    }
}
