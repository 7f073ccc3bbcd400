//! Provider configuration, loadable from a JSON file.

use std::path::Path;

use serde::Deserialize;

use crate::error::{TileError, TileResult};
use crate::scheduler::TaskScheduler;

/// Check if per-fetch timing logs are enabled via env var.
pub(crate) fn tile_timing_enabled() -> bool {
    std::env::var("TILESTACK_TILE_TIMING").is_ok_and(|v| v == "1" || v == "true")
}

fn default_concurrency() -> i64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(4)
}

/// Tiling, cache and scheduling parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Nominal patch edge length in data pixels.
    pub tile_width: usize,
    /// Overlap added around each patch when requesting data, in data pixels.
    pub overlap: usize,
    /// Outward padding of tile draw rectangles, in scene units.
    pub overlap_draw: f64,
    /// Number of stacks kept in the tile cache.
    pub cache_size: usize,
    /// Maximum number of fetch tasks running at once.
    pub n_concurrent_tasks: i64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            tile_width: 256,
            overlap: 0,
            overlap_draw: 1e-6,
            cache_size: 100,
            n_concurrent_tasks: default_concurrency(),
        }
    }
}

impl ProviderConfig {
    /// Load a config from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> TileResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ProviderConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TileResult<()> {
        if self.tile_width == 0 {
            return Err(TileError::Configuration("tile_width must be positive".into()));
        }
        if self.cache_size == 0 {
            return Err(TileError::Configuration("cache_size must be positive".into()));
        }
        if self.n_concurrent_tasks <= 0 {
            return Err(TileError::Configuration(format!(
                "n_concurrent_tasks must be positive, got {}",
                self.n_concurrent_tasks
            )));
        }
        if !self.overlap_draw.is_finite() || self.overlap_draw < 0.0 {
            return Err(TileError::Configuration(format!(
                "overlap_draw must be a non-negative number, got {}",
                self.overlap_draw
            )));
        }
        Ok(())
    }

    /// Build the shared fetch scheduler described by this config.
    pub fn scheduler(&self) -> TileResult<TaskScheduler> {
        TaskScheduler::new(self.n_concurrent_tasks)
    }
}
