//! Prompt cache configuration.
//!
//! Loaded from JSON or built in code; every field has a default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PromptCacheError, Result};

/// Configuration for the prompt cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Seconds since last access after which a cached entry is stale (default 30 min).
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,

    /// Capacity growth unit for attention state buffers, in positions.
    #[serde(default = "default_growth_step")]
    pub growth_step: usize,

    /// When false every lookup misses; generations still commit.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_freshness_secs() -> u64 {
    30 * 60
}
fn default_growth_step() -> usize {
    promptcache_engine::DEFAULT_GROWTH_STEP
}
fn default_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            freshness_secs: default_freshness_secs(),
            growth_step: default_growth_step(),
            enabled: default_enabled(),
        }
    }
}

impl CacheConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CacheConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.growth_step == 0 {
            return Err(PromptCacheError::Config("growth_step must be > 0".into()));
        }
        if self.freshness_secs == 0 {
            return Err(PromptCacheError::Config("freshness_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Freshness threshold as a duration.
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn with_freshness_secs(mut self, secs: u64) -> Self {
        self.freshness_secs = secs;
        self
    }

    pub fn with_growth_step(mut self, step: usize) -> Self {
        self.growth_step = step;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
