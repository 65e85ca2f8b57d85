//! Engine configuration, persisted as JSON under the user config directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::partition::MAX_ENGINES;
use crate::state_heap::{HeapOptions, SubRegionSizes};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine instances a frame is split across (1..=4)
    pub engine_count: usize,
    /// Partition alignment in columns
    pub alignment_quantum: u32,
    /// Largest scaler overfetch per side, in columns
    pub overfetch_budget: u32,
    /// State instances per engine heap
    pub heap_capacity: usize,
    /// Backing buffer alignment in bytes
    pub heap_alignment: usize,
    pub sub_region_sizes: SubRegionSizes,
    pub acquire_timeout_ms: u64,
    pub poll_interval_us: u64,
    /// How long a submitted multi-engine wave may run before it is reported hung
    pub wave_watchdog_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_count: 2,
            alignment_quantum: 64,
            overfetch_budget: 64,
            heap_capacity: 4,
            heap_alignment: 4096,
            sub_region_sizes: SubRegionSizes::default(),
            acquire_timeout_ms: 100,
            poll_interval_us: 200,
            wave_watchdog_ms: 500,
        }
    }
}

impl EngineConfig {
    /// `<config_dir>/VPE/engine.json`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("VPE");
        path.push("engine.json");
        path
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| EngineError::ConfigIo {
            path: path.display().to_string(),
            source: Arc::new(source),
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or return defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No engine config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let io_err = |source: std::io::Error| EngineError::ConfigIo {
            path: path.display().to_string(),
            source: Arc::new(source),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(EngineError::Configuration(msg));

        if self.engine_count == 0 || self.engine_count > MAX_ENGINES {
            return fail(format!("engine_count {} outside 1..={}", self.engine_count, MAX_ENGINES));
        }
        if self.alignment_quantum == 0 {
            return fail("alignment_quantum must be positive".into());
        }
        if self.heap_capacity == 0 {
            return fail("heap_capacity must be at least 1".into());
        }
        if !self.heap_alignment.is_power_of_two() {
            return fail(format!("heap_alignment {} is not a power of two", self.heap_alignment));
        }
        if self.sub_region_sizes.total() == 0 {
            return fail("sub_region_sizes are all zero".into());
        }
        if self.poll_interval_us == 0 {
            return fail("poll_interval_us must be positive".into());
        }
        if self.poll_interval_us > self.acquire_timeout_ms.saturating_mul(1000) {
            return fail(format!(
                "poll interval {}us exceeds acquire timeout {}ms",
                self.poll_interval_us, self.acquire_timeout_ms
            ));
        }
        Ok(())
    }

    /// Narrowest frame this configuration can partition.
    pub fn min_width(&self) -> u32 {
        self.alignment_quantum * self.engine_count as u32
    }

    pub fn heap_options(&self) -> HeapOptions {
        HeapOptions {
            alignment: self.heap_alignment,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            poll_interval: Duration::from_micros(self.poll_interval_us),
        }
    }

    pub fn wave_watchdog(&self) -> Duration {
        Duration::from_millis(self.wave_watchdog_ms)
    }
}
