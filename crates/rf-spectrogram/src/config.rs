//! Configuration types for the spectrogram pool

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Spectrogram pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of execution units (0 = auto: available parallelism - 1)
    pub concurrency: usize,

    /// Thread name prefix for execution units
    pub unit_name_prefix: String,

    /// Stack size for execution unit threads (None = platform default)
    pub unit_stack_size: Option<usize>,

    /// Boot handshake timeout in milliseconds (None = wait forever)
    pub ready_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 0, // Auto-detect
            unit_name_prefix: "rf-spectro-unit".to_string(),
            unit_stack_size: None,
            ready_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    /// Parse a config from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> PoolResult<Self> {
        serde_json::from_str(json).map_err(|e| PoolError::InvalidConfig(e.to_string()))
    }

    /// Set unit count
    pub fn with_concurrency(mut self, count: usize) -> Self {
        self.concurrency = count;
        self
    }

    /// Set unit thread stack size
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.unit_stack_size = Some(bytes);
        self
    }

    /// Set boot handshake timeout
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Unit count after resolving "auto"
    pub fn resolved_concurrency(&self) -> usize {
        resolve_concurrency(self.concurrency)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }
}

/// 0 means available parallelism minus one (the control thread), floor 1
pub fn resolve_concurrency(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get().saturating_sub(1).max(1)
    } else {
        requested
    }
}
