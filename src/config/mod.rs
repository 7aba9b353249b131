//! Kernel configuration — where state lives and how the crank loop is tuned.
//!
//! Loaded from YAML (`kernel.yaml` by convention). Every field has a default,
//! so an empty file (or no file) gives an in-memory kernel.
//!
//! ```yaml
//! data_dir: /var/lib/vatkernel
//! default_reap_interval: 100
//! checkpoint_interval: 1000
//! gc_batch_size: 64
//! max_vats_online: 50
//! log_filter: vatkernel=debug
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

const DEFAULT_LOG_FILTER: &str = "vatkernel=info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Directory for `kernel.wal` and `kernel.snapshot`. `None` keeps
    /// everything in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Deliveries between automatic `bringOutYourDead`s for vats that don't
    /// set their own interval. `None` disables automatic reaping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_reap_interval: Option<u64>,
    /// Commits between snapshots (WAL compaction). 0 disables.
    pub checkpoint_interval: u64,
    /// Max krefs in one GC delivery.
    pub gc_batch_size: usize,
    /// Vat workers kept resident; the least recently used is evicted past this.
    pub max_vats_online: usize,
    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_reap_interval: None,
            checkpoint_interval: 0,
            gc_batch_size: 64,
            max_vats_online: 50,
            log_filter: DEFAULT_LOG_FILTER.into(),
        }
    }
}

impl KernelConfig {
    /// In-memory kernel with default tuning.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Durable kernel rooted at `dir`.
    pub fn durable(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> KernelResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| KernelError::Config(format!("bad config YAML: {e}")))
    }

    /// Load from a YAML file. A missing file is an error; use
    /// `KernelConfig::default()` when running without one.
    pub fn load(path: &Path) -> KernelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }

    pub fn save(&self, path: &Path) -> KernelResult<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| KernelError::Config(format!("YAML serialize error: {e}")))?;
        std::fs::write(path, yaml)
            .map_err(|e| KernelError::Config(format!("failed to write {}: {e}", path.display())))
    }

    /// Install a `tracing` subscriber filtered by `RUST_LOG`, falling back to
    /// `log_filter`. Safe to call more than once; later calls are no-ops.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(&self.log_filter))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}
