//! Relay configuration
//!
//! Loaded from YAML; every field has a default so an empty document is valid.
//!
//! ```yaml
//! listen_address: 0.0.0.0:19132
//! pack_cache_dir: packcache
//! spawn_timeout_secs: 30
//! queue_capacity: 256
//! chunk_size: 1048576
//! log_filter: info
//! capture:
//!   directory: captures
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::format::unix_millis;
use crate::{RelayError, Result};

/// Capture output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Directory receiving `<hostname>-<unix millis>.pcap2` files.
    pub directory: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { directory: PathBuf::from("captures") }
    }
}

/// Relay settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the local client connects to.
    pub listen_address: SocketAddr,
    /// On-disk pack cache shared across sessions; in-memory only when unset.
    pub pack_cache_dir: Option<PathBuf>,
    /// How long either side may take to finish logging in.
    pub spawn_timeout_secs: u64,
    /// Bound of each connection's post-login hand-off queue.
    pub queue_capacity: usize,
    /// Chunk size used when serving packs to the local client.
    pub chunk_size: usize,
    /// Default `tracing` filter; `RUST_LOG` takes precedence.
    pub log_filter: String,
    pub capture: CaptureConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 19132)),
            pack_cache_dir: None,
            spawn_timeout_secs: 30,
            queue_capacity: 256,
            chunk_size: 1024 * 1024,
            log_filter: "info".to_string(),
            capture: CaptureConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load and validate a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| RelayError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml_ng::from_str(yaml)
            .map_err(|e| RelayError::config(format!("YAML parsing failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(RelayError::config("queue_capacity must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(RelayError::config("chunk_size must be at least 1"));
        }
        if self.spawn_timeout_secs == 0 {
            return Err(RelayError::config("spawn_timeout_secs must be at least 1"));
        }
        if self.log_filter.trim().is_empty() {
            return Err(RelayError::config("log_filter must not be empty"));
        }
        Ok(())
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    /// Path of a new capture for a session with `hostname`.
    pub fn capture_path(&self, hostname: &str) -> PathBuf {
        let host: String = hostname
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.capture.directory.join(format!("{}-{}.pcap2", host, unix_millis()))
    }
}
