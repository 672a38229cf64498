//! Agent configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/twinsync/agent.toml`
//! - Windows: `%APPDATA%/twinsync/agent.toml`
//!
//! A path passed as the first CLI argument overrides the default location.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use twinsync_device_agent::AgentOptions;
use twinsync_strict_mode::StrictModeSettings;
use twinsync_transfer::{ChecksumAlgorithm, DEFAULT_BLOCK_SIZE, TransportType};

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device identity (hostname by default).
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Transport used to reach the cloud; fixes the chunk size.
    #[serde(default)]
    pub transport: TransportType,

    /// Working directory for snapshots, spool and provisioning records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// File-backed twin document. Defaults to `<data_dir>/twin.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twin_path: Option<PathBuf>,

    /// Upper bound for one C2D receive call, in seconds.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,

    /// Interval between reconciliation passes, in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Checksum reported for transferred files.
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,

    /// Block size for SAS blob uploads, in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default)]
    pub blob: BlobConfig,

    #[serde(default)]
    pub strict_mode: StrictModeSettings,
}

/// Blob container that SAS grants point into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Container URL, e.g. `https://account.blob.core.windows.net/uploads`.
    #[serde(default)]
    pub container_url: String,
    /// SAS query string appended to every blob URL, without the leading `?`.
    #[serde(default)]
    pub sas_token: String,
}

fn default_device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "twinsync-device".into())
}

fn default_data_dir() -> PathBuf {
    config_dir().join("data")
}

fn default_receive_timeout() -> u64 {
    5
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            transport: TransportType::default(),
            data_dir: default_data_dir(),
            twin_path: None,
            receive_timeout_secs: default_receive_timeout(),
            reconcile_interval_secs: default_reconcile_interval(),
            checksum: ChecksumAlgorithm::default(),
            block_size: default_block_size(),
            blob: BlobConfig::default(),
            strict_mode: StrictModeSettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the platform default), creating
    /// a default file if none exists.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(config_path);

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn twin_path(&self) -> PathBuf {
        self.twin_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("twin.json"))
    }

    /// Directory holding the `inbox/` and `outbox/` message spools.
    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("spool")
    }

    pub fn provisioning_dir(&self) -> PathBuf {
        self.data_dir.join("provisioning")
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            device_id: self.device_id.clone(),
            data_dir: self.data_dir.clone(),
            transport: self.transport,
            checksum: self.checksum,
            receive_timeout: Duration::from_secs(self.receive_timeout_secs.max(1)),
            block_size: self.block_size,
        }
    }
}

fn config_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config").join("twinsync")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("twinsync")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/twinsync")
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> PathBuf {
    config_dir().join("agent.toml")
}
