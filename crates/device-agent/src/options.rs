use std::path::PathBuf;
use std::time::Duration;

use twinsync_transfer::{ChecksumAlgorithm, DEFAULT_BLOCK_SIZE, TransportType};

/// File the busy-state twin snapshot is written to, under `data_dir`.
pub const SNAPSHOT_FILE_NAME: &str = "twin-snapshot.json";

/// Runtime settings for the agent core.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub device_id: String,
    /// Working directory for snapshots and scratch files.
    pub data_dir: PathBuf,
    /// Transport active at startup; fixes the chunk size of every transfer.
    pub transport: TransportType,
    pub checksum: ChecksumAlgorithm,
    /// Upper bound for one C2D receive call.
    pub receive_timeout: Duration,
    /// Block size for SAS blob uploads.
    pub block_size: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            device_id: "device".into(),
            data_dir: PathBuf::from("."),
            transport: TransportType::default(),
            checksum: ChecksumAlgorithm::default(),
            receive_timeout: Duration::from_secs(5),
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl AgentOptions {
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE_NAME)
    }
}
