//! Agent error types.

use twinsync_protocol::{DeviceState, ProtocolError};
use twinsync_strict_mode::StrictModeError;
use twinsync_transfer::TransferError;

/// Errors produced by the device agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("strict mode: {0}")]
    StrictMode(#[from] StrictModeError),

    #[error("twin store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("provisioning error: {0}")]
    Provisioning(String),

    #[error("no active download for action {0}")]
    UnknownAction(String),

    #[error("action has no destination path")]
    NoDestination,

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("no files to upload matching {0}")]
    NoFilesToUpload(String),

    #[error("unsupported action type")]
    UnsupportedAction,

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("cancelled")]
    Cancelled,

    #[error("device not ready (state: {0:?})")]
    DeviceNotReady(DeviceState),

    #[error("device busy")]
    DeviceBusy,

    #[error("chunk {offset}..{end} lies outside a {total} byte file")]
    ChunkOutOfRange { offset: u64, end: u64, total: u64 },

    #[error("file size changed from {expected} to {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl AgentError {
    /// Code written into `resultCode` of a failed action report.
    pub fn result_code(&self) -> i32 {
        match self {
            Self::Io(_) => 1,
            Self::Json(_) | Self::Protocol(_) => 2,
            Self::Transfer(TransferError::ChecksumMismatch { .. }) => 3,
            Self::Transfer(TransferError::NotADirectory(_)) | Self::NotADirectory(_) => 8,
            Self::Transfer(_) => 4,
            Self::StrictMode(_) => 5,
            Self::Store(_) | Self::Transport(_) | Self::Blob(_) => 6,
            Self::UnknownAction(_) => 7,
            Self::NoDestination => 9,
            Self::NoFilesToUpload(_) => 10,
            Self::UnsupportedAction => 11,
            Self::Execution(_) => 12,
            Self::Cancelled => 13,
            Self::Provisioning(_) => 14,
            Self::DeviceNotReady(_) => 15,
            Self::DeviceBusy => 16,
            Self::ChunkOutOfRange { .. } => 17,
            Self::SizeMismatch { .. } => 18,
        }
    }

    /// HTTP status a controller layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::DeviceNotReady(_) => 400,
            Self::DeviceBusy => 503,
            Self::UnknownAction(_) => 404,
            Self::StrictMode(_) => 403,
            Self::NoDestination | Self::NoFilesToUpload(_) | Self::UnsupportedAction => 422,
            _ => 500,
        }
    }

    /// Wraps a task join failure.
    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(err))
    }
}
