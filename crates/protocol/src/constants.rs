use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Message property carrying the [`MessageType`] of a C2D or D2C message.
pub const MESSAGE_TYPE_PROPERTY: &str = "MessageType";

/// Reported/desired property holding the change specifications.
pub const CHANGE_SPEC_PROPERTY: &str = "changeSpec";

/// Reported property mirroring the device lifecycle state.
pub const DEVICE_STATE_PROPERTY: &str = "deviceState";

/// Reported property holding the state to resume after a service restart.
pub const DEVICE_STATE_AFTER_RESTART_PROPERTY: &str = "deviceStateAfterServiceRestart";

/// Reported property listing certificate identities known to the device.
pub const KNOWN_IDENTITIES_PROPERTY: &str = "knownIdentities";

/// Message type identifier, read from the [`MESSAGE_TYPE_PROPERTY`] header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Cloud to device
    DownloadChunk,
    RequestDeviceCertificate,
    Reprovisioning,

    // Device to cloud
    FileUpdate,
    StreamingUploadChunk,
    DeviceCertificate,
}

impl MessageType {
    /// Returns the header value for this message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DownloadChunk => "DownloadChunk",
            Self::RequestDeviceCertificate => "RequestDeviceCertificate",
            Self::Reprovisioning => "Reprovisioning",
            Self::FileUpdate => "FileUpdate",
            Self::StreamingUploadChunk => "StreamingUploadChunk",
            Self::DeviceCertificate => "DeviceCertificate",
        }
    }

    /// Returns `true` for message types the cloud pushes to the device.
    pub fn is_cloud_to_device(&self) -> bool {
        matches!(
            self,
            Self::DownloadChunk | Self::RequestDeviceCertificate | Self::Reprovisioning
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DownloadChunk" => Ok(Self::DownloadChunk),
            "RequestDeviceCertificate" => Ok(Self::RequestDeviceCertificate),
            "Reprovisioning" => Ok(Self::Reprovisioning),
            "FileUpdate" => Ok(Self::FileUpdate),
            "StreamingUploadChunk" => Ok(Self::StreamingUploadChunk),
            "DeviceCertificate" => Ok(Self::DeviceCertificate),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}
