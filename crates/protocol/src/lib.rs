//! Wire and document types shared by the twinsync device agent.
//!
//! - [`twin`]: the desired/reported twin document and its change specifications
//! - [`messages`]: payloads carried by C2D and D2C messages
//! - [`envelope`]: the message envelope with out-of-band properties
//! - [`constants`]: property names and the [`MessageType`] header

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod twin;

pub use constants::MessageType;
pub use envelope::CloudMessage;
pub use twin::{
    ChangeSpec, DeviceState, ReportedChangeSpec, ReportedPatch, StatusType, TwinAction,
    TwinActionReported, TwinDocument,
};

/// Errors produced while decoding protocol data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("missing message property: {0}")]
    MissingProperty(&'static str),
}
