use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::constants::{MESSAGE_TYPE_PROPERTY, MessageType};

/// Envelope for C2D and D2C messages.
///
/// The message type travels out-of-band in `properties` under
/// [`MESSAGE_TYPE_PROPERTY`]; the body is a JSON payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudMessage {
    pub message_id: String,
    /// Broker handle used to complete (acknowledge) a received message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_token: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl CloudMessage {
    /// Creates a message of the given type with a JSON body.
    pub fn new<T: Serialize>(
        message_id: impl Into<String>,
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut properties = HashMap::new();
        properties.insert(
            MESSAGE_TYPE_PROPERTY.to_string(),
            message_type.as_str().to_string(),
        );
        Ok(Self {
            message_id: message_id.into(),
            lock_token: String::new(),
            properties,
            body: serde_json::to_vec(payload)?,
        })
    }

    /// Adds or replaces a message property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the broker lock token.
    pub fn with_lock_token(mut self, lock_token: impl Into<String>) -> Self {
        self.lock_token = lock_token.into();
        self
    }

    /// Raw value of the message type header, if present.
    pub fn raw_message_type(&self) -> Option<&str> {
        self.properties.get(MESSAGE_TYPE_PROPERTY).map(String::as_str)
    }

    /// Parses the message type header.
    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        self.raw_message_type()
            .ok_or(ProtocolError::MissingProperty(MESSAGE_TYPE_PROPERTY))?
            .parse()
    }

    /// Deserializes the JSON body.
    pub fn parse_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FileUploadCompletionNotification;

    #[test]
    fn new_sets_type_header() {
        let payload = serde_json::json!({"key": "value"});
        let msg = CloudMessage::new("m1", MessageType::FileUpdate, &payload).unwrap();
        assert_eq!(msg.message_id, "m1");
        assert_eq!(msg.raw_message_type(), Some("FileUpdate"));
        assert_eq!(msg.message_type().unwrap(), MessageType::FileUpdate);
        assert!(msg.lock_token.is_empty());
    }

    #[test]
    fn parse_body_roundtrip() {
        let n = FileUploadCompletionNotification {
            correlation_id: "c1".into(),
            is_success: true,
            status_code: 200,
            status_description: String::new(),
        };
        let msg = CloudMessage::new("m1", MessageType::FileUpdate, &n).unwrap();
        let parsed: FileUploadCompletionNotification = msg.parse_body().unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn missing_header() {
        let msg = CloudMessage::default();
        assert!(matches!(
            msg.message_type(),
            Err(ProtocolError::MissingProperty(MESSAGE_TYPE_PROPERTY))
        ));
    }

    #[test]
    fn unknown_header() {
        let msg = CloudMessage::default().with_property(MESSAGE_TYPE_PROPERTY, "Telemetry");
        assert_eq!(msg.raw_message_type(), Some("Telemetry"));
        assert!(matches!(
            msg.message_type(),
            Err(ProtocolError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn invalid_body() {
        let mut msg = CloudMessage::new("m1", MessageType::DownloadChunk, &1).unwrap();
        msg.body = b"not json".to_vec();
        let result: Result<FileUploadCompletionNotification, _> = msg.parse_body();
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }
}
