use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Cloud to device
// ---------------------------------------------------------------------------

/// One chunk of a file the cloud pushes for a download action.
///
/// The `data` field is base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadBlobChunkMessage {
    pub action_id: String,
    pub file_name: String,
    pub offset: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub file_size: u64,
    /// Length of the range this chunk closes, when the sender answers a
    /// ranged request. Used to detect short writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_size: Option<u64>,
}

/// Asks the device to move to a new provisioning endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprovisioningRequest {
    pub id_scope: String,
    pub registration_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub global_endpoint: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Asks the device to issue a new certificate into its certificate store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCertificateRequest {
    pub subject: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub validity_days: u32,
    #[serde(default)]
    pub replace_existing: bool,
}

// ---------------------------------------------------------------------------
// Device to cloud
// ---------------------------------------------------------------------------

/// Requests the cloud to push `[start_position, end_position)` of a file
/// in chunks of at most `chunk_size` bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdateEvent {
    pub action_id: String,
    pub file_name: String,
    pub chunk_size: u64,
    pub start_position: u64,
    pub end_position: u64,
    pub report_part_name: String,
    pub action_index: usize,
    pub change_spec_id: String,
}

/// One chunk of a streamed upload. Only the last chunk carries the checksum
/// of the whole stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingUploadChunkEvent {
    pub action_id: String,
    pub file_name: String,
    pub change_spec_id: String,
    pub start_position: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub is_last: bool,
}

/// Answer to a [`DeviceCertificateRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCertificateEvent {
    pub thumbprint: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_pem: String,
}

// ---------------------------------------------------------------------------
// Blob upload
// ---------------------------------------------------------------------------

/// SAS grant for a blob upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSasInfo {
    pub correlation_id: String,
    pub blob_name: String,
    pub sas_uri: String,
}

/// Tells the cloud a SAS upload finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadCompletionNotification {
    pub correlation_id: String,
    pub is_success: bool,
    #[serde(default)]
    pub status_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_description: String,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_data_is_base64() {
        let msg = DownloadBlobChunkMessage {
            action_id: "a1".into(),
            file_name: "fw.bin".into(),
            offset: 0,
            data: b"Hello".to_vec(),
            file_size: 5,
            range_size: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("SGVsbG8="));
        assert!(!json.contains("rangeSize"));
        let parsed: DownloadBlobChunkMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data, b"Hello");
    }

    #[test]
    fn chunk_accepts_range_size() {
        let json = r#"{"actionId":"a","fileName":"f","offset":100,"data":"AAAA","fileSize":400,"rangeSize":100}"#;
        let msg: DownloadBlobChunkMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.range_size, Some(100));
        assert_eq!(msg.data, vec![0, 0, 0]);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let json = r#"{"actionId":"a","fileName":"f","offset":0,"data":"***","fileSize":1}"#;
        assert!(serde_json::from_str::<DownloadBlobChunkMessage>(json).is_err());
    }

    #[test]
    fn file_update_field_names() {
        let evt = FileUpdateEvent {
            action_id: "a1".into(),
            file_name: "fw.bin".into(),
            chunk_size: 1024,
            start_position: 0,
            end_position: 4096,
            report_part_name: "InstallSteps".into(),
            action_index: 2,
            change_spec_id: "v1".into(),
        };
        let v = serde_json::to_value(&evt).unwrap();
        assert_eq!(v["chunkSize"], 1024);
        assert_eq!(v["endPosition"], 4096);
        assert_eq!(v["actionIndex"], 2);
        assert_eq!(v["changeSpecId"], "v1");
    }

    #[test]
    fn streaming_chunk_omits_checksum_until_last() {
        let mut evt = StreamingUploadChunkEvent {
            action_id: "u1".into(),
            file_name: "log.txt".into(),
            change_spec_id: "v1".into(),
            start_position: 0,
            data: vec![1, 2, 3],
            checksum: None,
            is_last: false,
        };
        let json = serde_json::to_string(&evt).unwrap();
        assert!(!json.contains("checksum"));

        evt.checksum = Some("abc".into());
        evt.is_last = true;
        let json = serde_json::to_string(&evt).unwrap();
        assert!(json.contains("\"checksum\":\"abc\""));
        assert!(json.contains("\"isLast\":true"));
    }

    #[test]
    fn completion_notification_defaults() {
        let json = r#"{"correlationId":"c1","isSuccess":false}"#;
        let n: FileUploadCompletionNotification = serde_json::from_str(json).unwrap();
        assert!(!n.is_success);
        assert_eq!(n.status_code, 0);
        assert!(n.status_description.is_empty());
    }
}
