//! Twin document kept in a JSON file.
//!
//! An operator edits the `desired` section; the agent writes `reported`.
//! Every write goes through a temporary file and a rename so a reader
//! never sees a half-written document.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use twinsync_device_agent::{AgentError, BoxFuture, TwinStore};
use twinsync_protocol::messages::{FileUploadCompletionNotification, UploadSasInfo};
use twinsync_protocol::{ReportedPatch, TwinDocument};

use crate::config::BlobConfig;

pub struct FileTwinStore {
    path: PathBuf,
    blob: BlobConfig,
    notifications_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTwinStore {
    pub fn new(path: PathBuf, blob: BlobConfig, notifications_path: PathBuf) -> Self {
        Self {
            path,
            blob,
            notifications_path,
            write_lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<TwinDocument, AgentError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(TwinDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TwinDocument::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, twin: &TwinDocument) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(twin)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Blob URL with the configured SAS token.
    fn sas_uri(&self, blob_name: &str) -> String {
        let base = self.blob.container_url.trim_end_matches('/');
        let mut uri = format!("{base}/{blob_name}");
        if !self.blob.sas_token.is_empty() {
            uri.push('?');
            uri.push_str(self.blob.sas_token.trim_start_matches('?'));
        }
        uri
    }
}

async fn append_line(path: &Path, line: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

impl TwinStore for FileTwinStore {
    fn get_twin(&self) -> BoxFuture<'_, TwinDocument> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            self.read().await
        })
    }

    fn update_reported(&self, patch: ReportedPatch) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut twin = self.read().await?;
            twin.reported.apply_patch(&patch)?;
            self.write(&twin).await?;
            tracing::trace!(properties = ?patch.properties().collect::<Vec<_>>(), "reported patch written");
            Ok(())
        })
    }

    fn get_upload_sas<'a>(&'a self, blob_name: &'a str) -> BoxFuture<'a, UploadSasInfo> {
        Box::pin(async move {
            if self.blob.container_url.is_empty() {
                return Err(AgentError::Store("no blob container configured".into()));
            }
            Ok(UploadSasInfo {
                correlation_id: uuid::Uuid::new_v4().to_string(),
                blob_name: blob_name.to_string(),
                sas_uri: self.sas_uri(blob_name),
            })
        })
    }

    fn notify_upload_complete(
        &self,
        notification: FileUploadCompletionNotification,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!(
                correlation_id = %notification.correlation_id,
                success = notification.is_success,
                "upload completion"
            );
            let line = serde_json::to_vec(&notification)?;
            append_line(&self.notifications_path, &line).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use twinsync_protocol::DeviceState;

    use super::*;

    fn store(dir: &TempDir, blob: BlobConfig) -> FileTwinStore {
        FileTwinStore::new(
            dir.path().join("twin.json"),
            blob,
            dir.path().join("notifications.jsonl"),
        )
    }

    #[tokio::test]
    async fn missing_file_is_empty_twin() {
        let dir = TempDir::new().unwrap();
        let twin = store(&dir, BlobConfig::default()).get_twin().await.unwrap();
        assert_eq!(twin, TwinDocument::default());
    }

    #[tokio::test]
    async fn patches_preserve_desired_section() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("twin.json"),
            r#"{"desired":{"changeSpec":{"deploy":{"id":"v1","patch":{}}}},"reported":{"custom":{"site":"lab"}}}"#,
        )
        .unwrap();
        let s = store(&dir, BlobConfig::default());

        s.update_reported(ReportedPatch::device_state(DeviceState::Ready))
            .await
            .unwrap();

        let twin = s.get_twin().await.unwrap();
        assert_eq!(twin.desired.change_spec["deploy"].id, "v1");
        assert_eq!(twin.reported.device_state, Some(DeviceState::Ready));
        assert_eq!(twin.reported.custom["site"], "lab");
        assert!(!dir.path().join("twin.json.tmp").exists());
    }

    #[tokio::test]
    async fn invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("twin.json"), "{not json").unwrap();
        let result = store(&dir, BlobConfig::default()).get_twin().await;
        assert!(matches!(result, Err(AgentError::Json(_))));
    }

    #[tokio::test]
    async fn sas_grant_uses_container_and_token() {
        let dir = TempDir::new().unwrap();
        let s = store(
            &dir,
            BlobConfig {
                container_url: "https://acct.blob.core.windows.net/uploads/".into(),
                sas_token: "?sv=2022&sig=abc".into(),
            },
        );
        let grant = s.get_upload_sas("v1/log.txt").await.unwrap();
        assert_eq!(
            grant.sas_uri,
            "https://acct.blob.core.windows.net/uploads/v1/log.txt?sv=2022&sig=abc"
        );
        assert!(!grant.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn sas_grant_needs_container() {
        let dir = TempDir::new().unwrap();
        let result = store(&dir, BlobConfig::default()).get_upload_sas("x").await;
        assert!(matches!(result, Err(AgentError::Store(_))));
    }

    #[tokio::test]
    async fn notifications_are_appended() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir, BlobConfig::default());
        for ok in [true, false] {
            s.notify_upload_complete(FileUploadCompletionNotification {
                correlation_id: "c1".into(),
                is_success: ok,
                status_code: if ok { 200 } else { 500 },
                status_description: String::new(),
            })
            .await
            .unwrap();
        }
        let log = std::fs::read_to_string(dir.path().join("notifications.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }
}
