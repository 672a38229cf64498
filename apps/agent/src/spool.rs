//! Directory-backed message channel.
//!
//! C2D messages are JSON files dropped into `inbox/`; they are delivered in
//! file-name order and deleted once completed. D2C events are written to
//! `outbox/`. A delivered but uncompleted message is not delivered again
//! until the agent restarts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use twinsync_device_agent::{AgentError, BoxFuture, MessageChannel};
use twinsync_protocol::CloudMessage;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// On-disk form of a message. The body is inline JSON instead of bytes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpoolFile {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    properties: HashMap<String, String>,
    #[serde(default)]
    body: serde_json::Value,
}

pub struct SpoolChannel {
    inbox: PathBuf,
    outbox: PathBuf,
    delivered: Mutex<HashSet<String>>,
}

impl SpoolChannel {
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        let inbox = dir.join("inbox");
        let outbox = dir.join("outbox");
        std::fs::create_dir_all(&inbox)?;
        std::fs::create_dir_all(&outbox)?;
        Ok(Self {
            inbox,
            outbox,
            delivered: Mutex::new(HashSet::new()),
        })
    }

    /// Oldest undelivered message, if any. Unreadable files are logged and
    /// left in place.
    async fn next_message(&self) -> Result<Option<CloudMessage>, AgentError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.inbox).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        let mut delivered = self.delivered.lock().await;
        for name in names {
            if delivered.contains(&name) {
                continue;
            }
            let bytes = tokio::fs::read(self.inbox.join(&name)).await?;
            delivered.insert(name.clone());
            let file: SpoolFile = match serde_json::from_slice(&bytes) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "unreadable spool message");
                    continue;
                }
            };
            let message_id = if file.message_id.is_empty() {
                name.trim_end_matches(".json").to_string()
            } else {
                file.message_id
            };
            return Ok(Some(CloudMessage {
                message_id,
                lock_token: name,
                properties: file.properties,
                body: serde_json::to_vec(&file.body)?,
            }));
        }
        Ok(None)
    }
}

impl MessageChannel for SpoolChannel {
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Option<CloudMessage>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(message) = self.next_message().await? {
                    return Ok(Some(message));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
            }
        })
    }

    fn complete<'a>(&'a self, lock_token: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if lock_token.is_empty() || lock_token.contains(['/', '\\']) {
                return Err(AgentError::Transport(format!("invalid lock token: {lock_token}")));
            }
            match tokio::fs::remove_file(self.inbox.join(lock_token)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.delivered.lock().await.remove(lock_token);
            Ok(())
        })
    }

    fn send_event(&self, message: CloudMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let body = serde_json::from_slice(&message.body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&message.body).into_owned())
            });
            let file = SpoolFile {
                message_id: message.message_id.clone(),
                properties: message.properties,
                body,
            };
            let stamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let path = self.outbox.join(format!("{stamp:013}-{}.json", message.message_id));
            tokio::fs::write(&path, serde_json::to_vec_pretty(&file)?).await?;
            Ok(())
        })
    }
}
