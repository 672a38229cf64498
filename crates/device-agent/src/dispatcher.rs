//! C2D receive loop.
//!
//! One loop runs per Ready/Provisioning epoch. Each message is classified by
//! its `MessageType` header, routed, and then completed. Messages of unknown
//! or disallowed types are skipped without being completed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinsync_protocol::messages::{
    DeviceCertificateRequest, DownloadBlobChunkMessage, ReprovisioningRequest,
};
use twinsync_protocol::{CloudMessage, DeviceState, MessageType, ReportedPatch};

use crate::agent::AgentCommand;
use crate::download::DownloadEngine;
use crate::error::AgentError;
use crate::ports::{MessageChannel, Provisioner, TwinStore};
use crate::state_machine::StateListener;

/// Pause after a failed receive before trying again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Which message types a loop accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Only provisioning traffic; device management waits for Ready.
    Provisioning,
    Normal,
}

impl DispatchMode {
    pub fn allows(&self, message_type: MessageType) -> bool {
        match self {
            Self::Normal => message_type.is_cloud_to_device(),
            Self::Provisioning => matches!(
                message_type,
                MessageType::Reprovisioning | MessageType::RequestDeviceCertificate
            ),
        }
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Processed and completed.
    Handled,
    /// Processing failed; completed anyway.
    Failed,
    /// Not processed and not completed.
    Skipped,
}

/// Routes C2D messages to the download engine and provisioning handlers.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn TwinStore>,
    downloads: Arc<DownloadEngine>,
    provisioner: Arc<dyn Provisioner>,
    commands: mpsc::Sender<AgentCommand>,
    receive_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn TwinStore>,
        downloads: Arc<DownloadEngine>,
        provisioner: Arc<dyn Provisioner>,
        commands: mpsc::Sender<AgentCommand>,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            store,
            downloads,
            provisioner,
            commands,
            receive_timeout,
        }
    }

    /// Receives and dispatches until `cancel` fires.
    pub async fn run(&self, mode: DispatchMode, cancel: CancellationToken) {
        info!(?mode, "C2D dispatcher started");
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.channel.receive(self.receive_timeout) => r,
            };
            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "C2D receive failed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => continue,
                    }
                }
            };
            self.dispatch(mode, message).await;
        }
        info!(?mode, "C2D dispatcher stopped");
    }

    /// Processes one message and completes it unless it was skipped.
    pub async fn dispatch(&self, mode: DispatchMode, message: CloudMessage) -> DispatchOutcome {
        let message_type = match message.message_type() {
            Ok(t) => t,
            Err(e) => {
                debug!(message_id = %message.message_id, error = %e, "skipping message");
                return DispatchOutcome::Skipped;
            }
        };
        if !mode.allows(message_type) {
            debug!(message_id = %message.message_id, %message_type, ?mode, "message type not accepted");
            return DispatchOutcome::Skipped;
        }

        let result = match message_type {
            MessageType::DownloadChunk => self.on_download_chunk(&message).await,
            MessageType::Reprovisioning => self.on_reprovisioning(&message).await,
            MessageType::RequestDeviceCertificate => self.on_certificate_request(&message).await,
            _ => return DispatchOutcome::Skipped,
        };
        let outcome = match result {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => {
                warn!(message_id = %message.message_id, %message_type, error = %e, "message processing failed");
                DispatchOutcome::Failed
            }
        };

        if let Err(e) = self.channel.complete(&message.lock_token).await {
            warn!(message_id = %message.message_id, error = %e, "failed to complete message");
        }
        outcome
    }

    async fn on_download_chunk(&self, message: &CloudMessage) -> Result<(), AgentError> {
        let chunk: DownloadBlobChunkMessage = message.parse_body()?;
        let outcome = self.downloads.handle_chunk(chunk).await?;
        debug!(message_id = %message.message_id, ?outcome, "chunk applied");
        Ok(())
    }

    async fn on_reprovisioning(&self, message: &CloudMessage) -> Result<(), AgentError> {
        let request: ReprovisioningRequest = message.parse_body()?;
        info!(id_scope = %request.id_scope, registration_id = %request.registration_id, "reprovisioning requested");
        self.provisioner.reprovision(request).await?;
        self.commands
            .send(AgentCommand::SetState(DeviceState::Provisioning))
            .await
            .map_err(|_| AgentError::Transport("agent command loop stopped".into()))
    }

    async fn on_certificate_request(&self, message: &CloudMessage) -> Result<(), AgentError> {
        let request: DeviceCertificateRequest = message.parse_body()?;
        info!(subject = %request.subject, "device certificate requested");
        let event = self.provisioner.issue_certificate(request).await?;

        let reply = CloudMessage::new(
            uuid::Uuid::new_v4().to_string(),
            MessageType::DeviceCertificate,
            &event,
        )?;
        self.channel.send_event(reply).await?;

        let mut identities = self.store.get_twin().await?.reported.known_identities;
        if !identities.contains(&event.thumbprint) {
            identities.push(event.thumbprint.clone());
        }
        self.store
            .update_reported(ReportedPatch::known_identities(&identities))
            .await?;
        info!(thumbprint = %event.thumbprint, "device certificate issued");
        Ok(())
    }
}

impl StateListener for Dispatcher {
    fn on_state_entered(&self, state: DeviceState, scope: &CancellationToken) {
        let mode = match state {
            DeviceState::Ready => DispatchMode::Normal,
            DeviceState::Provisioning => DispatchMode::Provisioning,
            _ => return,
        };
        let this = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move { this.run(mode, scope).await });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;
    use twinsync_protocol::constants::MESSAGE_TYPE_PROPERTY;
    use twinsync_protocol::twin::DownloadAction;
    use twinsync_protocol::{StatusType, TwinActionReported};
    use twinsync_strict_mode::StrictModePolicy;
    use twinsync_transfer::{ChecksumAlgorithm, ChunkPolicy, TransportType};

    use super::*;
    use crate::memory::{InMemoryChannel, InMemoryProvisioner, InMemoryTwinStore};
    use crate::report::{ActionToReport, ReportWriter};

    struct Fixture {
        store: Arc<InMemoryTwinStore>,
        channel: Arc<InMemoryChannel>,
        provisioner: Arc<InMemoryProvisioner>,
        downloads: Arc<DownloadEngine>,
        dispatcher: Dispatcher,
        commands: mpsc::Receiver<AgentCommand>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTwinStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let reports = Arc::new(ReportWriter::new(store.clone()));
        let downloads = Arc::new(DownloadEngine::new(
            channel.clone(),
            reports,
            Arc::new(StrictModePolicy::disabled()),
            ChunkPolicy::for_transport(TransportType::Amqp),
            ChecksumAlgorithm::Md5,
        ));
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(
            channel.clone(),
            store.clone(),
            downloads.clone(),
            provisioner.clone(),
            tx,
            Duration::from_millis(50),
        );
        Fixture {
            store,
            channel,
            provisioner,
            downloads,
            dispatcher,
            commands: rx,
        }
    }

    fn message<T: serde::Serialize>(lock: &str, t: MessageType, body: &T) -> CloudMessage {
        CloudMessage::new(format!("m-{lock}"), t, body)
            .unwrap()
            .with_lock_token(lock)
    }

    fn chunk(action_id: &str, offset: u64, data: &[u8], file_size: u64) -> DownloadBlobChunkMessage {
        DownloadBlobChunkMessage {
            action_id: action_id.into(),
            file_name: "fw.bin".into(),
            offset,
            data: data.to_vec(),
            file_size,
            range_size: None,
        }
    }

    #[test]
    fn provisioning_mode_allow_list() {
        assert!(DispatchMode::Provisioning.allows(MessageType::Reprovisioning));
        assert!(DispatchMode::Provisioning.allows(MessageType::RequestDeviceCertificate));
        assert!(!DispatchMode::Provisioning.allows(MessageType::DownloadChunk));
        assert!(DispatchMode::Normal.allows(MessageType::DownloadChunk));
        assert!(!DispatchMode::Normal.allows(MessageType::FileUpdate));
    }

    #[tokio::test]
    async fn unknown_type_is_skipped_without_completion() {
        let f = fixture();
        let mut properties = HashMap::new();
        properties.insert(MESSAGE_TYPE_PROPERTY.to_string(), "Telemetry".to_string());
        let msg = CloudMessage {
            message_id: "m1".into(),
            lock_token: "t1".into(),
            properties,
            body: b"{}".to_vec(),
        };

        let outcome = f.dispatcher.dispatch(DispatchMode::Normal, msg).await;
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(f.channel.completed().is_empty());
    }

    #[tokio::test]
    async fn provisioning_mode_skips_chunks() {
        let f = fixture();
        let msg = message("t1", MessageType::DownloadChunk, &chunk("a1", 0, b"x", 1));
        let outcome = f.dispatcher.dispatch(DispatchMode::Provisioning, msg).await;
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(f.channel.completed().is_empty());
    }

    #[tokio::test]
    async fn chunk_for_unknown_action_is_completed_as_failed() {
        let f = fixture();
        let msg = message("t1", MessageType::DownloadChunk, &chunk("ghost", 0, b"x", 1));
        let outcome = f.dispatcher.dispatch(DispatchMode::Normal, msg).await;
        assert_eq!(outcome, DispatchOutcome::Failed);
        assert_eq!(f.channel.completed(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn chunk_reaches_download_engine() {
        let dir = TempDir::new().unwrap();
        let f = fixture();
        let request = DownloadAction {
            action_id: "a1".into(),
            file_name: "fw.bin".into(),
            dest_path: dir.path().to_string_lossy().into_owned(),
            file_size: Some(4),
            unzip: false,
            enabled: true,
            description: String::new(),
        };
        let action = ActionToReport {
            change_spec_name: "cs".into(),
            change_spec_id: "v1".into(),
            part: "InstallSteps".into(),
            index: 0,
            part_len: 1,
            report: TwinActionReported::default(),
        };
        f.downloads.init_download(&request, action).await.unwrap();

        let msg = message("t1", MessageType::DownloadChunk, &chunk("a1", 0, b"abcd", 4));
        let outcome = f.dispatcher.dispatch(DispatchMode::Normal, msg).await;

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(std::fs::read(dir.path().join("fw.bin")).unwrap(), b"abcd");
        let reported = f.store.reported().change_spec["cs"].clone();
        assert_eq!(reported.report("InstallSteps", 0).unwrap().status, StatusType::Success);
    }

    #[tokio::test]
    async fn reprovisioning_requests_provisioning_state() {
        let mut f = fixture();
        let request = ReprovisioningRequest {
            id_scope: "scope-2".into(),
            registration_id: "dev-1".into(),
            global_endpoint: String::new(),
            reason: String::new(),
        };
        let msg = message("t1", MessageType::Reprovisioning, &request);

        let outcome = f.dispatcher.dispatch(DispatchMode::Provisioning, msg).await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(f.provisioner.reprovisions(), vec![request]);
        assert!(matches!(
            f.commands.try_recv(),
            Ok(AgentCommand::SetState(DeviceState::Provisioning))
        ));
        assert_eq!(f.channel.completed(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn reprovisioning_failure_is_completed_without_transition() {
        let mut f = fixture();
        f.provisioner.fail(true);
        let request = ReprovisioningRequest {
            id_scope: "scope-2".into(),
            registration_id: "dev-1".into(),
            global_endpoint: String::new(),
            reason: String::new(),
        };
        let msg = message("t1", MessageType::Reprovisioning, &request);

        let outcome = f.dispatcher.dispatch(DispatchMode::Normal, msg).await;
        assert_eq!(outcome, DispatchOutcome::Failed);
        assert!(f.commands.try_recv().is_err());
        assert_eq!(f.channel.completed().len(), 1);
    }

    #[tokio::test]
    async fn certificate_request_reports_identity() {
        let f = fixture();
        let request = DeviceCertificateRequest {
            subject: "CN=dev-1".into(),
            validity_days: 30,
            replace_existing: false,
        };
        let msg = message("t1", MessageType::RequestDeviceCertificate, &request);

        let outcome = f.dispatcher.dispatch(DispatchMode::Normal, msg).await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(f.channel.sent_of_type(MessageType::DeviceCertificate).len(), 1);
        assert_eq!(f.store.reported().known_identities, vec!["thumb-1".to_string()]);
    }

    #[tokio::test]
    async fn loop_survives_receive_errors_and_stops_on_cancel() {
        let f = fixture();
        f.channel.fail_next_receives(2);
        f.channel.push(message(
            "t1",
            MessageType::DownloadChunk,
            &chunk("ghost", 0, b"x", 1),
        ));

        let cancel = CancellationToken::new();
        let dispatcher = f.dispatcher.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { dispatcher.run(DispatchMode::Normal, cancel).await }
        });

        for _ in 0..100 {
            if !f.channel.completed().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(f.channel.completed(), vec!["t1".to_string()]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
