//! In-memory collaborators.
//!
//! Each records the calls it receives so tests can assert on traffic, and
//! can be told to fail to exercise error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use twinsync_protocol::constants::DEVICE_STATE_PROPERTY;
use twinsync_protocol::messages::{
    DeviceCertificateEvent, DeviceCertificateRequest, FileUploadCompletionNotification,
    ReprovisioningRequest, UploadSasInfo,
};
use twinsync_protocol::twin::TwinReported;
use twinsync_protocol::{ChangeSpec, CloudMessage, MessageType, ReportedPatch, TwinDocument};

use crate::error::AgentError;
use crate::ports::{BlobStore, BoxFuture, MessageChannel, Provisioner, TwinStore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Twin store
// ---------------------------------------------------------------------------

/// Twin document held in memory.
#[derive(Default)]
pub struct InMemoryTwinStore {
    twin: Mutex<TwinDocument>,
    patches: Mutex<Vec<ReportedPatch>>,
    notifications: Mutex<Vec<FileUploadCompletionNotification>>,
    sas_requests: Mutex<Vec<String>>,
    update_delay: Mutex<Option<Duration>>,
    fail_updates: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryTwinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_twin(twin: TwinDocument) -> Self {
        let store = Self::default();
        *lock(&store.twin) = twin;
        store
    }

    /// Replaces one desired change spec.
    pub fn set_desired(&self, name: &str, spec: ChangeSpec) {
        lock(&self.twin)
            .desired
            .change_spec
            .insert(name.to_string(), spec);
    }

    pub fn twin(&self) -> TwinDocument {
        lock(&self.twin).clone()
    }

    pub fn reported(&self) -> TwinReported {
        lock(&self.twin).reported.clone()
    }

    /// Every reported patch applied so far, in order.
    pub fn patches(&self) -> Vec<ReportedPatch> {
        lock(&self.patches).clone()
    }

    /// Number of patches that wrote the device state.
    pub fn device_state_writes(&self) -> usize {
        lock(&self.patches)
            .iter()
            .filter(|p| p.properties().any(|k| k == DEVICE_STATE_PROPERTY))
            .count()
    }

    pub fn notifications(&self) -> Vec<FileUploadCompletionNotification> {
        lock(&self.notifications).clone()
    }

    pub fn sas_requests(&self) -> Vec<String> {
        lock(&self.sas_requests).clone()
    }

    /// Delays every reported write, widening race windows in tests.
    pub fn set_update_delay(&self, delay: Option<Duration>) {
        *lock(&self.update_delay) = delay;
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl TwinStore for InMemoryTwinStore {
    fn get_twin(&self) -> BoxFuture<'_, TwinDocument> {
        Box::pin(async move {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(AgentError::Store("twin read failed".into()));
            }
            Ok(lock(&self.twin).clone())
        })
    }

    fn update_reported(&self, patch: ReportedPatch) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let delay = *lock(&self.update_delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(AgentError::Store("twin write failed".into()));
            }
            lock(&self.twin).reported.apply_patch(&patch)?;
            lock(&self.patches).push(patch);
            Ok(())
        })
    }

    fn get_upload_sas<'a>(&'a self, blob_name: &'a str) -> BoxFuture<'a, UploadSasInfo> {
        Box::pin(async move {
            let mut requests = lock(&self.sas_requests);
            requests.push(blob_name.to_string());
            Ok(UploadSasInfo {
                correlation_id: format!("corr-{}", requests.len()),
                blob_name: blob_name.to_string(),
                sas_uri: format!("memory://{blob_name}"),
            })
        })
    }

    fn notify_upload_complete(
        &self,
        notification: FileUploadCompletionNotification,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.notifications).push(notification);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Message channel
// ---------------------------------------------------------------------------

/// C2D inbox fed by [`push`](Self::push); D2C events are recorded.
pub struct InMemoryChannel {
    inbox_tx: mpsc::UnboundedSender<CloudMessage>,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CloudMessage>>,
    sent: Mutex<Vec<CloudMessage>>,
    completed: Mutex<Vec<String>>,
    receive_failures: AtomicUsize,
    fail_sends: AtomicBool,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChannel {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            sent: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            receive_failures: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Queues a message for the next `receive`.
    pub fn push(&self, message: CloudMessage) {
        // The receiver lives as long as `self`.
        let _ = self.inbox_tx.send(message);
    }

    /// Makes the next `count` receive calls fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.receive_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<CloudMessage> {
        lock(&self.sent).clone()
    }

    /// Sent events of one type, in order.
    pub fn sent_of_type(&self, message_type: MessageType) -> Vec<CloudMessage> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.message_type().ok() == Some(message_type))
            .cloned()
            .collect()
    }

    /// Lock tokens acknowledged so far.
    pub fn completed(&self) -> Vec<String> {
        lock(&self.completed).clone()
    }
}

impl MessageChannel for InMemoryChannel {
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Option<CloudMessage>> {
        Box::pin(async move {
            let failing = self
                .receive_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AgentError::Transport("receive failed".into()));
            }
            let mut rx = self.inbox_rx.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(message) => Ok(message),
                Err(_) => Ok(None),
            }
        })
    }

    fn complete<'a>(&'a self, lock_token: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.completed).push(lock_token.to_string());
            Ok(())
        })
    }

    fn send_event(&self, message: CloudMessage) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(AgentError::Transport("send failed".into()));
            }
            lock(&self.sent).push(message);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// Stages blocks per SAS URI and assembles them on commit.
#[derive(Default)]
pub struct InMemoryBlobStore {
    staged: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
    committed: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    fail_puts: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed blob content by SAS URI.
    pub fn blob(&self, sas_uri: &str) -> Option<Vec<u8>> {
        lock(&self.committed).get(sas_uri).cloned()
    }

    pub fn committed_uris(&self) -> Vec<String> {
        let mut uris: Vec<_> = lock(&self.committed).keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Number of `put_block` calls received.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put_block<'a>(
        &'a self,
        sas_uri: &'a str,
        block_id: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(AgentError::Blob("put block failed".into()));
            }
            lock(&self.staged)
                .entry(sas_uri.to_string())
                .or_default()
                .insert(block_id.to_string(), data);
            Ok(())
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        sas_uri: &'a str,
        block_ids: &'a [String],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut staged = lock(&self.staged);
            let blocks = staged.remove(sas_uri).unwrap_or_default();
            let mut blob = Vec::new();
            for id in block_ids {
                let block = blocks
                    .get(id)
                    .ok_or_else(|| AgentError::Blob(format!("block {id} not staged")))?;
                blob.extend_from_slice(block);
            }
            lock(&self.committed).insert(sas_uri.to_string(), blob);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// Records provisioning requests and issues fake certificates.
#[derive(Default)]
pub struct InMemoryProvisioner {
    reprovisions: Mutex<Vec<ReprovisioningRequest>>,
    certificates: Mutex<Vec<DeviceCertificateRequest>>,
    fail: AtomicBool,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reprovisions(&self) -> Vec<ReprovisioningRequest> {
        lock(&self.reprovisions).clone()
    }

    pub fn certificates(&self) -> Vec<DeviceCertificateRequest> {
        lock(&self.certificates).clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Provisioner for InMemoryProvisioner {
    fn reprovision(&self, request: ReprovisioningRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::Provisioning("endpoint unreachable".into()));
            }
            lock(&self.reprovisions).push(request);
            Ok(())
        })
    }

    fn issue_certificate(
        &self,
        request: DeviceCertificateRequest,
    ) -> BoxFuture<'_, DeviceCertificateEvent> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::Provisioning("certificate store locked".into()));
            }
            let mut issued = lock(&self.certificates);
            issued.push(request.clone());
            Ok(DeviceCertificateEvent {
                thumbprint: format!("thumb-{}", issued.len()),
                subject: request.subject,
                certificate_pem: String::new(),
            })
        })
    }
}
