//! Collaborator traits for the cloud-side services the agent talks to.
//!
//! The daemon implements these on top of real transports; tests use the
//! in-memory versions in [`crate::memory`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use twinsync_protocol::messages::{
    DeviceCertificateEvent, DeviceCertificateRequest, FileUploadCompletionNotification,
    ReprovisioningRequest, UploadSasInfo,
};
use twinsync_protocol::{CloudMessage, ReportedPatch, TwinDocument};

use crate::error::AgentError;

/// Boxed future returned by collaborator methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AgentError>> + Send + 'a>>;

/// Cloud-held twin document.
pub trait TwinStore: Send + Sync {
    /// Fetches the full document.
    fn get_twin(&self) -> BoxFuture<'_, TwinDocument>;

    /// Applies a partial update to the reported section.
    fn update_reported(&self, patch: ReportedPatch) -> BoxFuture<'_, ()>;

    /// Requests a SAS grant for uploading `blob_name`.
    fn get_upload_sas<'a>(&'a self, blob_name: &'a str) -> BoxFuture<'a, UploadSasInfo>;

    /// Reports the outcome of a SAS upload.
    fn notify_upload_complete(
        &self,
        notification: FileUploadCompletionNotification,
    ) -> BoxFuture<'_, ()>;
}

/// C2D receive and D2C send channel.
pub trait MessageChannel: Send + Sync {
    /// Waits up to `timeout` for the next message. `Ok(None)` on timeout.
    fn receive(&self, timeout: Duration) -> BoxFuture<'_, Option<CloudMessage>>;

    /// Acknowledges a received message so the broker stops redelivering it.
    fn complete<'a>(&'a self, lock_token: &'a str) -> BoxFuture<'a, ()>;

    /// Sends a device-to-cloud event.
    fn send_event(&self, message: CloudMessage) -> BoxFuture<'_, ()>;
}

/// Block-based blob upload behind a SAS URI.
pub trait BlobStore: Send + Sync {
    /// Stages one block.
    fn put_block<'a>(
        &'a self,
        sas_uri: &'a str,
        block_id: &'a str,
        data: Vec<u8>,
    ) -> BoxFuture<'a, ()>;

    /// Commits staged blocks in the given order.
    fn commit_block_list<'a>(
        &'a self,
        sas_uri: &'a str,
        block_ids: &'a [String],
    ) -> BoxFuture<'a, ()>;
}

/// Provisioning endpoint and certificate store.
pub trait Provisioner: Send + Sync {
    /// Switches the device to a new provisioning endpoint.
    fn reprovision(&self, request: ReprovisioningRequest) -> BoxFuture<'_, ()>;

    /// Issues a certificate and returns its identity.
    fn issue_certificate(
        &self,
        request: DeviceCertificateRequest,
    ) -> BoxFuture<'_, DeviceCertificateEvent>;
}
