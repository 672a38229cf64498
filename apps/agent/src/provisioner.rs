//! Local provisioning records.
//!
//! Reprovisioning requests are recorded as the device's next registration;
//! certificate requests produce an identity record under `certs/`. Key
//! material itself lives in the platform certificate store, outside this
//! agent.

use std::path::PathBuf;

use serde::Serialize;
use sha2::{Digest, Sha256};
use twinsync_device_agent::{AgentError, BoxFuture, Provisioner};
use twinsync_protocol::messages::{
    DeviceCertificateEvent, DeviceCertificateRequest, ReprovisioningRequest,
};

pub struct LocalProvisioner {
    dir: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord<'a> {
    thumbprint: &'a str,
    subject: &'a str,
    validity_days: u32,
    replace_existing: bool,
}

impl LocalProvisioner {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    async fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), AgentError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(value)?).await?;
        Ok(())
    }
}

/// Uppercase SHA-1-length thumbprint derived from the subject and a nonce.
fn thumbprint(subject: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(nonce.as_bytes());
    let mut hex = hex::encode_upper(hasher.finalize());
    hex.truncate(40);
    hex
}

impl Provisioner for LocalProvisioner {
    fn reprovision(&self, request: ReprovisioningRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if request.id_scope.is_empty() || request.registration_id.is_empty() {
                return Err(AgentError::Provisioning(
                    "id scope and registration id are required".into(),
                ));
            }
            self.write_json(self.dir.join("registration.json"), &request)
                .await?;
            tracing::info!(
                id_scope = %request.id_scope,
                registration_id = %request.registration_id,
                "registration updated"
            );
            Ok(())
        })
    }

    fn issue_certificate(
        &self,
        request: DeviceCertificateRequest,
    ) -> BoxFuture<'_, DeviceCertificateEvent> {
        Box::pin(async move {
            if request.subject.is_empty() {
                return Err(AgentError::Provisioning("certificate subject is empty".into()));
            }
            let thumbprint = thumbprint(&request.subject, &uuid::Uuid::new_v4().to_string());
            let record = IdentityRecord {
                thumbprint: &thumbprint,
                subject: &request.subject,
                validity_days: request.validity_days,
                replace_existing: request.replace_existing,
            };
            self.write_json(self.dir.join("certs").join(format!("{thumbprint}.json")), &record)
                .await?;
            tracing::info!(%thumbprint, subject = %request.subject, "certificate identity issued");
            Ok(DeviceCertificateEvent {
                thumbprint,
                subject: request.subject,
                certificate_pem: String::new(),
            })
        })
    }
}
