//! Application orchestrator: wires the file-backed collaborators into the
//! device agent and runs it until shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use twinsync_device_agent::{AgentHandle, Collaborators, DeviceAgent};
use twinsync_protocol::DeviceState;

use crate::blob::HttpBlobStore;
use crate::config::Config;
use crate::file_twin::FileTwinStore;
use crate::provisioner::LocalProvisioner;
use crate::spool::SpoolChannel;

/// Runs the agent until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    // -- Collaborators --
    let store = Arc::new(FileTwinStore::new(
        config.twin_path(),
        config.blob.clone(),
        config.data_dir.join("upload-notifications.jsonl"),
    ));
    let channel = Arc::new(SpoolChannel::new(&config.spool_dir())?);
    let blob = Arc::new(HttpBlobStore::new()?);
    let provisioner = Arc::new(LocalProvisioner::new(config.provisioning_dir()));

    let agent = DeviceAgent::new(
        config.agent_options(),
        &config.strict_mode,
        Collaborators {
            store,
            channel,
            blob,
            provisioner,
        },
    )?;
    let handle = agent.handle();

    let agent_cancel = cancel.clone();
    let mut agent_task = tokio::spawn(async move { agent.run(agent_cancel).await });

    // -- Background tasks --
    tokio::spawn(complete_provisioning(handle.clone(), cancel.clone()));
    tokio::spawn(reconcile_periodically(
        handle.clone(),
        config.reconcile_interval(),
        cancel.clone(),
    ));

    tracing::info!(
        twin = %config.twin_path().display(),
        spool = %config.spool_dir().display(),
        "agent running"
    );

    // -- Main loop: wait for shutdown --
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            None
        }
        result = &mut agent_task => Some(result),
    };

    // -- Graceful shutdown --
    cancel.cancel();
    let result = match finished {
        Some(result) => result,
        None => agent_task.await,
    };
    result??;
    Ok(())
}

/// Provisioning has no remote step for a file-backed device, so each time
/// the agent enters Provisioning it is moved straight on to Ready.
async fn complete_provisioning(handle: AgentHandle, cancel: CancellationToken) {
    let mut states = handle.subscribe();
    loop {
        if *states.borrow_and_update() == DeviceState::Provisioning {
            tracing::info!("provisioning complete");
            if let Err(e) = handle.set_state(DeviceState::Ready).await {
                tracing::warn!(error = %e, "could not leave provisioning");
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Re-reads the desired section on a fixed interval. The agent ignores the
/// request unless the device is Ready.
async fn reconcile_periodically(
    handle: AgentHandle,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if handle.request_reconcile().await.is_err() {
            return;
        }
    }
}
