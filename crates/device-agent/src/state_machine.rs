//! Device lifecycle state machine.
//!
//! Owns the current [`DeviceState`], mirrors it into the reported twin and
//! hands every Ready/Provisioning epoch a fresh cancellation scope. Entering
//! a new epoch always cancels the previous one first.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinsync_protocol::{DeviceState, ReportedPatch};

use crate::error::AgentError;
use crate::ports::TwinStore;

/// Notified synchronously, in registration order, when a state with an
/// entry action is entered. Implementations spawn their own work.
pub trait StateListener: Send + Sync {
    fn on_state_entered(&self, state: DeviceState, scope: &CancellationToken);
}

pub struct StateMachine {
    store: Arc<dyn TwinStore>,
    state: watch::Sender<DeviceState>,
    /// Scope of the live epoch. The lock also serializes transitions.
    scope: tokio::sync::Mutex<Option<CancellationToken>>,
    root: CancellationToken,
    listeners: Mutex<Vec<Arc<dyn StateListener>>>,
    snapshot_path: PathBuf,
}

impl StateMachine {
    pub fn new(
        store: Arc<dyn TwinStore>,
        snapshot_path: PathBuf,
        root: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(DeviceState::Uninitialized);
        Self {
            store,
            state,
            scope: tokio::sync::Mutex::new(None),
            root,
            listeners: Mutex::new(Vec::new()),
            snapshot_path,
        }
    }

    /// Registers a listener for Ready/Provisioning entries.
    pub fn add_listener(&self, listener: Arc<dyn StateListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Last committed state. Never waits on an in-flight transition.
    pub fn current_state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Watches committed states. Re-entering Provisioning notifies too.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    /// Errors unless the device is Ready.
    pub fn ensure_ready(&self) -> Result<(), AgentError> {
        match self.current_state() {
            DeviceState::Ready => Ok(()),
            DeviceState::Busy => Err(AgentError::DeviceBusy),
            other => Err(AgentError::DeviceNotReady(other)),
        }
    }

    /// State to start in after a process start.
    ///
    /// A pending restart marker wins over the last reported state and is
    /// cleared once read. Fetch errors propagate.
    pub async fn get_init_state(&self) -> Result<DeviceState, AgentError> {
        let twin = self.store.get_twin().await?;
        if let Some(state) = twin.reported.device_state_after_service_restart {
            info!(?state, "resuming state recorded before restart");
            if let Err(e) = self
                .store
                .update_reported(ReportedPatch::state_after_restart(None))
                .await
            {
                warn!(error = %e, "failed to clear restart marker");
            }
            return Ok(state);
        }
        Ok(twin.reported.device_state.unwrap_or_default())
    }

    /// Records the state to resume after the next restart.
    pub async fn set_state_after_restart(
        &self,
        state: Option<DeviceState>,
    ) -> Result<(), AgentError> {
        self.store
            .update_reported(ReportedPatch::state_after_restart(state))
            .await
    }

    /// Moves to `target` and runs its entry action.
    ///
    /// Same-state calls are no-ops except for Provisioning, which always
    /// restarts. A failed twin write keeps the previous state.
    pub async fn set_state(&self, target: DeviceState) -> Result<(), AgentError> {
        let mut scope = self.scope.lock().await;
        let current = self.current_state();
        if current == target && target != DeviceState::Provisioning {
            debug!(state = ?target, "already in state");
            return Ok(());
        }

        if let Err(e) = self
            .store
            .update_reported(ReportedPatch::device_state(target))
            .await
        {
            warn!(from = ?current, to = ?target, error = %e, "failed to persist device state");
            return Err(e);
        }
        self.state.send_replace(target);
        info!(from = ?current, to = ?target, "device state changed");

        if let Some(old) = scope.take() {
            old.cancel();
        }
        match target {
            DeviceState::Busy => self.save_snapshot().await,
            DeviceState::Ready | DeviceState::Provisioning => {
                let fresh = self.root.child_token();
                *scope = Some(fresh.clone());
                let listeners = self
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for listener in listeners {
                    listener.on_state_entered(target, &fresh);
                }
            }
            DeviceState::Uninitialized => {}
        }
        Ok(())
    }

    /// Scope of the live epoch, if any.
    pub async fn current_scope(&self) -> Option<CancellationToken> {
        self.scope.lock().await.clone()
    }

    /// Cancels every scope this machine handed out.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    async fn save_snapshot(&self) {
        let twin = match self.store.get_twin().await {
            Ok(twin) => twin,
            Err(e) => {
                warn!(error = %e, "failed to fetch twin for snapshot");
                return;
            }
        };
        let json = match serde_json::to_vec_pretty(&twin) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize twin snapshot");
                return;
            }
        };
        if let Some(parent) = self.snapshot_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %parent.display(), error = %e, "failed to create snapshot dir");
                return;
            }
        }
        match tokio::fs::write(&self.snapshot_path, json).await {
            Ok(()) => debug!(path = %self.snapshot_path.display(), "twin snapshot saved"),
            Err(e) => warn!(path = %self.snapshot_path.display(), error = %e, "failed to save twin snapshot"),
        }
    }
}
