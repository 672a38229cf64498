//! Agent runtime: wires the engines together and runs the command loop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinsync_protocol::DeviceState;
use twinsync_strict_mode::{StrictModePolicy, StrictModeSettings};
use twinsync_transfer::ChunkPolicy;

use crate::dispatcher::Dispatcher;
use crate::download::DownloadEngine;
use crate::error::AgentError;
use crate::execute::Executor;
use crate::options::AgentOptions;
use crate::ports::{BlobStore, MessageChannel, Provisioner, TwinStore};
use crate::reconciler::{ActionEngines, Reconciler};
use crate::report::ReportWriter;
use crate::state_machine::StateMachine;
use crate::upload::UploadEngine;

const COMMAND_QUEUE: usize = 32;

/// Requests handled by the agent's command loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    SetState(DeviceState),
    /// Run a reconciliation pass if the device is Ready.
    Reconcile,
    Shutdown,
}

/// Cloud-side services the agent talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn TwinStore>,
    pub channel: Arc<dyn MessageChannel>,
    pub blob: Arc<dyn BlobStore>,
    pub provisioner: Arc<dyn Provisioner>,
}

pub struct DeviceAgent {
    state: Arc<StateMachine>,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    commands_tx: mpsc::Sender<AgentCommand>,
    commands_rx: mpsc::Receiver<AgentCommand>,
}

impl DeviceAgent {
    /// Builds the engines. Fails on invalid strict-mode patterns.
    pub fn new(
        options: AgentOptions,
        strict_mode: &StrictModeSettings,
        collaborators: Collaborators,
    ) -> Result<Self, AgentError> {
        let Collaborators {
            store,
            channel,
            blob,
            provisioner,
        } = collaborators;
        let policy = Arc::new(StrictModePolicy::new(strict_mode)?);
        let chunk_policy = ChunkPolicy::for_transport(options.transport);
        let reports = Arc::new(ReportWriter::new(store.clone()));

        let download = Arc::new(DownloadEngine::new(
            channel.clone(),
            reports.clone(),
            policy.clone(),
            chunk_policy,
            options.checksum,
        ));
        let upload = Arc::new(UploadEngine::new(
            store.clone(),
            blob,
            channel.clone(),
            reports.clone(),
            policy,
            chunk_policy,
            options.checksum,
            options.block_size,
        ));
        let executor = Arc::new(Executor::new(reports.clone()));

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let reconciler = Reconciler::new(
            store.clone(),
            reports,
            ActionEngines {
                download: download.clone(),
                upload,
                executor,
            },
        );
        let dispatcher = Dispatcher::new(
            channel,
            store.clone(),
            download,
            provisioner,
            commands_tx.clone(),
            options.receive_timeout,
        );

        let state = Arc::new(StateMachine::new(
            store,
            options.snapshot_path(),
            CancellationToken::new(),
        ));
        state.add_listener(Arc::new(dispatcher.clone()));
        state.add_listener(Arc::new(reconciler.clone()));

        info!(device_id = %options.device_id, transport = ?options.transport, "device agent created");
        Ok(Self {
            state,
            reconciler,
            dispatcher,
            commands_tx,
            commands_rx,
        })
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            state: self.state.clone(),
            commands: self.commands_tx.clone(),
        }
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Enters the initial state, then serves commands until `cancel` fires
    /// or a shutdown is requested.
    ///
    /// An uninitialized device starts provisioning; any other recorded
    /// state is resumed. Failing to read the initial state is fatal.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), AgentError> {
        let init = self.state.get_init_state().await?;
        let start = match init {
            DeviceState::Uninitialized => DeviceState::Provisioning,
            other => other,
        };
        info!(?init, ?start, "starting device agent");
        self.state.set_state(start).await?;

        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                c = self.commands_rx.recv() => c,
            };
            match command {
                Some(AgentCommand::SetState(target)) => {
                    if let Err(e) = self.state.set_state(target).await {
                        warn!(?target, error = %e, "state transition failed");
                    }
                }
                Some(AgentCommand::Reconcile) => self.reconcile().await,
                Some(AgentCommand::Shutdown) | None => break,
            }
        }

        self.state.shutdown();
        info!("device agent stopped");
        Ok(())
    }

    async fn reconcile(&self) {
        if self.state.current_state() != DeviceState::Ready {
            debug!(state = ?self.state.current_state(), "reconcile skipped, device not ready");
            return;
        }
        let Some(scope) = self.state.current_scope().await else {
            return;
        };
        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.on_desired_update(&scope).await {
                warn!(error = %e, "reconciliation pass failed");
            }
        });
    }
}

/// Cloneable handle for code outside the agent task.
#[derive(Clone)]
pub struct AgentHandle {
    state: Arc<StateMachine>,
    commands: mpsc::Sender<AgentCommand>,
}

impl AgentHandle {
    pub fn current_state(&self) -> DeviceState {
        self.state.current_state()
    }

    pub fn ensure_ready(&self) -> Result<(), AgentError> {
        self.state.ensure_ready()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    pub async fn set_state(&self, state: DeviceState) -> Result<(), AgentError> {
        self.send(AgentCommand::SetState(state)).await
    }

    pub async fn request_reconcile(&self) -> Result<(), AgentError> {
        self.send(AgentCommand::Reconcile).await
    }

    pub async fn shutdown(&self) -> Result<(), AgentError> {
        self.send(AgentCommand::Shutdown).await
    }

    async fn send(&self, command: AgentCommand) -> Result<(), AgentError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AgentError::Transport("agent command loop stopped".into()))
    }
}
