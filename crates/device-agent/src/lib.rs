//! Device-side core of the twinsync agent.
//!
//! This crate tracks the device lifecycle, reconciles the desired twin
//! against the reported twin and runs the resulting file transfers. It has
//! no transport dependencies: the daemon supplies [`TwinStore`],
//! [`MessageChannel`], [`BlobStore`] and [`Provisioner`] implementations.
//!
//! # Flow
//!
//! 1. **State machine**: entering Ready or Provisioning opens a fresh
//!    cancellation scope and notifies the listeners
//! 2. **Dispatcher**: receives C2D messages for the scope and routes chunks
//!    and provisioning requests
//! 3. **Reconciler**: diffs desired against reported change specs and
//!    starts the actions that still need to run
//! 4. **Engines**: download, upload and execute actions, reporting through
//!    the single [`ReportWriter`] path

pub mod agent;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod execute;
pub mod memory;
pub mod options;
pub mod ports;
pub mod reconciler;
pub mod report;
pub mod state_machine;
pub mod upload;

pub use agent::{AgentCommand, AgentHandle, Collaborators, DeviceAgent};
pub use dispatcher::{DispatchMode, DispatchOutcome, Dispatcher};
pub use download::{ChunkOutcome, DownloadEngine};
pub use error::AgentError;
pub use execute::Executor;
pub use options::AgentOptions;
pub use ports::{BlobStore, BoxFuture, MessageChannel, Provisioner, TwinStore};
pub use reconciler::{ActionEngines, ActionKey, Reconciler};
pub use report::{ActionToReport, ReportWriter};
pub use state_machine::{StateListener, StateMachine};
pub use upload::{UploadEngine, UploadOutcome, expand_glob};
