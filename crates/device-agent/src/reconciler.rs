//! Twin reconciler.
//!
//! One pass fetches the twin, compares every desired change spec with its
//! reported mirror and starts the actions that still need to run. Actions
//! run in their own tasks; a pass never waits for them to finish.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinsync_protocol::{
    ChangeSpec, DeviceState, ReportedChangeSpec, StatusType, TwinAction, TwinActionReported,
};

use crate::download::DownloadEngine;
use crate::error::AgentError;
use crate::execute::Executor;
use crate::ports::TwinStore;
use crate::report::{ActionToReport, ReportWriter};
use crate::state_machine::StateListener;
use crate::upload::UploadEngine;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity of one action slot within one change spec version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKey {
    pub change_spec: String,
    pub id: String,
    pub part: String,
    pub index: usize,
}

/// Engines actions are routed to.
#[derive(Clone)]
pub struct ActionEngines {
    pub download: Arc<DownloadEngine>,
    pub upload: Arc<UploadEngine>,
    pub executor: Arc<Executor>,
}

struct Inner {
    store: Arc<dyn TwinStore>,
    reports: Arc<ReportWriter>,
    engines: ActionEngines,
    /// Serialized desired content of each slot when it was last dispatched.
    memo: Mutex<HashMap<ActionKey, String>>,
    /// Slots with a running task.
    active: Mutex<HashSet<ActionKey>>,
    /// Change spec name -> (id, scope of that version's actions).
    epochs: Mutex<HashMap<String, (String, CancellationToken)>>,
    /// Running slots -> (content they were started with, their own scope).
    slots: Mutex<HashMap<ActionKey, (String, CancellationToken)>>,
}

/// Diffs desired against reported change specs and dispatches actions.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn TwinStore>,
        reports: Arc<ReportWriter>,
        engines: ActionEngines,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                reports,
                engines,
                memo: Mutex::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
                epochs: Mutex::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs one reconciliation pass and returns the slots it dispatched.
    ///
    /// With an unchanged change spec id, slots whose report is terminal and
    /// whose desired content did not change are skipped. A new id re-runs
    /// every slot. Slots with a task still running are never started twice.
    /// A running slot that was disabled or whose content changed is
    /// cancelled; a changed slot is started again once its old task ends.
    pub async fn on_desired_update(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ActionKey>, AgentError> {
        let twin = self.inner.store.get_twin().await?;
        let mut dispatched = Vec::new();

        for (name, desired) in &twin.desired.change_spec {
            if cancel.is_cancelled() {
                break;
            }
            let reported = twin.reported.change_spec.get(name).cloned();
            let (current, same_id) = self.inner.reports.seed(name, &desired.id, reported).await;
            if !same_id {
                info!(change_spec = %name, id = %desired.id, "new change spec version");
                lock(&self.inner.memo).retain(|k, _| k.change_spec != *name);
            }
            let scope = self.epoch_scope(name, &desired.id, cancel);
            self.retire_slots(name, desired)?;

            let candidates = self.candidates(name, desired, &current, same_id)?;
            let mut batch = Vec::with_capacity(candidates.len());
            for (key, action, content) in candidates {
                if let TwinAction::Download(req) = &action {
                    let download = &self.inner.engines.download;
                    if download.is_active_for(&req.action_id, &desired.id).await {
                        debug!(?key, "download still receiving chunks");
                        continue;
                    }
                }
                if !lock(&self.inner.active).insert(key.clone()) {
                    debug!(?key, "action already running");
                    continue;
                }
                lock(&self.inner.memo).insert(key.clone(), content.clone());

                let mut report = TwinActionReported::default();
                report.set_status(StatusType::Pending, 0);
                let part_len = desired.patch.get(&key.part).map_or(0, Vec::len);
                let to_report = ActionToReport {
                    change_spec_name: name.clone(),
                    change_spec_id: desired.id.clone(),
                    part: key.part.clone(),
                    index: key.index,
                    part_len,
                    report,
                };
                batch.push((key, action, to_report, content));
            }

            if batch.is_empty() {
                debug!(change_spec = %name, "nothing to dispatch");
                continue;
            }
            let pending: Vec<_> = batch.iter().map(|(_, _, r, _)| r.clone()).collect();
            self.inner.reports.update_report_action(&pending).await;

            for (key, action, to_report, content) in batch {
                debug!(?key, kind = action.kind(), "dispatching action");
                let slot_scope = scope.child_token();
                lock(&self.inner.slots).insert(key.clone(), (content, slot_scope.clone()));
                self.spawn_action(key.clone(), action, to_report, slot_scope);
                dispatched.push(key);
            }
        }

        info!(count = dispatched.len(), "reconciliation pass finished");
        Ok(dispatched)
    }

    /// Slots eligible for dispatch, with their serialized content.
    fn candidates(
        &self,
        name: &str,
        desired: &ChangeSpec,
        current: &ReportedChangeSpec,
        same_id: bool,
    ) -> Result<Vec<(ActionKey, TwinAction, String)>, AgentError> {
        let memo = lock(&self.inner.memo);
        let mut out = Vec::new();

        for (part, actions) in &desired.patch {
            for (index, action) in actions.iter().enumerate() {
                let key = ActionKey {
                    change_spec: name.to_string(),
                    id: desired.id.clone(),
                    part: part.clone(),
                    index,
                };
                if !action.enabled() {
                    debug!(?key, "action disabled");
                    continue;
                }
                let content = serde_json::to_string(action)?;
                if same_id {
                    let terminal = current
                        .report(part, index)
                        .is_some_and(|r| r.status.is_terminal());
                    let unchanged = memo.get(&key).is_none_or(|c| *c == content);
                    if terminal && unchanged {
                        continue;
                    }
                }
                out.push((key, action.clone(), content));
            }
        }
        Ok(out)
    }

    /// Scope for the actions of one change spec version. A new version
    /// cancels the previous version's actions.
    fn epoch_scope(&self, name: &str, id: &str, parent: &CancellationToken) -> CancellationToken {
        let mut epochs = lock(&self.inner.epochs);
        if let Some((epoch_id, token)) = epochs.get(name) {
            if epoch_id == id && !token.is_cancelled() {
                return token.clone();
            }
            if epoch_id != id {
                token.cancel();
            }
        }
        let token = parent.child_token();
        epochs.insert(name.to_string(), (id.to_string(), token.clone()));
        token
    }

    /// Cancels running slots of `name` whose desired action is gone,
    /// disabled, or no longer matches what they were started with.
    fn retire_slots(&self, name: &str, desired: &ChangeSpec) -> Result<(), AgentError> {
        let mut slots = lock(&self.inner.slots);
        let mut retired = Vec::new();
        for (key, (content, _)) in slots.iter() {
            if key.change_spec != name {
                continue;
            }
            let current = match desired.patch.get(&key.part).and_then(|a| a.get(key.index)) {
                Some(action) if key.id == desired.id && action.enabled() => {
                    Some(serde_json::to_string(action)?)
                }
                _ => None,
            };
            if current.as_ref() != Some(content) {
                retired.push(key.clone());
            }
        }
        for key in retired {
            if let Some((_, token)) = slots.remove(&key) {
                info!(?key, "stopping action no longer desired as started");
                token.cancel();
            }
        }
        Ok(())
    }

    fn spawn_action(
        &self,
        key: ActionKey,
        action: TwinAction,
        report: ActionToReport,
        scope: CancellationToken,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = ActiveGuard {
                inner: inner.clone(),
                key: key.clone(),
            };
            let engines = &inner.engines;
            let result = match &action {
                TwinAction::Download(req) => engines.download.init_download(req, report).await,
                TwinAction::Upload(req) => engines.upload.upload(req, report, &scope).await,
                TwinAction::PeriodicUpload(req) => {
                    engines.upload.run_periodic(req, report, &scope).await
                }
                TwinAction::Execute(req) => engines.executor.run(req, report, &scope).await,
                TwinAction::Unsupported => {
                    let mut report = report;
                    let err = AgentError::UnsupportedAction;
                    report.fail_with(&err);
                    inner.reports.update_report_action(&[report]).await;
                    Err(err)
                }
            };
            match result {
                Ok(()) => debug!(?key, "action finished"),
                Err(AgentError::Cancelled) => debug!(?key, "action cancelled"),
                Err(e) => warn!(?key, error = %e, "action failed"),
            }
        });
    }

    /// Returns `true` while a task runs for `key`.
    pub fn is_running(&self, key: &ActionKey) -> bool {
        lock(&self.inner.active).contains(key)
    }
}

/// Releases an action slot when its task ends, however it ends.
struct ActiveGuard {
    inner: Arc<Inner>,
    key: ActionKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        // Slot first: a new task for this key can only start once it is
        // no longer active.
        lock(&self.inner.slots).remove(&self.key);
        lock(&self.inner.active).remove(&self.key);
    }
}

impl StateListener for Reconciler {
    fn on_state_entered(&self, state: DeviceState, scope: &CancellationToken) {
        if state != DeviceState::Ready {
            return;
        }
        let this = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            if let Err(e) = this.on_desired_update(&scope).await {
                warn!(error = %e, "reconciliation pass failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use twinsync_protocol::twin::{DownloadAction, PeriodicUploadAction, UploadAction};
    use twinsync_protocol::{TwinDocument, twin::ExecuteAction};
    use twinsync_strict_mode::StrictModePolicy;
    use twinsync_transfer::{ChecksumAlgorithm, ChunkPolicy, TransportType};

    use super::*;
    use crate::memory::{InMemoryBlobStore, InMemoryChannel, InMemoryTwinStore};

    fn reconciler(store: Arc<InMemoryTwinStore>) -> Reconciler {
        let channel = Arc::new(InMemoryChannel::new());
        let reports = Arc::new(ReportWriter::new(store.clone()));
        let policy = Arc::new(StrictModePolicy::disabled());
        let chunk_policy = ChunkPolicy::for_transport(TransportType::Amqp);
        let engines = ActionEngines {
            download: Arc::new(DownloadEngine::new(
                channel.clone(),
                reports.clone(),
                policy.clone(),
                chunk_policy,
                ChecksumAlgorithm::Md5,
            )),
            upload: Arc::new(UploadEngine::new(
                store.clone(),
                Arc::new(InMemoryBlobStore::new()),
                channel,
                reports.clone(),
                policy,
                chunk_policy,
                ChecksumAlgorithm::Md5,
                1024,
            )),
            executor: Arc::new(Executor::new(reports.clone())),
        };
        Reconciler::new(store, reports, engines)
    }

    fn missing_upload(name: &str) -> TwinAction {
        TwinAction::Upload(UploadAction {
            action_id: name.into(),
            file_name: format!("/nonexistent/twinsync-test/{name}*.log"),
            enabled: true,
            ..UploadAction::default()
        })
    }

    fn spec(id: &str, actions: Vec<TwinAction>) -> ChangeSpec {
        let mut patch = BTreeMap::new();
        patch.insert("Steps".to_string(), actions);
        ChangeSpec {
            id: id.into(),
            patch,
        }
    }

    fn status(store: &InMemoryTwinStore, index: usize) -> Option<StatusType> {
        store
            .reported()
            .change_spec
            .get("cs")
            .and_then(|spec| spec.report("Steps", index).map(|r| r.status))
    }

    async fn wait_terminal(store: &InMemoryTwinStore, index: usize) {
        for _ in 0..200 {
            if status(store, index).is_some_and(|s| s.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("action {index} never finished");
    }

    #[tokio::test]
    async fn terminal_actions_are_not_dispatched_again() {
        let store = Arc::new(InMemoryTwinStore::new());
        store.set_desired("cs", spec("v1", vec![missing_upload("a"), missing_upload("b")]));
        let r = reconciler(store.clone());
        let cancel = CancellationToken::new();

        assert_eq!(r.on_desired_update(&cancel).await.unwrap().len(), 2);
        wait_terminal(&store, 0).await;
        wait_terminal(&store, 1).await;

        assert!(r.on_desired_update(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reported_terminal_state_is_honoured_after_restart() {
        let mut twin = TwinDocument::default();
        twin.desired
            .change_spec
            .insert("cs".into(), spec("v1", vec![missing_upload("a")]));
        let mut reported = ReportedChangeSpec::new("v1");
        reported.entry_mut("Steps", 0).succeed("done");
        twin.reported.change_spec.insert("cs".into(), reported);
        let store = Arc::new(InMemoryTwinStore::with_twin(twin));

        let r = reconciler(store.clone());
        assert!(r.on_desired_update(&CancellationToken::new()).await.unwrap().is_empty());
        assert_eq!(status(&store, 0), Some(StatusType::Success));
    }

    #[tokio::test]
    async fn new_id_redispatches_everything() {
        let store = Arc::new(InMemoryTwinStore::new());
        store.set_desired("cs", spec("v1", vec![missing_upload("a")]));
        let r = reconciler(store.clone());
        let cancel = CancellationToken::new();

        r.on_desired_update(&cancel).await.unwrap();
        wait_terminal(&store, 0).await;

        store.set_desired("cs", spec("v2", vec![missing_upload("a")]));
        let dispatched = r.on_desired_update(&cancel).await.unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].id, "v2");
        wait_terminal(&store, 0).await;
        assert_eq!(store.reported().change_spec["cs"].id, "v2");
    }

    #[tokio::test]
    async fn changed_content_with_same_id_is_dispatched() {
        let store = Arc::new(InMemoryTwinStore::new());
        store.set_desired("cs", spec("v1", vec![missing_upload("a")]));
        let r = reconciler(store.clone());
        let cancel = CancellationToken::new();

        r.on_desired_update(&cancel).await.unwrap();
        wait_terminal(&store, 0).await;

        store.set_desired("cs", spec("v1", vec![missing_upload("other")]));
        assert_eq!(r.on_desired_update(&cancel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_actions_are_skipped() {
        let store = Arc::new(InMemoryTwinStore::new());
        let disabled = TwinAction::Upload(UploadAction {
            file_name: "/nonexistent/x".into(),
            enabled: false,
            ..UploadAction::default()
        });
        store.set_desired("cs", spec("v1", vec![disabled, missing_upload("b")]));
        let r = reconciler(store.clone());

        let dispatched = r.on_desired_update(&CancellationToken::new()).await.unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].index, 1);
    }

    #[tokio::test]
    async fn unsupported_action_is_reported_failed() {
        let store = Arc::new(InMemoryTwinStore::new());
        store.set_desired("cs", spec("v1", vec![TwinAction::Unsupported]));
        let r = reconciler(store.clone());

        r.on_desired_update(&CancellationToken::new()).await.unwrap();
        wait_terminal(&store, 0).await;
        let report = store.reported().change_spec["cs"]
            .report("Steps", 0)
            .cloned()
            .unwrap();
        assert_eq!(report.status, StatusType::Failed);
        assert_eq!(report.result_code, AgentError::UnsupportedAction.result_code());
    }

    fn periodic(name: &str, interval_secs: u64, enabled: bool) -> TwinAction {
        TwinAction::PeriodicUpload(PeriodicUploadAction {
            action_id: name.into(),
            file_name: format!("/nonexistent/twinsync-test/{name}*.log"),
            interval_secs,
            enabled,
            ..PeriodicUploadAction::default()
        })
    }

    async fn wait_stopped(r: &Reconciler, key: &ActionKey) {
        for _ in 0..200 {
            if !r.is_running(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{key:?} still running");
    }

    #[tokio::test]
    async fn disabling_running_periodic_upload_stops_it() {
        let store = Arc::new(InMemoryTwinStore::new());
        store.set_desired("cs", spec("v1", vec![periodic("p", 3600, true)]));
        let r = reconciler(store.clone());
        let cancel = CancellationToken::new();

        let started = r.on_desired_update(&cancel).await.unwrap();
        assert_eq!(started.len(), 1);
        assert!(r.is_running(&started[0]));

        store.set_desired("cs", spec("v1", vec![periodic("p", 3600, false)]));
        assert!(r.on_desired_update(&cancel).await.unwrap().is_empty());
        wait_stopped(&r, &started[0]).await;
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn changed_periodic_upload_restarts_with_new_content() {
        let store = Arc::new(InMemoryTwinStore::new());
        store.set_desired("cs", spec("v1", vec![periodic("p", 3600, true)]));
        let r = reconciler(store.clone());
        let cancel = CancellationToken::new();

        let started = r.on_desired_update(&cancel).await.unwrap();
        store.set_desired("cs", spec("v1", vec![periodic("p", 60, true)]));
        let mut restarted = r.on_desired_update(&cancel).await.unwrap();
        for _ in 0..200 {
            if !restarted.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            restarted = r.on_desired_update(&cancel).await.unwrap();
        }
        assert_eq!(restarted, started);
        assert!(r.is_running(&restarted[0]));
        cancel.cancel();
    }

    #[tokio::test]
    async fn new_id_redispatches_in_flight_download() {
        let store = Arc::new(InMemoryTwinStore::new());
        let dest = tempfile::TempDir::new().unwrap();
        let download = TwinAction::Download(DownloadAction {
            action_id: "dl".into(),
            file_name: "fw.bin".into(),
            dest_path: dest.path().to_string_lossy().into_owned(),
            file_size: Some(64),
            enabled: true,
            ..DownloadAction::default()
        });
        store.set_desired("cs", spec("v1", vec![download.clone()]));
        let r = reconciler(store.clone());
        let cancel = CancellationToken::new();

        let first = r.on_desired_update(&cancel).await.unwrap();
        assert_eq!(first.len(), 1);
        wait_stopped(&r, &first[0]).await;
        assert!(r.inner.engines.download.is_active_for("dl", "v1").await);
        // Still receiving chunks under v1.
        assert!(r.on_desired_update(&cancel).await.unwrap().is_empty());

        store.set_desired("cs", spec("v2", vec![download]));
        let second = r.on_desired_update(&cancel).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "v2");
        wait_stopped(&r, &second[0]).await;
        assert!(r.inner.engines.download.is_active_for("dl", "v2").await);
        assert_eq!(store.reported().change_spec["cs"].id, "v2");
        assert_eq!(status(&store, 0), Some(StatusType::InProgress));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn running_action_is_not_started_twice() {
        let store = Arc::new(InMemoryTwinStore::new());
        let sleeper = TwinAction::Execute(ExecuteAction {
            action_id: "sleep".into(),
            command: "sleep".into(),
            args: vec!["5".into()],
            enabled: true,
            ..ExecuteAction::default()
        });
        store.set_desired("cs", spec("v1", vec![sleeper]));
        let r = reconciler(store.clone());
        let cancel = CancellationToken::new();

        let first = r.on_desired_update(&cancel).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(r.is_running(&first[0]));
        assert!(r.on_desired_update(&cancel).await.unwrap().is_empty());

        cancel.cancel();
        for _ in 0..200 {
            if !r.is_running(&first[0]) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!r.is_running(&first[0]));
        assert_ne!(status(&store, 0), Some(StatusType::Success));
    }
}
