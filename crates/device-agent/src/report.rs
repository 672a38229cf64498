//! Serialized write path for reported change specifications.
//!
//! Every status change (reconciler dispatch, download chunks, uploads,
//! executions) goes through [`ReportWriter`], which merges the change into
//! a cached [`ReportedChangeSpec`] and writes the whole change spec back
//! while still holding the lock. Concurrent updates for different action
//! slots therefore never overwrite each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use twinsync_protocol::{ReportedChangeSpec, ReportedPatch, TwinActionReported};

use crate::error::AgentError;
use crate::ports::TwinStore;

/// Binds one desired action occurrence to its report entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionToReport {
    pub change_spec_name: String,
    pub change_spec_id: String,
    /// Report part name.
    pub part: String,
    /// Position in the part's action array.
    pub index: usize,
    /// Length of the desired action array for `part`.
    pub part_len: usize,
    pub report: TwinActionReported,
}

impl ActionToReport {
    /// Marks the report failed with the error's code and message.
    pub fn fail_with(&mut self, err: &AgentError) {
        self.report.fail(err.result_code(), err.to_string());
    }

    /// Short identifier for logs.
    pub fn slot(&self) -> String {
        format!("{}/{}[{}]", self.change_spec_name, self.part, self.index)
    }
}

/// Single update path for reported change specs.
pub struct ReportWriter {
    store: Arc<dyn TwinStore>,
    cache: Mutex<HashMap<String, ReportedChangeSpec>>,
}

impl ReportWriter {
    pub fn new(store: Arc<dyn TwinStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Aligns the cache with the desired change spec `id`.
    ///
    /// Keeps the cached copy when its id already matches, otherwise adopts
    /// the fetched `reported` copy when that matches, otherwise starts an
    /// empty report. Returns the resulting report and whether the previous
    /// view (cache, or fetched when uncached) already had `id`.
    pub async fn seed(
        &self,
        name: &str,
        id: &str,
        reported: Option<ReportedChangeSpec>,
    ) -> (ReportedChangeSpec, bool) {
        let mut cache = self.cache.lock().await;
        let previous_id = cache
            .get(name)
            .map(|spec| spec.id.clone())
            .or_else(|| reported.as_ref().map(|spec| spec.id.clone()));
        let same_id = previous_id.as_deref() == Some(id);

        let cached_matches = cache.get(name).is_some_and(|spec| spec.id == id);
        if !cached_matches {
            let fresh = match reported {
                Some(spec) if spec.id == id => spec,
                _ => ReportedChangeSpec::new(id),
            };
            debug!(change_spec = name, id, "seeding reported change spec");
            cache.insert(name.to_string(), fresh);
        }

        let current = cache
            .get(name)
            .cloned()
            .unwrap_or_else(|| ReportedChangeSpec::new(id));
        (current, same_id)
    }

    /// Returns the cached report for change spec `name`.
    pub async fn snapshot(&self, name: &str) -> Option<ReportedChangeSpec> {
        self.cache.lock().await.get(name).cloned()
    }

    /// Merges `actions` and persists every touched change spec.
    ///
    /// Updates carrying a change spec id other than the cached one are
    /// stale (a newer deployment replaced them) and are dropped.
    pub async fn try_update_report_action(
        &self,
        actions: &[ActionToReport],
    ) -> Result<(), AgentError> {
        let mut cache = self.cache.lock().await;
        let mut touched: Vec<&str> = Vec::new();

        for action in actions {
            let spec = cache
                .entry(action.change_spec_name.clone())
                .or_insert_with(|| ReportedChangeSpec::new(action.change_spec_id.clone()));
            if spec.id != action.change_spec_id {
                debug!(
                    slot = %action.slot(),
                    stale_id = %action.change_spec_id,
                    current_id = %spec.id,
                    "dropping stale report"
                );
                continue;
            }
            spec.pad_to(&action.part, action.part_len);
            *spec.entry_mut(&action.part, action.index) = action.report.clone();
            if !touched.contains(&action.change_spec_name.as_str()) {
                touched.push(&action.change_spec_name);
            }
        }

        for name in touched {
            if let Some(spec) = cache.get(name) {
                let patch = ReportedPatch::change_spec(name, spec)?;
                self.store.update_reported(patch).await?;
            }
        }
        Ok(())
    }

    /// Like [`try_update_report_action`](Self::try_update_report_action),
    /// but logs and swallows failures. The next update or reconciliation
    /// pass writes the merged state again.
    pub async fn update_report_action(&self, actions: &[ActionToReport]) {
        if let Err(e) = self.try_update_report_action(actions).await {
            warn!(error = %e, count = actions.len(), "failed to persist action reports");
        }
    }
}
