//! Execute action runner.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use twinsync_protocol::twin::ExecuteAction;

use crate::error::AgentError;
use crate::report::{ActionToReport, ReportWriter};

/// Characters of process output kept in result texts.
const OUTPUT_TAIL_CHARS: usize = 512;

/// Runs commands requested by execute actions.
pub struct Executor {
    reports: Arc<ReportWriter>,
}

impl Executor {
    pub fn new(reports: Arc<ReportWriter>) -> Self {
        Self { reports }
    }

    /// Runs the command and reports its outcome.
    ///
    /// Exit code 0 is success; any other code fails the action with that
    /// code and the tail of stderr. Cancellation kills the process and
    /// leaves the report non-terminal.
    pub async fn run(
        &self,
        request: &ExecuteAction,
        mut action: ActionToReport,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        action.report.in_progress(0);
        self.reports.update_report_action(&[action.clone()]).await;

        match self.execute(request, cancel).await {
            Ok(output) if output.status.success() => {
                info!(slot = %action.slot(), command = %request.command, "command succeeded");
                action.report.succeed(tail(&output.stdout));
                self.reports.update_report_action(&[action]).await;
                Ok(())
            }
            Ok(output) => {
                let code = output.status.code().unwrap_or(-1);
                warn!(slot = %action.slot(), command = %request.command, code, "command failed");
                action.report.fail(code, tail(&output.stderr));
                self.reports.update_report_action(&[action]).await;
                Ok(())
            }
            Err(AgentError::Cancelled) => {
                info!(slot = %action.slot(), "command cancelled");
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                warn!(slot = %action.slot(), command = %request.command, error = %e, "command did not run");
                action.fail_with(&e);
                self.reports.update_report_action(&[action]).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        request: &ExecuteAction,
        cancel: &CancellationToken,
    ) -> Result<std::process::Output, AgentError> {
        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| AgentError::Execution(format!("{}: {e}", request.command)))?;
        let output = child.wait_with_output();

        // A missing timeout means wait until cancelled.
        let limit = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(Duration::MAX);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(limit, output) => match result {
                Ok(output) => Ok(output?),
                Err(_) => Err(AgentError::Execution(format!(
                    "timed out after {}s",
                    limit.as_secs()
                ))),
            },
        }
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let count = text.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - OUTPUT_TAIL_CHARS).collect()
}
