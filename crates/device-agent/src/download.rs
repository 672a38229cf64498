//! Download engine.
//!
//! A download is requested with a `FileUpdate` event; the cloud then pushes
//! `DownloadChunk` messages which the dispatcher hands to
//! [`DownloadEngine::handle_chunk`]. Chunks are written at their offset, so
//! reordered and duplicated deliveries are harmless.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use twinsync_protocol::messages::{DownloadBlobChunkMessage, FileUpdateEvent};
use twinsync_protocol::twin::DownloadAction;
use twinsync_protocol::{CloudMessage, MessageType};
use twinsync_strict_mode::{Direction, StrictModePolicy};
use twinsync_transfer::{
    ChecksumAlgorithm, ChunkPolicy, FileStorage, RangeSet, TransferClock, TransferError,
    calculate_file_checksum, is_archive, percent_complete, validate_archive_entry,
};

use crate::error::AgentError;
use crate::ports::MessageChannel;
use crate::report::{ActionToReport, ReportWriter};

/// In-flight download for one action id.
struct FileDownload {
    file_name: String,
    target: PathBuf,
    /// Directory archives are extracted into, when unzip was requested.
    unzip_into: Option<PathBuf>,
    written: RangeSet,
    /// Declared size, from the request or the first chunk that carries one.
    total: Option<u64>,
    last_percent: u8,
    clock: TransferClock,
    action: ActionToReport,
    /// Set once the download completed or failed.
    finished: bool,
}

/// Table entry for a tracked download.
///
/// The table lock only guards lookups. Chunk handling locks the record
/// itself, so slow disk work for one action does not stall the others.
struct Tracked {
    change_spec_id: String,
    record: Arc<Mutex<FileDownload>>,
}

/// Progress of one download after a chunk was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More bytes outstanding.
    InProgress { percent: u8 },
    /// A gap was found and re-requested.
    Retransmit { start: u64, end: u64 },
    /// Every byte landed and the action reported success.
    Completed,
}

/// Reassembles downloads from chunk messages.
pub struct DownloadEngine {
    channel: Arc<dyn MessageChannel>,
    reports: Arc<ReportWriter>,
    policy: Arc<StrictModePolicy>,
    chunk_policy: ChunkPolicy,
    checksum: ChecksumAlgorithm,
    storage: FileStorage,
    downloads: Mutex<HashMap<String, Tracked>>,
}

impl DownloadEngine {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        reports: Arc<ReportWriter>,
        policy: Arc<StrictModePolicy>,
        chunk_policy: ChunkPolicy,
        checksum: ChecksumAlgorithm,
    ) -> Self {
        Self {
            channel,
            reports,
            policy,
            chunk_policy,
            checksum,
            storage: FileStorage::new(),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a download and asks the cloud for its first chunks.
    ///
    /// A download already tracked under the same action id is replaced.
    /// A missing destination is reported as a failed action and returns
    /// `Ok`. Strict-mode violations and messenger failures also fail the
    /// action, and are returned to the caller.
    pub async fn init_download(
        &self,
        request: &DownloadAction,
        mut action: ActionToReport,
    ) -> Result<(), AgentError> {
        match self.register(request, &mut action).await {
            Ok(()) => Ok(()),
            Err(AgentError::NoDestination) => {
                warn!(slot = %action.slot(), "download has no destination");
                action.fail_with(&AgentError::NoDestination);
                self.reports.update_report_action(&[action]).await;
                Ok(())
            }
            Err(e) => {
                warn!(slot = %action.slot(), error = %e, "download init failed");
                self.downloads.lock().await.remove(&request.action_id);
                action.fail_with(&e);
                self.reports.update_report_action(&[action]).await;
                Err(e)
            }
        }
    }

    async fn register(
        &self,
        request: &DownloadAction,
        action: &mut ActionToReport,
    ) -> Result<(), AgentError> {
        if request.dest_path.trim().is_empty() {
            return Err(AgentError::NoDestination);
        }
        let file_name = validate_file_name(&request.file_name)?;

        let dest_dir = self
            .policy
            .resolve_root(Direction::Download, &request.dest_path)?;
        let target = format!("{}/{file_name}", dest_dir.trim_end_matches(['/', '\\']));
        self.policy.check_access(Direction::Download, &target)?;
        if let Some(size) = request.file_size {
            self.policy.check_size(Direction::Download, size, &target)?;
        }

        let dest_dir = PathBuf::from(dest_dir);
        let target = PathBuf::from(target);
        prepare_target(&dest_dir, &target).await?;

        info!(
            action_id = %request.action_id,
            target = %target.display(),
            "starting download"
        );
        action.report.in_progress(0);
        let mut download = FileDownload {
            file_name: request.file_name.clone(),
            target,
            unzip_into: request.unzip.then_some(dest_dir),
            written: RangeSet::new(),
            total: request.file_size,
            last_percent: 0,
            clock: TransferClock::start(),
            action: action.clone(),
            finished: false,
        };

        if request.file_size == Some(0) {
            // Nothing to fetch: create the empty file and finish here.
            let storage = self.storage;
            let target = download.target.clone();
            tokio::task::spawn_blocking(move || storage.write_at(&target, 0, &[]))
                .await
                .map_err(AgentError::join)??;
            self.complete(&mut download).await?;
            *action = download.action;
            return Ok(());
        }

        let replaced = self.downloads.lock().await.insert(
            request.action_id.clone(),
            Tracked {
                change_spec_id: action.change_spec_id.clone(),
                record: Arc::new(Mutex::new(download)),
            },
        );
        if let Some(old) = replaced {
            info!(
                action_id = %request.action_id,
                previous = %old.change_spec_id,
                current = %action.change_spec_id,
                "superseded in-flight download"
            );
        }
        self.reports.update_report_action(&[action.clone()]).await;

        let end = request.file_size.unwrap_or(0);
        self.request_range(&request.action_id, &request.file_name, action, 0..end)
            .await
    }

    /// Applies one chunk.
    ///
    /// Fails with [`AgentError::UnknownAction`] when no download is active
    /// for the chunk's action id. Any other failure marks the action failed
    /// and drops its tracking record.
    pub async fn handle_chunk(
        &self,
        msg: DownloadBlobChunkMessage,
    ) -> Result<ChunkOutcome, AgentError> {
        let record = self
            .downloads
            .lock()
            .await
            .get(&msg.action_id)
            .map(|t| t.record.clone());
        let Some(record) = record else {
            return Err(AgentError::UnknownAction(msg.action_id));
        };

        let mut download = record.lock().await;
        if download.finished {
            return Err(AgentError::UnknownAction(msg.action_id));
        }

        match self.apply_chunk(&mut download, &msg).await {
            Ok(ChunkOutcome::Completed) => {
                download.finished = true;
                self.untrack(&msg.action_id, &record).await;
                Ok(ChunkOutcome::Completed)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(action_id = %msg.action_id, error = %e, "download failed");
                download.finished = true;
                download.clock.stop();
                download.action.fail_with(&e);
                self.untrack(&msg.action_id, &record).await;
                self.reports
                    .update_report_action(&[download.action.clone()])
                    .await;
                Err(e)
            }
        }
    }

    /// Drops the table entry for `action_id` if it still points at `record`.
    async fn untrack(&self, action_id: &str, record: &Arc<Mutex<FileDownload>>) {
        let mut downloads = self.downloads.lock().await;
        if downloads
            .get(action_id)
            .is_some_and(|t| Arc::ptr_eq(&t.record, record))
        {
            downloads.remove(action_id);
        }
    }

    /// Settles the declared size against the chunk's `file_size`.
    ///
    /// The first size seen is checked against the zone ceiling. A chunk
    /// that later claims a different size is rejected.
    fn settle_total(
        &self,
        download: &mut FileDownload,
        msg: &DownloadBlobChunkMessage,
    ) -> Result<Option<u64>, AgentError> {
        match (download.total, msg.file_size) {
            (Some(total), size) if size > 0 && size != total => Err(AgentError::SizeMismatch {
                expected: total,
                actual: size,
            }),
            (Some(total), _) => Ok(Some(total)),
            (None, 0) => Ok(None),
            (None, size) => {
                self.policy.check_size(
                    Direction::Download,
                    size,
                    &download.target.to_string_lossy(),
                )?;
                download.total = Some(size);
                Ok(Some(size))
            }
        }
    }

    async fn apply_chunk(
        &self,
        download: &mut FileDownload,
        msg: &DownloadBlobChunkMessage,
    ) -> Result<ChunkOutcome, AgentError> {
        let total = self.settle_total(download, msg)?;
        let out_of_range = |end| AgentError::ChunkOutOfRange {
            offset: msg.offset,
            end,
            total: total.unwrap_or(0),
        };
        let end = msg
            .offset
            .checked_add(msg.data.len() as u64)
            .ok_or_else(|| out_of_range(u64::MAX))?;
        if total.is_some_and(|total| end > total) {
            return Err(out_of_range(end));
        }

        let storage = self.storage;
        let target = download.target.clone();
        let data = msg.data.clone();
        let offset = msg.offset;
        tokio::task::spawn_blocking(move || storage.write_at(&target, offset, &data))
            .await
            .map_err(AgentError::join)??;
        download.written.insert(msg.offset..end);

        if let Some(range_size) = msg.range_size {
            let range = end.saturating_sub(range_size)..end;
            if self.has_gap(download, range.clone()).await? {
                return self.repair_gap(download, msg, range).await;
            }
        }

        let covered = download.written.covered();
        let Some(total) = total else {
            debug!(action_id = %msg.action_id, offset = msg.offset, "chunk written, size unknown");
            return Ok(ChunkOutcome::InProgress { percent: 0 });
        };
        if covered >= total {
            self.complete(download).await?;
            return Ok(ChunkOutcome::Completed);
        }

        let percent = percent_complete(covered, total);
        if percent > download.last_percent {
            download.last_percent = percent;
            download.action.report.in_progress(percent);
            self.reports
                .update_report_action(&[download.action.clone()])
                .await;
        }
        debug!(action_id = %msg.action_id, offset = msg.offset, percent, "chunk written");
        Ok(ChunkOutcome::InProgress { percent })
    }

    /// A range has a gap when it is not fully tracked as written and still
    /// holds zero (never written) bytes on disk.
    async fn has_gap(
        &self,
        download: &FileDownload,
        range: Range<u64>,
    ) -> Result<bool, AgentError> {
        if download.written.contains_all(range.clone()) {
            return Ok(false);
        }
        let storage = self.storage;
        let target = download.target.clone();
        let zeros = tokio::task::spawn_blocking(move || storage.has_zero_bytes(&target, range))
            .await
            .map_err(AgentError::join)??;
        Ok(zeros)
    }

    async fn repair_gap(
        &self,
        download: &mut FileDownload,
        msg: &DownloadBlobChunkMessage,
        range: Range<u64>,
    ) -> Result<ChunkOutcome, AgentError> {
        warn!(
            action_id = %msg.action_id,
            start = range.start,
            end = range.end,
            "gap in received range, requesting retransmission"
        );
        let storage = self.storage;
        let target = download.target.clone();
        let span = range.clone();
        tokio::task::spawn_blocking(move || storage.delete_range(&target, span))
            .await
            .map_err(AgentError::join)??;
        download.written.remove(range.clone());

        self.request_range(&msg.action_id, &download.file_name, &download.action, range.clone())
            .await?;
        Ok(ChunkOutcome::Retransmit {
            start: range.start,
            end: range.end,
        })
    }

    async fn complete(&self, download: &mut FileDownload) -> Result<(), AgentError> {
        download.clock.stop();

        if let Some(dir) = download.unzip_into.clone() {
            if is_archive(&download.target) {
                let storage = self.storage;
                let archive = download.target.clone();
                let count = tokio::task::spawn_blocking(move || storage.unzip(&archive, &dir))
                    .await
                    .map_err(AgentError::join)??;
                info!(target = %download.target.display(), entries = count, "archive extracted");
            } else {
                debug!(target = %download.target.display(), "not an archive, skipping unzip");
            }
        }

        let algorithm = self.checksum;
        let target = download.target.clone();
        let checksum =
            tokio::task::spawn_blocking(move || calculate_file_checksum(&target, algorithm))
                .await
                .map_err(AgentError::join)??;

        let elapsed = download.clock.elapsed();
        let bytes = download.written.covered();
        info!(
            target = %download.target.display(),
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "download complete"
        );
        download.action.report.checksum = checksum;
        download.action.report.succeed(format!(
            "downloaded {bytes} bytes in {:.1}s",
            elapsed.as_secs_f64()
        ));
        self.reports
            .update_report_action(&[download.action.clone()])
            .await;
        Ok(())
    }

    /// Sends a `FileUpdate` request for `range`. An empty range asks for
    /// the whole file.
    async fn request_range(
        &self,
        action_id: &str,
        file_name: &str,
        action: &ActionToReport,
        range: Range<u64>,
    ) -> Result<(), AgentError> {
        let event = FileUpdateEvent {
            action_id: action_id.to_string(),
            file_name: file_name.to_string(),
            chunk_size: self.chunk_policy.chunk_size() as u64,
            start_position: range.start,
            end_position: range.end,
            report_part_name: action.part.clone(),
            action_index: action.index,
            change_spec_id: action.change_spec_id.clone(),
        };
        let message =
            CloudMessage::new(uuid::Uuid::new_v4().to_string(), MessageType::FileUpdate, &event)?;
        self.channel.send_event(message).await
    }

    /// Returns `true` if a download is being tracked for `action_id`.
    pub async fn is_active(&self, action_id: &str) -> bool {
        self.downloads.lock().await.contains_key(action_id)
    }

    /// Returns `true` if `action_id` is being downloaded for the change
    /// spec `change_spec_id`. A record left over from an earlier id does
    /// not count.
    pub async fn is_active_for(&self, action_id: &str, change_spec_id: &str) -> bool {
        self.downloads
            .lock()
            .await
            .get(action_id)
            .is_some_and(|t| t.change_spec_id == change_spec_id)
    }
}

/// A download file name must be a single relative path component.
fn validate_file_name(name: &str) -> Result<String, AgentError> {
    let path = validate_archive_entry(name)?;
    if path.components().count() != 1 {
        return Err(TransferError::InvalidPath(format!("file name has directories: {name}")).into());
    }
    Ok(path.to_string_lossy().into_owned())
}

/// Checks the destination directory and clears any previous target file.
async fn prepare_target(dest_dir: &Path, target: &Path) -> Result<(), AgentError> {
    let dest_dir = dest_dir.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if dest_dir.exists() && !dest_dir.is_dir() {
            return Err(AgentError::NotADirectory(dest_dir.display().to_string()));
        }
        std::fs::create_dir_all(&dest_dir)?;
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    })
    .await
    .map_err(AgentError::join)?
}
