//! Upload engine.
//!
//! Sources are resolved from a glob, checked against strict mode, then sent
//! either as a block blob behind a SAS URI or as a sequence of
//! `StreamingUploadChunk` events. Matching directories are zipped in memory
//! first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use twinsync_protocol::messages::{FileUploadCompletionNotification, StreamingUploadChunkEvent};
use twinsync_protocol::twin::{PeriodicUploadAction, UploadAction, UploadMethod};
use twinsync_protocol::{CloudMessage, MessageType};
use twinsync_strict_mode::{Direction, GlobPattern, StrictModePolicy};
use twinsync_transfer::{
    Checksum, ChecksumAlgorithm, Chunk, ChunkPolicy, ChunkReader, FileStorage, ProgressThrottle,
    calculate_file_checksum, checksum_bytes, percent_complete,
};

use crate::error::AgentError;
use crate::ports::{BlobStore, MessageChannel, TwinStore};
use crate::report::{ActionToReport, ReportWriter};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

enum SourceData {
    File(PathBuf),
    Zipped(Vec<u8>),
}

/// One resolved upload source.
struct UploadSource {
    /// Name the cloud sees: the file name, or `<dir>.zip` for directories.
    name: String,
    len: u64,
    data: SourceData,
}

impl UploadSource {
    async fn checksum(&self, algorithm: ChecksumAlgorithm) -> Result<String, AgentError> {
        match &self.data {
            SourceData::File(path) => {
                let path = path.clone();
                Ok(
                    tokio::task::spawn_blocking(move || calculate_file_checksum(&path, algorithm))
                        .await
                        .map_err(AgentError::join)??,
                )
            }
            SourceData::Zipped(bytes) => Ok(checksum_bytes(algorithm, bytes)),
        }
    }

    fn into_reader(self, chunk_size: usize) -> Result<ChunkReader, AgentError> {
        Ok(match self.data {
            SourceData::File(path) => ChunkReader::from_path(&path, chunk_size)?,
            SourceData::Zipped(bytes) => ChunkReader::from_bytes(bytes, chunk_size),
        })
    }
}

/// Reads the next chunk off the blocking pool.
async fn read_next(mut reader: ChunkReader) -> Result<(ChunkReader, Option<Chunk>), AgentError> {
    tokio::task::spawn_blocking(move || {
        let chunk = reader.next_chunk()?;
        Ok((reader, chunk))
    })
    .await
    .map_err(AgentError::join)?
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Expands a path pattern into matching files and directories, sorted.
///
/// Wildcards are honoured in the last path component only. A pattern
/// without wildcards matches itself if it exists.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, AgentError> {
    let normalized = pattern.replace('\\', "/");
    if !has_wildcard(&normalized) {
        let path = PathBuf::from(&normalized);
        return Ok(if path.exists() { vec![path] } else { Vec::new() });
    }

    let (dir, name_glob) = match normalized.rfind('/') {
        Some(0) => ("/", &normalized[1..]),
        Some(i) => (&normalized[..i], &normalized[i + 1..]),
        None => (".", normalized.as_str()),
    };
    if has_wildcard(dir) || !Path::new(dir).is_dir() {
        return Ok(Vec::new());
    }

    let matcher = GlobPattern::new(name_glob)?;
    let mut matches = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if matcher.is_match(&entry.file_name().to_string_lossy()) {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

// ---------------------------------------------------------------------------
// UploadEngine
// ---------------------------------------------------------------------------

/// Identifies the action an upload belongs to.
struct UploadContext<'a> {
    action_id: &'a str,
    change_spec_id: &'a str,
    cancel: &'a CancellationToken,
}

/// Result of uploading one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub name: String,
    pub bytes: u64,
    pub checksum: String,
    pub correlation_id: String,
}

/// Runs upload and periodic upload actions.
pub struct UploadEngine {
    store: Arc<dyn TwinStore>,
    blob: Arc<dyn BlobStore>,
    channel: Arc<dyn MessageChannel>,
    reports: Arc<ReportWriter>,
    policy: Arc<StrictModePolicy>,
    chunk_policy: ChunkPolicy,
    checksum: ChecksumAlgorithm,
    block_size: usize,
    storage: FileStorage,
}

impl UploadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TwinStore>,
        blob: Arc<dyn BlobStore>,
        channel: Arc<dyn MessageChannel>,
        reports: Arc<ReportWriter>,
        policy: Arc<StrictModePolicy>,
        chunk_policy: ChunkPolicy,
        checksum: ChecksumAlgorithm,
        block_size: usize,
    ) -> Self {
        Self {
            store,
            blob,
            channel,
            reports,
            policy,
            chunk_policy,
            checksum,
            block_size: block_size.max(1),
            storage: FileStorage::new(),
        }
    }

    /// Runs one upload action to completion and reports the outcome.
    ///
    /// An empty glob expansion is a failed report, not an error.
    /// Cancellation leaves the report non-terminal so the next pass
    /// resumes it.
    pub async fn upload(
        &self,
        request: &UploadAction,
        mut action: ActionToReport,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let change_spec_id = action.change_spec_id.clone();
        let ctx = UploadContext {
            action_id: &request.action_id,
            change_spec_id: &change_spec_id,
            cancel,
        };
        match self
            .upload_all(&request.file_name, request.method, &mut action, &ctx)
            .await
        {
            Ok(outcomes) => {
                let bytes: u64 = outcomes.iter().map(|o| o.bytes).sum();
                if let Some(last) = outcomes.last() {
                    action.report.checksum = last.checksum.clone();
                    action.report.correlation_id = last.correlation_id.clone();
                }
                info!(slot = %action.slot(), files = outcomes.len(), bytes, "upload complete");
                action
                    .report
                    .succeed(format!("uploaded {} file(s), {bytes} bytes", outcomes.len()));
                self.reports.update_report_action(&[action]).await;
                Ok(())
            }
            Err(AgentError::Cancelled) => {
                info!(slot = %action.slot(), "upload cancelled");
                Err(AgentError::Cancelled)
            }
            Err(e @ AgentError::NoFilesToUpload(_)) => {
                warn!(slot = %action.slot(), error = %e, "nothing to upload");
                action.fail_with(&e);
                self.reports.update_report_action(&[action]).await;
                Ok(())
            }
            Err(e) => {
                warn!(slot = %action.slot(), error = %e, "upload failed");
                action.fail_with(&e);
                self.reports.update_report_action(&[action]).await;
                Err(e)
            }
        }
    }

    async fn upload_all(
        &self,
        pattern: &str,
        method: UploadMethod,
        action: &mut ActionToReport,
        ctx: &UploadContext<'_>,
    ) -> Result<Vec<UploadOutcome>, AgentError> {
        let sources = self.resolve_sources(pattern).await?;
        if sources.is_empty() {
            return Err(AgentError::NoFilesToUpload(pattern.to_string()));
        }

        action.report.in_progress(0);
        self.reports.update_report_action(&[action.clone()]).await;

        let count = sources.len();
        let mut outcomes = Vec::with_capacity(count);
        for (i, source) in sources.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            // Block-level progress only for single-source uploads; otherwise
            // one update per file.
            let progress = if count == 1 { Some(&mut *action) } else { None };
            outcomes.push(self.upload_source(source, method, ctx, progress).await?);

            if i + 1 < count {
                action
                    .report
                    .in_progress(percent_complete((i + 1) as u64, count as u64));
                self.reports.update_report_action(&[action.clone()]).await;
            }
        }
        Ok(outcomes)
    }

    /// Expands `pattern` and applies strict mode to every match.
    async fn resolve_sources(&self, pattern: &str) -> Result<Vec<UploadSource>, AgentError> {
        let resolved = self.policy.resolve_root(Direction::Upload, pattern)?;
        let paths = tokio::task::spawn_blocking(move || expand_glob(&resolved))
            .await
            .map_err(AgentError::join)??;

        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let display = path.to_string_lossy().into_owned();
            self.policy.check_access(Direction::Upload, &display)?;

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| display.clone());
            let source = if path.is_dir() {
                let storage = self.storage;
                let dir = path.clone();
                let bytes = tokio::task::spawn_blocking(move || storage.zip_directory(&dir))
                    .await
                    .map_err(AgentError::join)??;
                debug!(dir = %path.display(), bytes = bytes.len(), "zipped directory for upload");
                UploadSource {
                    name: format!("{name}.zip"),
                    len: bytes.len() as u64,
                    data: SourceData::Zipped(bytes),
                }
            } else {
                let len = tokio::fs::metadata(&path).await?.len();
                UploadSource {
                    name,
                    len,
                    data: SourceData::File(path),
                }
            };
            self.policy
                .check_size(Direction::Upload, source.len, &display)?;
            sources.push(source);
        }
        Ok(sources)
    }

    async fn upload_source(
        &self,
        source: UploadSource,
        method: UploadMethod,
        ctx: &UploadContext<'_>,
        progress: Option<&mut ActionToReport>,
    ) -> Result<UploadOutcome, AgentError> {
        match method {
            UploadMethod::Blob => self.upload_blob(source, ctx, progress).await,
            UploadMethod::Stream => self.upload_stream(source, ctx).await,
        }
    }

    // -----------------------------------------------------------------------
    // Blob method
    // -----------------------------------------------------------------------

    async fn upload_blob(
        &self,
        source: UploadSource,
        ctx: &UploadContext<'_>,
        progress: Option<&mut ActionToReport>,
    ) -> Result<UploadOutcome, AgentError> {
        let blob_name = format!("{}/{}", ctx.change_spec_id, source.name);
        let sas = self.store.get_upload_sas(&blob_name).await?;
        let name = source.name.clone();
        let bytes = source.len;

        let result = self.put_blocks(&sas.sas_uri, source, ctx, progress).await;
        let notification = completion(&sas.correlation_id, &result);
        if let Err(e) = self.store.notify_upload_complete(notification).await {
            match &result {
                Ok(_) => return Err(e),
                Err(_) => warn!(error = %e, blob = %blob_name, "failure notification not delivered"),
            }
        }

        let checksum = result?;
        debug!(blob = %blob_name, bytes, "blob upload complete");
        Ok(UploadOutcome {
            name,
            bytes,
            checksum,
            correlation_id: sas.correlation_id,
        })
    }

    async fn put_blocks(
        &self,
        sas_uri: &str,
        source: UploadSource,
        ctx: &UploadContext<'_>,
        mut progress: Option<&mut ActionToReport>,
    ) -> Result<String, AgentError> {
        let total = source.len;
        let mut reader = source.into_reader(self.block_size)?;
        let mut hasher = Checksum::new(self.checksum);
        let mut throttle = ProgressThrottle::new();
        let mut block_ids: Vec<String> = Vec::new();

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let (next, chunk) = read_next(reader).await?;
            reader = next;
            let Some(chunk) = chunk else { break };

            hasher.update(&chunk.data);
            let end = chunk.end();
            let block_id = STANDARD.encode(format!("block-{:06}", block_ids.len()));
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
                result = self.blob.put_block(sas_uri, &block_id, chunk.data) => result?,
            }
            block_ids.push(block_id);

            let percent = percent_complete(end, total);
            if let Some(action) = progress.as_deref_mut() {
                if percent < 100 && throttle.should_emit(percent) {
                    action.report.in_progress(percent);
                    self.reports.update_report_action(&[action.clone()]).await;
                }
            }
        }

        self.blob.commit_block_list(sas_uri, &block_ids).await?;
        Ok(hasher.finalize())
    }

    // -----------------------------------------------------------------------
    // Stream method
    // -----------------------------------------------------------------------

    async fn upload_stream(
        &self,
        source: UploadSource,
        ctx: &UploadContext<'_>,
    ) -> Result<UploadOutcome, AgentError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let name = source.name.clone();
        let bytes = source.len;

        let result = self.send_chunks(source, ctx).await;
        let notification = completion(&correlation_id, &result);
        if let Err(e) = self.store.notify_upload_complete(notification).await {
            match &result {
                Ok(_) => return Err(e),
                Err(_) => warn!(error = %e, file = %name, "failure notification not delivered"),
            }
        }

        Ok(UploadOutcome {
            name,
            bytes,
            checksum: result?,
            correlation_id,
        })
    }

    /// Sends the source as fixed-size chunks; only the last carries the
    /// checksum of the whole stream.
    async fn send_chunks(
        &self,
        source: UploadSource,
        ctx: &UploadContext<'_>,
    ) -> Result<String, AgentError> {
        let checksum = source.checksum(self.checksum).await?;
        let name = source.name.clone();
        let total = source.len;
        let mut reader = source.into_reader(self.chunk_policy.chunk_size())?;

        let event = |start_position: u64, data: Vec<u8>, is_last: bool| StreamingUploadChunkEvent {
            action_id: ctx.action_id.to_string(),
            file_name: name.clone(),
            change_spec_id: ctx.change_spec_id.to_string(),
            start_position,
            data,
            checksum: is_last.then(|| checksum.clone()),
            is_last,
        };

        if total == 0 {
            self.send_event(event(0, Vec::new(), true), ctx.cancel).await?;
            return Ok(checksum);
        }

        let mut sent = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let (next, chunk) = read_next(reader).await?;
            reader = next;
            let Some(chunk) = chunk else { break };

            let is_last = chunk.end() >= total;
            self.send_event(event(chunk.offset, chunk.data, is_last), ctx.cancel)
                .await?;
            sent += 1;
        }
        debug!(file = %name, chunks = sent, chunk_size = reader.chunk_size(), "stream upload sent");
        Ok(checksum)
    }

    async fn send_event(
        &self,
        event: StreamingUploadChunkEvent,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let message = CloudMessage::new(
            uuid::Uuid::new_v4().to_string(),
            MessageType::StreamingUploadChunk,
            &event,
        )?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.channel.send_event(message) => result,
        }
    }

    // -----------------------------------------------------------------------
    // Periodic uploads
    // -----------------------------------------------------------------------

    /// Uploads the matching files every `interval_secs` until cancelled.
    ///
    /// Each file's latest outcome lands in `periodicReported[<name>]`; the
    /// action itself stays in progress.
    pub async fn run_periodic(
        &self,
        request: &PeriodicUploadAction,
        mut action: ActionToReport,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let period = Duration::from_secs(request.interval_secs.max(1));
        info!(slot = %action.slot(), period_secs = period.as_secs(), "periodic upload started");

        action.report.in_progress(0);
        self.reports.update_report_action(&[action.clone()]).await;

        let change_spec_id = action.change_spec_id.clone();
        let ctx = UploadContext {
            action_id: &request.action_id,
            change_spec_id: &change_spec_id,
            cancel,
        };
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(slot = %action.slot(), "periodic upload stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if let Err(AgentError::Cancelled) = self.periodic_pass(request, &mut action, &ctx).await
            {
                return Ok(());
            }
            let progress = action.report.progress;
            action.report.in_progress(progress);
            self.reports.update_report_action(&[action.clone()]).await;
        }
    }

    async fn periodic_pass(
        &self,
        request: &PeriodicUploadAction,
        action: &mut ActionToReport,
        ctx: &UploadContext<'_>,
    ) -> Result<(), AgentError> {
        let sources = match self.resolve_sources(&request.file_name).await {
            Ok(sources) => sources,
            Err(e) => {
                warn!(slot = %action.slot(), error = %e, "periodic upload resolution failed");
                action
                    .report
                    .periodic_reported
                    .entry(request.file_name.clone())
                    .or_default()
                    .fail(e.result_code(), e.to_string());
                return Ok(());
            }
        };
        if sources.is_empty() {
            debug!(slot = %action.slot(), pattern = %request.file_name, "no files this period");
            return Ok(());
        }

        let slot = action.slot();
        for source in sources {
            let name = source.name.clone();
            let result = self.upload_source(source, request.method, ctx, None).await;
            let entry = action.report.periodic_reported.entry(name).or_default();
            match result {
                Ok(outcome) => {
                    entry.checksum = outcome.checksum;
                    entry.correlation_id = outcome.correlation_id;
                    entry.succeed(format!("uploaded {} bytes", outcome.bytes));
                }
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => {
                    warn!(%slot, error = %e, "periodic file upload failed");
                    entry.fail(e.result_code(), e.to_string());
                }
            }
        }
        Ok(())
    }
}

fn completion<T>(
    correlation_id: &str,
    result: &Result<T, AgentError>,
) -> FileUploadCompletionNotification {
    match result {
        Ok(_) => FileUploadCompletionNotification {
            correlation_id: correlation_id.to_string(),
            is_success: true,
            status_code: 200,
            status_description: String::new(),
        },
        Err(e) => FileUploadCompletionNotification {
            correlation_id: correlation_id.to_string(),
            is_success: false,
            status_code: e.result_code(),
            status_description: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryBlobStore, InMemoryChannel, InMemoryTwinStore};
    use tempfile::TempDir;
    use twinsync_protocol::StatusType;
    use twinsync_protocol::twin::TwinActionReported;
    use twinsync_strict_mode::{RestrictionZone, StrictModeSettings};
    use twinsync_transfer::TransportType;

    struct Fixture {
        store: Arc<InMemoryTwinStore>,
        blob: Arc<InMemoryBlobStore>,
        channel: Arc<InMemoryChannel>,
        engine: UploadEngine,
        dir: TempDir,
    }

    async fn fixture_with(policy: StrictModePolicy, block_size: usize) -> Fixture {
        let store = Arc::new(InMemoryTwinStore::new());
        let blob = Arc::new(InMemoryBlobStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let reports = Arc::new(ReportWriter::new(store.clone()));
        reports.seed("logs", "v7", None).await;
        let engine = UploadEngine::new(
            store.clone(),
            blob.clone(),
            channel.clone(),
            reports,
            Arc::new(policy),
            ChunkPolicy::for_transport(TransportType::Mqtt),
            ChecksumAlgorithm::Md5,
            block_size,
        );
        Fixture {
            store,
            blob,
            channel,
            engine,
            dir: TempDir::new().unwrap(),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(StrictModePolicy::disabled(), 4).await
    }

    fn action() -> ActionToReport {
        ActionToReport {
            change_spec_name: "logs".into(),
            change_spec_id: "v7".into(),
            part: "Uploads".into(),
            index: 0,
            part_len: 1,
            report: TwinActionReported::default(),
        }
    }

    fn request(pattern: String, method: UploadMethod) -> UploadAction {
        UploadAction {
            action_id: "up1".into(),
            file_name: pattern,
            method,
            enabled: true,
            description: String::new(),
        }
    }

    fn report(store: &InMemoryTwinStore) -> TwinActionReported {
        store.reported().change_spec["logs"].patch["Uploads"][0].clone()
    }

    fn pattern(dir: &Path, glob: &str) -> String {
        format!("{}/{glob}", dir.to_string_lossy())
    }

    #[test]
    fn glob_expansion() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("c.png"), b"c").unwrap();
        std::fs::create_dir(dir.path().join("logs.txt")).unwrap();

        let found = expand_glob(&pattern(dir.path(), "*.txt")).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "logs.txt"]);

        assert_eq!(expand_glob(&pattern(dir.path(), "c.png")).unwrap().len(), 1);
        assert!(expand_glob(&pattern(dir.path(), "missing.bin")).unwrap().is_empty());
        assert!(expand_glob("/nonexistent-dir/*.txt").unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_matches_is_failed_report() {
        let f = fixture().await;
        let req = request(pattern(f.dir.path(), "*.log"), UploadMethod::Blob);
        f.engine
            .upload(&req, action(), &CancellationToken::new())
            .await
            .unwrap();

        let r = report(&f.store);
        assert_eq!(r.status, StatusType::Failed);
        assert!(r.result_text.contains("no files"));
        assert!(f.store.sas_requests().is_empty());
    }

    #[tokio::test]
    async fn blob_upload_commits_blocks_and_notifies() {
        let f = fixture().await;
        std::fs::write(f.dir.path().join("app.log"), b"0123456789").unwrap();
        let req = request(pattern(f.dir.path(), "app.log"), UploadMethod::Blob);
        f.engine
            .upload(&req, action(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.store.sas_requests(), vec!["v7/app.log".to_string()]);
        assert_eq!(f.blob.put_count(), 3);
        assert_eq!(f.blob.blob("memory://v7/app.log").unwrap(), b"0123456789");

        let notes = f.store.notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].is_success);
        assert_eq!(notes[0].correlation_id, "corr-1");

        let r = report(&f.store);
        assert_eq!(r.status, StatusType::Success);
        assert_eq!(r.correlation_id, "corr-1");
        assert_eq!(r.checksum, checksum_bytes(ChecksumAlgorithm::Md5, b"0123456789"));
    }

    #[tokio::test]
    async fn blob_failure_still_notifies() {
        let f = fixture().await;
        std::fs::write(f.dir.path().join("app.log"), b"data").unwrap();
        f.blob.fail_puts(true);
        let req = request(pattern(f.dir.path(), "app.log"), UploadMethod::Blob);
        let result = f
            .engine
            .upload(&req, action(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AgentError::Blob(_))));
        let notes = f.store.notifications();
        assert_eq!(notes.len(), 1);
        assert!(!notes[0].is_success);
        assert_eq!(notes[0].correlation_id, "corr-1");
        assert_eq!(report(&f.store).status, StatusType::Failed);
    }

    #[tokio::test]
    async fn directory_is_zipped() {
        let f = fixture_with(StrictModePolicy::disabled(), 1 << 20).await;
        let logs = f.dir.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        std::fs::write(logs.join("a.txt"), b"alpha").unwrap();

        let req = request(logs.to_string_lossy().into_owned(), UploadMethod::Blob);
        f.engine
            .upload(&req, action(), &CancellationToken::new())
            .await
            .unwrap();

        let blob = f.blob.blob("memory://v7/logs.zip").unwrap();
        assert_eq!(&blob[..2], b"PK");
    }

    #[tokio::test]
    async fn stream_upload_tags_only_last_chunk() {
        let f = fixture().await;
        let chunk_size = ChunkPolicy::for_transport(TransportType::Mqtt).chunk_size();
        let data = vec![3u8; chunk_size * 2 + 10];
        std::fs::write(f.dir.path().join("dump.bin"), &data).unwrap();

        let req = request(pattern(f.dir.path(), "dump.bin"), UploadMethod::Stream);
        f.engine
            .upload(&req, action(), &CancellationToken::new())
            .await
            .unwrap();

        let chunks: Vec<StreamingUploadChunkEvent> = f
            .channel
            .sent_of_type(MessageType::StreamingUploadChunk)
            .iter()
            .map(|m| m.parse_body().unwrap())
            .collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[..2].iter().all(|c| c.checksum.is_none() && !c.is_last));
        assert!(chunks[..2].iter().all(|c| c.data.len() == chunk_size));
        assert!(chunks[2].is_last);
        assert_eq!(
            chunks[2].checksum.as_deref(),
            Some(checksum_bytes(ChecksumAlgorithm::Md5, &data).as_str())
        );
        assert_eq!(chunks[1].start_position, chunk_size as u64);
        assert_eq!(chunks[2].change_spec_id, "v7");

        assert!(f.store.notifications()[0].is_success);
        assert_eq!(report(&f.store).status, StatusType::Success);
    }

    #[tokio::test]
    async fn empty_file_streams_single_last_chunk() {
        let f = fixture().await;
        std::fs::write(f.dir.path().join("empty.log"), b"").unwrap();
        let req = request(pattern(f.dir.path(), "empty.log"), UploadMethod::Stream);
        f.engine
            .upload(&req, action(), &CancellationToken::new())
            .await
            .unwrap();

        let sent = f.channel.sent_of_type(MessageType::StreamingUploadChunk);
        assert_eq!(sent.len(), 1);
        let evt: StreamingUploadChunkEvent = sent[0].parse_body().unwrap();
        assert!(evt.is_last && evt.checksum.is_some());
    }

    #[tokio::test]
    async fn cancelled_upload_stays_non_terminal() {
        let f = fixture().await;
        std::fs::write(f.dir.path().join("app.log"), b"0123456789").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let req = request(pattern(f.dir.path(), "app.log"), UploadMethod::Blob);
        let result = f.engine.upload(&req, action(), &cancel).await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert_eq!(report(&f.store).status, StatusType::InProgress);
        assert!(f.store.sas_requests().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_denies_upload() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("img.png"), b"png").unwrap();
        let settings = StrictModeSettings {
            enabled: true,
            allow_patterns: Vec::new(),
            restrictions: vec![RestrictionZone {
                id: "LogUploadAllow".into(),
                direction: Direction::Upload,
                root: format!("{}/", dir.path().to_string_lossy()),
                max_size: None,
                allow_patterns: vec!["*.txt".into()],
                deny_patterns: Vec::new(),
            }],
        };
        let f = fixture_with(StrictModePolicy::new(&settings).unwrap(), 4).await;
        let req = request("${LogUploadAllow}img.png".into(), UploadMethod::Blob);
        let result = f
            .engine
            .upload(&req, action(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(AgentError::StrictMode(_))));
        assert_eq!(report(&f.store).status, StatusType::Failed);
        assert!(f.store.sas_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_upload_records_per_file() {
        let f = fixture().await;
        std::fs::write(f.dir.path().join("metrics.csv"), b"a,b").unwrap();
        let req = PeriodicUploadAction {
            action_id: "p1".into(),
            file_name: pattern(f.dir.path(), "*.csv"),
            method: UploadMethod::Blob,
            interval_secs: 60,
            enabled: true,
        };
        let cancel = CancellationToken::new();
        let engine = Arc::new(f.engine);
        let task = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run_periodic(&req, action(), &cancel).await })
        };

        // Let the first tick (immediate) run, then one more period.
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let r = report(&f.store);
        assert_eq!(r.status, StatusType::InProgress);
        let sub = &r.periodic_reported["metrics.csv"];
        assert_eq!(sub.status, StatusType::Success);
        assert!(!f.store.sas_requests().is_empty());
    }
}
