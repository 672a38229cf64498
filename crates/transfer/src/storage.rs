use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;

use crate::{TransferError, validate_archive_entry};

/// Returns `true` if `path` names a supported archive type.
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// Offset-addressed file I/O used by the transfer engines.
///
/// All operations are blocking; async callers run them under
/// `spawn_blocking`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStorage;

impl FileStorage {
    pub fn new() -> Self {
        Self
    }

    /// Writes `data` at `offset`, creating the file and its parent
    /// directories as needed. Never truncates existing content.
    pub fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Reads `range` from `path`. Bytes past end-of-file are not returned.
    pub fn read_range(&self, path: &Path, range: Range<u64>) -> Result<Vec<u8>, TransferError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let end = range.end.min(len);
        if range.start >= end {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; (end - range.start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Current file length, or 0 if the file does not exist.
    pub fn file_len(&self, path: &Path) -> Result<u64, TransferError> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `true` if any byte of `range` is zero or lies past
    /// end-of-file.
    pub fn has_zero_bytes(&self, path: &Path, range: Range<u64>) -> Result<bool, TransferError> {
        if range.start >= range.end {
            return Ok(false);
        }
        let data = self.read_range(path, range.clone())?;
        if (data.len() as u64) < range.end - range.start {
            return Ok(true);
        }
        Ok(data.contains(&0))
    }

    /// Discards `range`: truncates when it reaches end-of-file, otherwise
    /// overwrites it with zeros.
    pub fn delete_range(&self, path: &Path, range: Range<u64>) -> Result<(), TransferError> {
        if range.start >= range.end {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if range.start >= len {
            return Ok(());
        }
        if range.end >= len {
            debug!(path = %path.display(), start = range.start, "truncating tail range");
            file.set_len(range.start)?;
            return Ok(());
        }
        drop(file);
        let zeros = vec![0u8; (range.end - range.start) as usize];
        self.write_at(path, range.start, &zeros)
    }

    /// Packs a directory tree into an in-memory zip archive.
    pub fn zip_directory(&self, dir: &Path) -> Result<Vec<u8>, TransferError> {
        if !dir.is_dir() {
            return Err(TransferError::NotADirectory(dir.display().to_string()));
        }

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries: Vec<_> = std::fs::read_dir(&current)?
                .collect::<Result<Vec<_>, _>>()?;
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                let name = entry_name(dir, &path);
                if entry.file_type()?.is_dir() {
                    writer.add_directory(format!("{name}/"), options)?;
                    pending.push(path);
                } else {
                    writer.start_file(name, options)?;
                    let mut file = File::open(&path)?;
                    std::io::copy(&mut file, &mut writer)?;
                }
            }
        }

        Ok(writer.finish()?.into_inner())
    }

    /// Extracts `archive` into `dest_dir`, creating it if missing.
    ///
    /// Fails with [`TransferError::NotADirectory`] if `dest_dir` exists and
    /// is not a directory. Every entry name is validated before extraction.
    pub fn unzip(&self, archive: &Path, dest_dir: &Path) -> Result<usize, TransferError> {
        if dest_dir.exists() && !dest_dir.is_dir() {
            return Err(TransferError::NotADirectory(dest_dir.display().to_string()));
        }
        std::fs::create_dir_all(dest_dir)?;

        let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
        let mut extracted = 0;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let relative = validate_archive_entry(entry.name())?;
            let target = dest_dir.join(relative);

            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
            extracted += 1;
        }

        debug!(archive = %archive.display(), dest = %dest_dir.display(), extracted, "archive extracted");
        Ok(extracted)
    }
}

fn entry_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
