use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates an archive entry name before it is joined onto the extraction
/// directory, and returns it as a relative path.
///
/// Rejects:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
///
/// Backslashes are treated as separators so entries written on Windows
/// cannot smuggle `..\` past the check.
pub fn validate_archive_entry(name: &str) -> Result<PathBuf, TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty entry name".into()));
    }

    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_letter(&normalized) {
        return Err(TransferError::InvalidPath(format!(
            "absolute entry not allowed: {name}"
        )));
    }

    let path = Path::new(&normalized);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute entry not allowed: {name}"
        )));
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {name}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
        }
    }

    if out.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath(format!("empty entry name: {name}")));
    }
    Ok(out)
}

fn has_drive_letter(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
