use regex::{Regex, RegexBuilder};

use crate::StrictModeError;

/// Translates a glob into an anchored regex source.
///
/// `*` matches any run of characters (including `/`), `?` matches one
/// character, and a trailing `/` matches everything below that directory.
/// Backslashes are normalized to `/` first.
pub fn glob_to_regex(glob: &str) -> String {
    let mut glob = normalize_separators(glob);
    if glob.ends_with('/') {
        glob.push('*');
    }

    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    out.push('$');
    out
}

/// Converts Windows separators to `/`.
pub(crate) fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalizes separators and folds `.` and `..` segments lexically.
///
/// `..` never climbs above a leading `/` or a drive prefix such as `c:`.
/// A trailing separator is kept.
pub(crate) fn normalize_path(path: &str) -> String {
    let path = normalize_separators(path);
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if parts.len() == 1 && is_drive(last) => {}
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                None if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let mut out = parts.join("/");
    if absolute {
        out.insert(0, '/');
    }
    if path.ends_with('/') && !out.is_empty() && !out.ends_with('/') {
        out.push('/');
    }
    out
}

fn is_drive(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// A compiled, case-insensitive glob.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(glob: &str) -> Result<Self, StrictModeError> {
        let regex = RegexBuilder::new(&glob_to_regex(glob))
            .case_insensitive(true)
            .build()
            .map_err(|e| StrictModeError::InvalidPattern {
                pattern: glob.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: glob.to_string(),
            regex,
        })
    }

    /// Matches `path` after separator normalization.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(&normalize_separators(path))
    }

    /// The glob as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}
