use std::fmt;

use serde::{Deserialize, Serialize};

/// Transfer direction a restriction zone applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// A directory subtree with its own access rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictionZone {
    /// Placeholder key, referenced in paths as `${id}`.
    pub id: String,
    pub direction: Direction,
    #[serde(default)]
    pub root: String,
    /// Size ceiling in bytes. `None` or 0 means unlimited.
    #[serde(default)]
    pub max_size: Option<u64>,
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

/// Strict-mode configuration, consumed read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrictModeSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Patterns allowed in every zone in addition to the zone's own.
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default)]
    pub restrictions: Vec<RestrictionZone>,
}
