//! Strict-mode file access policy.
//!
//! Every path a transfer touches goes through [`StrictModePolicy`]:
//! `${KEY}` root placeholders are resolved against the configured
//! restriction zones, then size ceilings and allow/deny glob patterns are
//! enforced for the zone the path falls in.

mod pattern;
mod policy;
mod settings;

pub use pattern::{GlobPattern, glob_to_regex};
pub use policy::StrictModePolicy;
pub use settings::{Direction, RestrictionZone, StrictModeSettings};

/// Errors raised by strict-mode checks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrictModeError {
    #[error("strict mode key not found: {key} ({direction})")]
    KeyNotFound { key: String, direction: Direction },

    #[error("strict mode root not found for key {key}")]
    RootNotFound { key: String },

    #[error("path {path} does not match any allowed pattern")]
    PatternMismatch { path: String },

    #[error("path {path} matches deny pattern {pattern}")]
    Denied { path: String, pattern: String },

    #[error("path {path} resolves outside the root of {key}")]
    OutsideRoot { path: String, key: String },

    #[error("size {size} exceeds limit {max} for {path}")]
    SizeExceeded { path: String, size: u64, max: u64 },

    #[error("invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}
