use tracing::{debug, warn};

use crate::pattern::{normalize_path, normalize_separators};
use crate::{Direction, GlobPattern, RestrictionZone, StrictModeError, StrictModeSettings};

struct CompiledZone {
    zone: RestrictionZone,
    /// Lowercased, normalized root without a trailing separator.
    root_key: String,
    allow: Vec<GlobPattern>,
    deny: Vec<GlobPattern>,
}

/// Compiled strict-mode rules.
///
/// Checks are pure: they either pass or return a [`StrictModeError`].
pub struct StrictModePolicy {
    enabled: bool,
    global_allow: Vec<GlobPattern>,
    zones: Vec<CompiledZone>,
}

impl StrictModePolicy {
    /// Compiles all zone and global patterns up front.
    pub fn new(settings: &StrictModeSettings) -> Result<Self, StrictModeError> {
        let global_allow = compile_all(&settings.allow_patterns)?;
        let zones = settings
            .restrictions
            .iter()
            .map(|zone| {
                Ok(CompiledZone {
                    root_key: root_key(&zone.root),
                    allow: compile_all(&zone.allow_patterns)?,
                    deny: compile_all(&zone.deny_patterns)?,
                    zone: zone.clone(),
                })
            })
            .collect::<Result<Vec<_>, StrictModeError>>()?;

        Ok(Self {
            enabled: settings.enabled,
            global_allow,
            zones,
        })
    }

    /// A policy that allows everything and resolves no placeholders.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            global_allow: Vec::new(),
            zones: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Replaces a leading `${KEY}` placeholder with the root of the zone
    /// whose id is `KEY` for `direction`. Paths without a placeholder are
    /// returned unchanged.
    ///
    /// The resolved path is normalized and must stay below the zone root.
    pub fn resolve_root(&self, direction: Direction, raw: &str) -> Result<String, StrictModeError> {
        let Some((key, rest)) = split_placeholder(raw) else {
            return Ok(raw.to_string());
        };

        let zone = self
            .zones
            .iter()
            .find(|z| z.zone.direction == direction && z.zone.id == key)
            .ok_or_else(|| StrictModeError::KeyNotFound {
                key: key.to_string(),
                direction,
            })?;

        let root = zone.zone.root.trim();
        if root.is_empty() {
            return Err(StrictModeError::RootNotFound {
                key: key.to_string(),
            });
        }

        let root = normalize_separators(root);
        let rest = normalize_separators(rest);
        let resolved = match (root.ends_with('/'), rest.starts_with('/')) {
            (true, true) => format!("{root}{}", &rest[1..]),
            (false, false) if !rest.is_empty() => format!("{root}/{rest}"),
            _ => format!("{root}{rest}"),
        };
        let resolved = normalize_path(&resolved);
        if !is_within(&zone.root_key, &resolved.to_lowercase()) {
            warn!(raw, %resolved, zone = %zone.zone.id, "path escapes zone root");
            return Err(StrictModeError::OutsideRoot {
                path: raw.to_string(),
                key: key.to_string(),
            });
        }
        debug!(raw, %resolved, "resolved strict mode root");
        Ok(resolved)
    }

    /// Rejects `size` if it exceeds the ceiling of the zone containing
    /// `path`. Zones without a ceiling (or a zero ceiling) accept any size.
    pub fn check_size(
        &self,
        direction: Direction,
        size: u64,
        path: &str,
    ) -> Result<(), StrictModeError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(zone) = self.find_zone(direction, path) else {
            return Ok(());
        };
        match zone.zone.max_size {
            Some(max) if max > 0 && size > max => {
                warn!(path, size, max, zone = %zone.zone.id, "size ceiling exceeded");
                Err(StrictModeError::SizeExceeded {
                    path: path.to_string(),
                    size,
                    max,
                })
            }
            _ => Ok(()),
        }
    }

    /// Enforces the allow and deny patterns of the zone containing `path`.
    ///
    /// Paths outside every declared zone are allowed.
    pub fn check_access(&self, direction: Direction, path: &str) -> Result<(), StrictModeError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(zone) = self.find_zone(direction, path) else {
            debug!(path, %direction, "path outside restriction zones");
            return Ok(());
        };

        let full = normalize_path(path);
        let relative = full
            .get(zone.root_key.len()..)
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let matches = |p: &GlobPattern| p.is_match(&full) || p.is_match(&relative);

        if !zone.allow.iter().chain(&self.global_allow).any(matches) {
            warn!(path, zone = %zone.zone.id, "path does not match allow patterns");
            return Err(StrictModeError::PatternMismatch {
                path: path.to_string(),
            });
        }

        if let Some(denied) = zone.deny.iter().find(|p| matches(*p)) {
            warn!(path, zone = %zone.zone.id, pattern = denied.as_str(), "path denied");
            return Err(StrictModeError::Denied {
                path: path.to_string(),
                pattern: denied.as_str().to_string(),
            });
        }

        Ok(())
    }

    /// Resolves `raw`, then runs the access check and, when `size` is
    /// known, the size check. Returns the resolved path.
    pub fn validate(
        &self,
        direction: Direction,
        raw: &str,
        size: Option<u64>,
    ) -> Result<String, StrictModeError> {
        let resolved = self.resolve_root(direction, raw)?;
        self.check_access(direction, &resolved)?;
        if let Some(size) = size {
            self.check_size(direction, size, &resolved)?;
        }
        Ok(resolved)
    }

    /// Finds the zone with the longest root that is a path prefix of
    /// `path` after normalization, compared case-insensitively.
    fn find_zone(&self, direction: Direction, path: &str) -> Option<&CompiledZone> {
        let path = normalize_path(path).to_lowercase();
        self.zones
            .iter()
            .filter(|z| z.zone.direction == direction && !z.root_key.is_empty())
            .filter(|z| is_within(&z.root_key, &path))
            .max_by_key(|z| z.root_key.len())
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<GlobPattern>, StrictModeError> {
    patterns.iter().map(|p| GlobPattern::new(p)).collect()
}

fn root_key(root: &str) -> String {
    normalize_path(root.trim())
        .trim_end_matches('/')
        .to_lowercase()
}

/// `true` if lowercased `path` is `root_key` or lies below it. An empty
/// key is the filesystem root and contains every absolute path.
fn is_within(root_key: &str, path: &str) -> bool {
    if root_key.is_empty() {
        return path.starts_with('/');
    }
    path.strip_prefix(root_key)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Splits `${KEY}rest` into `(KEY, rest)`.
fn split_placeholder(raw: &str) -> Option<(&str, &str)> {
    let body = raw.strip_prefix("${")?;
    let end = body.find('}')?;
    Some((&body[..end], &body[end + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str, direction: Direction, root: &str, allow: &[&str]) -> RestrictionZone {
        RestrictionZone {
            id: id.into(),
            direction,
            root: root.into(),
            max_size: None,
            allow_patterns: allow.iter().map(|s| s.to_string()).collect(),
            deny_patterns: Vec::new(),
        }
    }

    fn policy(zones: Vec<RestrictionZone>) -> StrictModePolicy {
        StrictModePolicy::new(&StrictModeSettings {
            enabled: true,
            allow_patterns: Vec::new(),
            restrictions: zones,
        })
        .unwrap()
    }

    #[test]
    fn root_substitution() {
        let p = policy(vec![zone(
            "LogUploadAllow",
            Direction::Upload,
            "c:/demoUpload/",
            &["*.txt"],
        )]);
        assert_eq!(
            p.resolve_root(Direction::Upload, "${LogUploadAllow}test.txt")
                .unwrap(),
            "c:/demoUpload/test.txt"
        );
    }

    #[test]
    fn root_substitution_inserts_separator() {
        let p = policy(vec![zone("K", Direction::Download, r"d:\pkg", &[])]);
        assert_eq!(
            p.resolve_root(Direction::Download, "${K}fw.bin").unwrap(),
            "d:/pkg/fw.bin"
        );
        assert_eq!(
            p.resolve_root(Direction::Download, "${K}/fw.bin").unwrap(),
            "d:/pkg/fw.bin"
        );
    }

    #[test]
    fn empty_root_is_root_not_found() {
        let p = policy(vec![zone("LogUploadAllow", Direction::Upload, "", &[])]);
        assert!(matches!(
            p.resolve_root(Direction::Upload, "${LogUploadAllow}test.txt"),
            Err(StrictModeError::RootNotFound { ref key }) if key == "LogUploadAllow"
        ));
    }

    #[test]
    fn unknown_key_is_key_not_found() {
        let p = policy(vec![zone("LogUploadAllow", Direction::Upload, "c:/x/", &[])]);
        assert!(matches!(
            p.resolve_root(Direction::Upload, "${Missing}test.txt"),
            Err(StrictModeError::KeyNotFound { .. })
        ));
        // Key exists, but only for the other direction.
        assert!(matches!(
            p.resolve_root(Direction::Download, "${LogUploadAllow}test.txt"),
            Err(StrictModeError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn plain_path_unchanged() {
        let p = StrictModePolicy::disabled();
        assert_eq!(
            p.resolve_root(Direction::Upload, "/var/log/a.txt").unwrap(),
            "/var/log/a.txt"
        );
    }

    #[test]
    fn pattern_enforcement() {
        let p = policy(vec![zone(
            "LogUploadAllow",
            Direction::Upload,
            "c:/demoUpload",
            &["*.txt"],
        )]);
        assert!(p.check_access(Direction::Upload, "c:/demoUpload/test.txt").is_ok());
        assert!(matches!(
            p.check_access(Direction::Upload, "c:/demoUpload/img.png"),
            Err(StrictModeError::PatternMismatch { .. })
        ));
    }

    #[test]
    fn root_match_is_case_insensitive() {
        let p = policy(vec![zone("Z", Direction::Upload, "C:/DemoUpload", &["*.txt"])]);
        assert!(p.check_access(Direction::Upload, r"c:\demoupload\img.png").is_err());
    }

    #[test]
    fn outside_zones_is_allowed() {
        let p = policy(vec![zone("Z", Direction::Upload, "c:/demoUpload", &["*.txt"])]);
        assert!(p.check_access(Direction::Upload, "c:/other/img.png").is_ok());
        // Sibling directory sharing the root's name prefix.
        assert!(p.check_access(Direction::Upload, "c:/demoUploadX/img.png").is_ok());
        // Zones only apply to their own direction.
        assert!(p.check_access(Direction::Download, "c:/demoUpload/img.png").is_ok());
    }

    #[test]
    fn global_allow_patterns_apply() {
        let p = StrictModePolicy::new(&StrictModeSettings {
            enabled: true,
            allow_patterns: vec!["*.log".into()],
            restrictions: vec![zone("Z", Direction::Upload, "/data", &["*.txt"])],
        })
        .unwrap();
        assert!(p.check_access(Direction::Upload, "/data/app.log").is_ok());
        assert!(p.check_access(Direction::Upload, "/data/a.txt").is_ok());
        assert!(p.check_access(Direction::Upload, "/data/a.bin").is_err());
    }

    #[test]
    fn relative_patterns_match_below_root() {
        let p = policy(vec![zone("Z", Direction::Upload, "/data", &["logs/"])]);
        assert!(p.check_access(Direction::Upload, "/data/logs/a/b.txt").is_ok());
        assert!(p.check_access(Direction::Upload, "/data/cfg/b.txt").is_err());
    }

    #[test]
    fn deny_patterns_win() {
        let mut z = zone("Z", Direction::Upload, "/data", &["*"]);
        z.deny_patterns = vec!["*.key".into()];
        let p = policy(vec![z]);
        assert!(p.check_access(Direction::Upload, "/data/a.txt").is_ok());
        assert!(matches!(
            p.check_access(Direction::Upload, "/data/secret.key"),
            Err(StrictModeError::Denied { .. })
        ));
    }

    #[test]
    fn placeholder_cannot_climb_out_of_root() {
        let p = policy(vec![zone("Pkg", Direction::Download, "/pkg/", &["*"])]);
        assert!(matches!(
            p.resolve_root(Direction::Download, "${Pkg}../etc/passwd"),
            Err(StrictModeError::OutsideRoot { ref key, .. }) if key == "Pkg"
        ));
        assert!(matches!(
            p.resolve_root(Direction::Download, r"${Pkg}fw\..\..\etc"),
            Err(StrictModeError::OutsideRoot { .. })
        ));
        assert_eq!(
            p.resolve_root(Direction::Download, "${Pkg}a/../fw.bin").unwrap(),
            "/pkg/fw.bin"
        );
    }

    #[test]
    fn dot_segments_cannot_dodge_deny_patterns() {
        let mut z = zone("Z", Direction::Upload, "/data", &["*"]);
        z.deny_patterns = vec!["secret/".into()];
        let p = policy(vec![z]);
        assert!(matches!(
            p.check_access(Direction::Upload, "/data/x/../secret/k"),
            Err(StrictModeError::Denied { .. })
        ));
        assert!(matches!(
            p.check_access(Direction::Upload, "/data/./secret/k"),
            Err(StrictModeError::Denied { .. })
        ));
    }

    #[test]
    fn dot_segments_resolve_zone_membership() {
        let mut z = zone("Z", Direction::Download, "/pkg", &["*"]);
        z.max_size = Some(10);
        let p = policy(vec![z]);
        // Lexically inside the zone despite the detour.
        assert!(p.check_size(Direction::Download, 11, "/other/../pkg/a.bin").is_err());
        // Lexically outside the zone despite the prefix.
        assert!(p.check_size(Direction::Download, 11, "/pkg/../other/a.bin").is_ok());
    }

    #[test]
    fn size_ceiling() {
        let mut z = zone("Z", Direction::Download, "/pkg", &["*"]);
        z.max_size = Some(1000);
        let p = policy(vec![z]);
        assert!(p.check_size(Direction::Download, 1000, "/pkg/a.bin").is_ok());
        assert!(matches!(
            p.check_size(Direction::Download, 1001, "/pkg/a.bin"),
            Err(StrictModeError::SizeExceeded { max: 1000, .. })
        ));
        assert!(p.check_size(Direction::Download, 5000, "/elsewhere/a.bin").is_ok());
    }

    #[test]
    fn zero_ceiling_is_unlimited() {
        let mut z = zone("Z", Direction::Download, "/pkg", &["*"]);
        z.max_size = Some(0);
        let p = policy(vec![z]);
        assert!(p.check_size(Direction::Download, u64::MAX, "/pkg/a.bin").is_ok());
    }

    #[test]
    fn disabled_policy_allows_everything() {
        let p = StrictModePolicy::new(&StrictModeSettings {
            enabled: false,
            allow_patterns: Vec::new(),
            restrictions: vec![zone("Z", Direction::Upload, "/data", &[])],
        })
        .unwrap();
        assert!(p.check_access(Direction::Upload, "/data/anything").is_ok());
        // Placeholders still resolve.
        assert_eq!(
            p.resolve_root(Direction::Upload, "${Z}x").unwrap(),
            "/data/x"
        );
    }

    #[test]
    fn validate_chains_checks() {
        let mut z = zone("Pkg", Direction::Download, "/pkg/", &["*.bin"]);
        z.max_size = Some(10);
        let p = policy(vec![z]);
        assert_eq!(
            p.validate(Direction::Download, "${Pkg}fw.bin", Some(10)).unwrap(),
            "/pkg/fw.bin"
        );
        assert!(p.validate(Direction::Download, "${Pkg}fw.exe", None).is_err());
        assert!(p.validate(Direction::Download, "${Pkg}fw.bin", Some(11)).is_err());
    }
}
