//! Kubernetes version downgrade guard.
//!
//! A profile never moves to an older Kubernetes version implicitly. When the
//! requested version is older than the one persisted in the profile, the
//! persisted version wins and the user is told how to get a fresh cluster.
//! Parse failures never abort a start: they are logged and the requested
//! version is used as given.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use lokube_profile::ProfileDocument;
use thiserror::Error;
use tracing::{error, info};

/// Prefix carried by Kubernetes version strings.
pub const VERSION_PREFIX: &str = "v";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,

    #[error("version {0:?} must have exactly three numeric components")]
    Components(String),

    #[error("invalid numeric component {component:?} in version {input:?}")]
    Number { input: String, component: String },
}

/// `MAJOR.MINOR.PATCH[-pre][+build]`, ordered by semantic version rules.
///
/// Build metadata is kept for display and ignored in comparisons.
#[derive(Debug, Clone, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Vec<String>,
    pub build: Option<String>,
}

impl Version {
    /// Parse a version, tolerating a leading `v`.
    pub fn parse_prefixed(s: &str) -> Result<Self, VersionError> {
        s.trim()
            .strip_prefix(VERSION_PREFIX)
            .unwrap_or(s.trim())
            .parse()
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(VersionError::Empty);
        }

        let (rest, build) = match s.split_once('+') {
            Some((rest, build)) => (rest, Some(build.to_string())),
            None => (s, None),
        };
        let (core, pre) = match rest.split_once('-') {
            Some((core, pre)) => (core, pre.split('.').map(str::to_string).collect()),
            None => (rest, Vec::new()),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() != 3 {
            return Err(VersionError::Components(s.to_string()));
        }

        let number = |component: &str| {
            component.parse::<u64>().map_err(|_| VersionError::Number {
                input: s.to_string(),
                component: component.to_string(),
            })
        };

        Ok(Self {
            major: number(parts[0])?,
            minor: number(parts[1])?,
            patch: number(parts[2])?,
            pre,
            build,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre.join("."))?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| compare_pre(&self.pre, &other.pre))
    }
}

/// A release sorts after any of its pre-releases.
fn compare_pre(a: &[String], b: &[String]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    for (x, y) in a.iter().zip(b) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Result of applying the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSelection {
    /// Version the cluster will run.
    pub version: String,
    /// Set when the requested version was older than the persisted one.
    pub downgrade_blocked: Option<BlockedDowngrade>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedDowngrade {
    pub requested: String,
    pub kept: String,
}

impl VersionSelection {
    fn requested(version: &str) -> Self {
        Self {
            version: version.to_string(),
            downgrade_blocked: None,
        }
    }
}

/// Choose the Kubernetes version for this run.
///
/// Without a previous profile, or one that never recorded a cluster, the
/// requested version is used unchanged.
pub fn select_version(previous: Option<&ProfileDocument>, requested: &str) -> VersionSelection {
    let Some(previous_config) = previous.and_then(|doc| doc.kubernetes_config.as_ref()) else {
        return VersionSelection::requested(requested);
    };
    let previous_raw = previous_config.kubernetes_version.as_str();

    let previous_version = match Version::parse_prefixed(previous_raw) {
        Ok(v) => v,
        Err(e) => {
            error!(version = %previous_raw, error = %e, "Error parsing version semver");
            return VersionSelection::requested(requested);
        }
    };
    let requested_version = match Version::parse_prefixed(requested) {
        Ok(v) => v,
        Err(e) => {
            error!(version = %requested, error = %e, "Error parsing version semver");
            return VersionSelection::requested(requested);
        }
    };

    if requested_version < previous_version {
        info!(
            requested = %requested,
            kept = %previous_raw,
            "Refusing to downgrade Kubernetes version"
        );
        return VersionSelection {
            version: previous_raw.to_string(),
            downgrade_blocked: Some(BlockedDowngrade {
                requested: requested.to_string(),
                kept: previous_raw.to_string(),
            }),
        };
    }

    VersionSelection::requested(requested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lokube_profile::{KubernetesConfig, MachineConfig};
    use rstest::rstest;

    fn profile_at(version: &str) -> ProfileDocument {
        ProfileDocument::complete(
            MachineConfig::default(),
            KubernetesConfig {
                kubernetes_version: version.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_downgrade_is_blocked() {
        let previous = profile_at("v1.10.0");
        let selection = select_version(Some(&previous), "v1.8.0");

        assert_eq!(selection.version, "v1.10.0");
        assert_eq!(
            selection.downgrade_blocked,
            Some(BlockedDowngrade {
                requested: "v1.8.0".to_string(),
                kept: "v1.10.0".to_string(),
            })
        );
    }

    #[test]
    fn test_upgrade_is_allowed() {
        let previous = profile_at("v1.10.0");
        let selection = select_version(Some(&previous), "v1.12.0");

        assert_eq!(selection.version, "v1.12.0");
        assert!(selection.downgrade_blocked.is_none());
    }

    #[test]
    fn test_no_previous_profile() {
        assert_eq!(select_version(None, "v1.8.0").version, "v1.8.0");

        let machine_only = ProfileDocument::machine_only(MachineConfig::default());
        assert_eq!(select_version(Some(&machine_only), "v1.8.0").version, "v1.8.0");
    }

    #[rstest]
    #[case("garbage", "v1.8.0")]
    #[case("v1.10.0", "latest")]
    #[case("v1.10", "v1.8.0")]
    fn test_parse_failure_keeps_requested(#[case] previous: &str, #[case] requested: &str) {
        let previous = profile_at(previous);
        let selection = select_version(Some(&previous), requested);

        assert_eq!(selection.version, requested);
        assert!(selection.downgrade_blocked.is_none());
    }

    #[rstest]
    #[case("1.10.0", "1.9.9")]
    #[case("1.10.0", "1.10.0-beta.1")]
    #[case("1.10.0-beta.2", "1.10.0-beta.1")]
    #[case("1.10.0-rc.1", "1.10.0-beta.9")]
    #[case("1.10.0-alpha.1.1", "1.10.0-alpha.1")]
    fn test_ordering(#[case] newer: &str, #[case] older: &str) {
        let newer: Version = newer.parse().unwrap();
        let older: Version = older.parse().unwrap();
        assert!(newer > older);
    }

    #[test]
    fn test_build_metadata_ignored_in_comparison() {
        let a = Version::parse_prefixed("v1.10.0+abc").unwrap();
        let b = Version::parse_prefixed("v1.10.0").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "1.10.0+abc");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Version>(), Err(VersionError::Empty));
        assert!(matches!(
            "1.x.0".parse::<Version>(),
            Err(VersionError::Number { .. })
        ));
    }
}
