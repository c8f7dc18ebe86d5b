//! Error types for configuration validation and profile persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid machine or cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Requested disk is below the supported floor.
    #[error("Disk Size {size_mb}MB ({requested}) is too small, the minimum disk size is {minimum_mb}MB")]
    DiskTooSmall {
        size_mb: u64,
        requested: String,
        minimum_mb: u64,
    },

    /// Disk size string could not be parsed.
    #[error("invalid disk size {0:?}: expected <number>[<unit>], where unit = b, k, m, g or t")]
    InvalidDiskSize(String),

    /// GPU passthrough requested with a driver that cannot provide it.
    #[error("--gpu is only supported with --vm-driver=kvm2 (got {driver:?})")]
    GpuUnsupportedDriver { driver: String },

    /// Extra option was not of the form `component.key=value`.
    #[error("invalid extra option {input:?}: {reason}")]
    InvalidExtraOption { input: String, reason: String },
}

/// Failure to read or write a profile document.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to access profile {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse profile {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize profile: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to replace profile {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

impl ProfileError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
