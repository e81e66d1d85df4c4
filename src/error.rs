//! Error kinds raised by target resolution, state persistence and scan tasks.
//!
//! Only [`Error`] is fatal to a run. Everything else is attached to the
//! target line or work unit it concerns and the run carries on.
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::TaskKind;

/// Result alias for run-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A raw target line that could not be turned into a work unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("'{0}' is not an IPv4 address or CIDR")]
    Malformed(String),

    #[error("'{0}' has an octet with a leading zero")]
    LeadingZero(String),

    #[error("'{0}' has an octet above 255")]
    OctetOutOfRange(String),

    #[error("'{0}' has a prefix length outside 1-32")]
    PrefixOutOfRange(String),
}

/// The persisted state file cannot be used to resume.
#[derive(Error, Debug)]
pub enum CorruptStateError {
    #[error("state file {0} does not exist")]
    Missing(PathBuf),

    #[error("state file {0} is empty")]
    Empty(PathBuf),

    #[error("state file {path} is not valid: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state file {path} has schema version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: String,
        expected: &'static str,
    },

    #[error("state file {path} maps key '{key}' to target '{target}'")]
    Inconsistent {
        path: PathBuf,
        key: String,
        target: String,
    },

    #[error("could not read state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a single scan task did not produce a usable result.
///
/// The display text is what ends up in `WorkUnit::error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{kind} timed out after {}s", .after.as_secs())]
    Timeout { kind: TaskKind, after: Duration },

    #[error("{kind} failed: {message}")]
    Execution { kind: TaskKind, message: String },

    #[error("{kind} output unreadable: {message}")]
    Parse { kind: TaskKind, message: String },
}

impl TaskError {
    pub fn execution(kind: TaskKind, message: impl Into<String>) -> Self {
        Self::Execution {
            kind,
            message: message.into(),
        }
    }

    pub fn parse(kind: TaskKind, message: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            message: message.into(),
        }
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Rejected configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("--hosts-only and --ports-only cannot be combined")]
    ConflictingModes,

    #[error("{name} {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("{0}")]
    InvalidPath(String),
}

/// Conditions that abort the whole run.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no valid targets to scan")]
    NoValidTargets,

    #[error(transparent)]
    CorruptState(#[from] CorruptStateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("every worker stopped while tasks were outstanding")]
    WorkersGone,

    #[error("{unfinished} targets are unfinished but no task can be scheduled for them")]
    Stalled { unfinished: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}
