//! Messages passed between the scheduler, the queues and the workers.
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TaskError;
use crate::state::{QueueFamily, TaskKind, WorkUnit};

/// A snapshot of everything a worker needs to run one stage for one unit.
///
/// Workers only ever see this copy, never the live [`WorkUnit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub key: String,
    pub kind: TaskKind,
    pub directory: PathBuf,
    pub live_hosts: Vec<String>,
    pub open_ports: Vec<u16>,
    pub target_urls: Vec<String>,
    pub deadline: Duration,
}

impl Task {
    pub fn for_unit(unit: &WorkUnit, kind: TaskKind, deadline: Duration) -> Self {
        Self {
            key: unit.target.clone(),
            kind,
            directory: unit.directory.clone(),
            live_hosts: unit.live_hosts.clone(),
            open_ports: unit.open_ports.clone(),
            target_urls: unit.target_urls.clone(),
            deadline,
        }
    }

    pub const fn family(&self) -> QueueFamily {
        self.kind.family()
    }
}

/// Where a finished task left its raw output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult {
    pub output: PathBuf,
}

impl RawResult {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Data extracted from a raw result. Fields a stage does not produce stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResult {
    pub live_hosts: Option<Vec<String>>,
    pub open_ports: Option<Vec<u16>>,
    pub target_urls: Option<Vec<String>>,
}

/// What workers report back to the scheduler.
#[derive(Debug)]
pub enum TaskEvent {
    Started {
        key: String,
        kind: TaskKind,
    },
    Finished {
        key: String,
        kind: TaskKind,
        outcome: Result<RawResult, TaskError>,
    },
}
