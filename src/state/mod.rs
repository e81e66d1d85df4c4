//! Per-target progress tracking.
//!
//! A [`ScanState`] holds one [`WorkUnit`] per resolved target. Only the
//! scheduler mutates it, and every committed mutation is followed by a
//! [`store::StateStore::save`] so an interrupted run can resume.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::address::directory_token;

pub mod store;

/// Schema version written to and required from state files.
pub const STATE_VERSION: &str = "1.0";

/// Position of a work unit in the scan pipeline.
///
/// Stages only move forward. `Failed` is absorbing and reachable from any
/// non-terminal stage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    HostDiscovery,
    HostDiscoveryComplete,
    PortDiscovery,
    PortDiscoveryComplete,
    ServiceScan,
    ServiceScanComplete,
    NucleiScan,
    Complete,
    Failed,
}

impl Stage {
    /// Position along the forward chain. `Failed` ranks after everything.
    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// `Complete` and `Failed` end a unit in every mode.
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// True for stages that mean a task was running when last persisted.
    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::HostDiscovery | Self::PortDiscovery | Self::ServiceScan | Self::NucleiScan
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::HostDiscovery => "host_discovery",
            Self::HostDiscoveryComplete => "host_discovery_complete",
            Self::PortDiscovery => "port_discovery",
            Self::PortDiscoveryComplete => "port_discovery_complete",
            Self::ServiceScan => "service_scan",
            Self::ServiceScanComplete => "service_scan_complete",
            Self::NucleiScan => "nuclei_scan",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two task families, each served by its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueFamily {
    Nmap,
    Nuclei,
}

impl fmt::Display for QueueFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nmap => f.write_str("nmap"),
            Self::Nuclei => f.write_str("nuclei"),
        }
    }
}

/// A unit of work that can be handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    HostDiscovery,
    PortDiscovery,
    ServiceScan,
    VulnScan,
}

impl TaskKind {
    pub const fn family(self) -> QueueFamily {
        match self {
            Self::VulnScan => QueueFamily::Nuclei,
            _ => QueueFamily::Nmap,
        }
    }

    /// Stage recorded while this task runs.
    pub const fn running_stage(self) -> Stage {
        match self {
            Self::HostDiscovery => Stage::HostDiscovery,
            Self::PortDiscovery => Stage::PortDiscovery,
            Self::ServiceScan => Stage::ServiceScan,
            Self::VulnScan => Stage::NucleiScan,
        }
    }

    /// Stage recorded once this task succeeds.
    pub const fn complete_stage(self) -> Stage {
        match self {
            Self::HostDiscovery => Stage::HostDiscoveryComplete,
            Self::PortDiscovery => Stage::PortDiscoveryComplete,
            Self::ServiceScan => Stage::ServiceScanComplete,
            Self::VulnScan => Stage::Complete,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HostDiscovery => "host discovery",
            Self::PortDiscovery => "port discovery",
            Self::ServiceScan => "service scan",
            Self::VulnScan => "nuclei scan",
        })
    }
}

/// Progress of a vulnerability scan that runs alongside the nmap chain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VulnStatus {
    Running,
    Complete,
    Failed,
}

impl VulnStatus {
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{key}] cannot move from {from} to {to}")]
pub struct TransitionError {
    pub key: String,
    pub from: Stage,
    pub to: Stage,
}

/// Everything tracked for one target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub target: String,
    pub stage: Stage,
    pub directory: PathBuf,
    #[serde(default)]
    pub live_hosts: Vec<String>,
    #[serde(default)]
    pub open_ports: Vec<u16>,
    #[serde(default)]
    pub target_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vuln_status: Option<VulnStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(skip)]
    pub queued_nmap: bool,
    #[serde(skip)]
    pub queued_nuclei: bool,
}

impl WorkUnit {
    pub fn new(target: impl Into<String>, directory: PathBuf) -> Self {
        Self {
            target: target.into(),
            stage: Stage::Pending,
            directory,
            live_hosts: Vec::new(),
            open_ports: Vec::new(),
            target_urls: Vec::new(),
            vuln_status: None,
            started_at: None,
            completed_at: None,
            error: None,
            queued_nmap: false,
            queued_nuclei: false,
        }
    }

    /// Moves the unit to `to`, refusing regressions and any move out of
    /// `Complete` or `Failed`. Re-entering the current stage is allowed so
    /// a resumed in-progress stage can be restarted.
    pub fn transition(&mut self, to: Stage) -> Result<(), TransitionError> {
        let allowed = !self.stage.is_final() && (to == Stage::Failed || to.rank() >= self.stage.rank());
        if !allowed {
            return Err(TransitionError {
                key: self.target.clone(),
                from: self.stage,
                to,
            });
        }

        let now = Utc::now();
        if to != Stage::Pending {
            self.started_at.get_or_insert(now);
        }
        if to.is_final() {
            self.completed_at = Some(now);
        } else if to.rank() > self.stage.rank() {
            // A unit that ended a hosts-only or ports-only run is being continued.
            self.completed_at = None;
        }
        self.stage = to;
        Ok(())
    }

    /// Records `message` and moves to `Failed`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(Stage::Failed)?;
        self.error = Some(message.into());
        Ok(())
    }

    pub fn is_queued(&self, family: QueueFamily) -> bool {
        match family {
            QueueFamily::Nmap => self.queued_nmap,
            QueueFamily::Nuclei => self.queued_nuclei,
        }
    }

    pub fn set_queued(&mut self, family: QueueFamily, queued: bool) {
        match family {
            QueueFamily::Nmap => self.queued_nmap = queued,
            QueueFamily::Nuclei => self.queued_nuclei = queued,
        }
    }

    /// Appends hosts not already known, keeping discovery order.
    pub fn add_live_hosts<I: IntoIterator<Item = String>>(&mut self, hosts: I) {
        for host in hosts {
            if !self.live_hosts.contains(&host) {
                self.live_hosts.push(host);
            }
        }
    }

    /// Replaces the open port summary with a sorted, de-duplicated copy.
    pub fn set_open_ports(&mut self, mut ports: Vec<u16>) {
        ports.sort_unstable();
        ports.dedup();
        self.open_ports = ports;
    }
}

/// Bookkeeping stored alongside the targets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_updated: now,
            version: STATE_VERSION.to_owned(),
        }
    }
}

/// All work units of a scan, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanState {
    pub metadata: Metadata,
    units: Vec<WorkUnit>,
    index: HashMap<String, usize>,
}

impl ScanState {
    /// Builds a fresh state with every key at `Pending`.
    pub fn new<I, S>(keys: I, output_root: &Path) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = Self::default();
        state.merge_targets(keys, output_root);
        state
    }

    /// Inserts keys not yet tracked as `Pending` units. Existing keys keep
    /// their stage and history. Returns the number of keys added.
    pub fn merge_targets<I, S>(&mut self, keys: I, output_root: &Path) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for key in keys {
            let key = key.into();
            if self.index.contains_key(&key) {
                continue;
            }
            let directory = output_root.join(directory_token(&key));
            self.push(WorkUnit::new(key, directory));
            added += 1;
        }
        added
    }

    fn push(&mut self, unit: WorkUnit) {
        self.index.insert(unit.target.clone(), self.units.len());
        self.units.push(unit);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&WorkUnit> {
        self.index.get(key).map(|&i| &self.units[i])
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut WorkUnit> {
        self.index.get(key).map(|&i| &mut self.units[i])
    }

    pub fn units(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units.iter()
    }

    pub fn units_mut(&mut self) -> impl Iterator<Item = &mut WorkUnit> {
        self.units.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|u| u.target.as_str())
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics {
            total: self.units.len(),
            ..Statistics::default()
        };

        for unit in &self.units {
            *stats.by_stage.entry(unit.stage).or_default() += 1;
            match unit.stage {
                Stage::Failed => stats.failed += 1,
                Stage::Pending => stats.pending += 1,
                // Non-final stages with `completed_at` ended a hosts-only or
                // ports-only run.
                Stage::Complete => stats.count_completed(unit),
                _ if unit.completed_at.is_some() => stats.count_completed(unit),
                _ => stats.in_progress += 1,
            }
        }

        stats
    }

    pub fn summary(&self) -> ScanSummary {
        let mut summary = ScanSummary {
            total_targets: self.units.len(),
            duration: (self.metadata.last_updated - self.metadata.created_at).to_std().ok(),
            ..ScanSummary::default()
        };

        for unit in &self.units {
            summary.total_hosts += unit.live_hosts.len();
            if !unit.open_ports.is_empty() {
                summary.total_ports += unit.open_ports.len();
                summary.hosts_with_ports += 1;
            }
        }

        summary
    }
}

/// Counts of units per outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total: usize,
    pub by_stage: BTreeMap<Stage, usize>,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_progress: usize,
    /// Completed without any live host.
    pub no_hosts: usize,
    /// Completed with live hosts but no open port.
    pub no_ports: usize,
}

impl Statistics {
    fn count_completed(&mut self, unit: &WorkUnit) {
        self.completed += 1;
        if unit.stage.rank() < Stage::HostDiscoveryComplete.rank() {
            return;
        }
        if unit.live_hosts.is_empty() {
            self.no_hosts += 1;
        } else if unit.open_ports.is_empty() && unit.stage.rank() >= Stage::PortDiscoveryComplete.rank() {
            self.no_ports += 1;
        }
    }
}

/// Totals of discovered data across all units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub total_targets: usize,
    pub total_hosts: usize,
    pub total_ports: usize,
    pub hosts_with_ports: usize,
    pub duration: Option<std::time::Duration>,
}

impl Serialize for ScanState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Targets<'a>(&'a [WorkUnit]);

        impl Serialize for Targets<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_map(self.0.iter().map(|u| (&u.target, u)))
            }
        }

        let mut state = serializer.serialize_struct("ScanState", 2)?;
        state.serialize_field("metadata", &self.metadata)?;
        state.serialize_field("targets", &Targets(&self.units))?;
        state.end()
    }
}

/// Map entries in document order.
struct OrderedTargets(Vec<(String, WorkUnit)>);

impl<'de> Deserialize<'de> for OrderedTargets {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TargetsVisitor;

        impl<'de> Visitor<'de> for TargetsVisitor {
            type Value = OrderedTargets;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of target keys to work units")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, WorkUnit>()? {
                    entries.push(entry);
                }
                Ok(OrderedTargets(entries))
            }
        }

        deserializer.deserialize_map(TargetsVisitor)
    }
}

/// Deserialized form before key consistency is checked.
#[derive(Deserialize)]
pub(crate) struct RawState {
    metadata: Metadata,
    targets: OrderedTargets,
}

impl RawState {
    pub(crate) fn version(&self) -> &str {
        &self.metadata.version
    }

    /// Builds the state, returning the first `(key, target)` pair that
    /// disagree or a key seen twice.
    pub(crate) fn into_state(self) -> Result<ScanState, (String, String)> {
        let mut state = ScanState {
            metadata: self.metadata,
            ..ScanState::default()
        };
        for (key, unit) in self.targets.0 {
            if key != unit.target || state.index.contains_key(&key) {
                return Err((key, unit.target));
            }
            state.push(unit);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::{ScanState, Stage, TaskKind, VulnStatus, WorkUnit};
    use std::path::{Path, PathBuf};

    fn unit() -> WorkUnit {
        WorkUnit::new("10.0.0.0/24", PathBuf::from("out/10_0_0_0-24"))
    }

    #[test]
    fn stages_only_move_forward() {
        let mut unit = unit();
        unit.transition(Stage::HostDiscovery).unwrap();
        unit.transition(Stage::HostDiscoveryComplete).unwrap();

        let err = unit.transition(Stage::Pending).unwrap_err();
        assert_eq!(err.from, Stage::HostDiscoveryComplete);
        assert_eq!(unit.stage, Stage::HostDiscoveryComplete);
    }

    #[test]
    fn same_stage_reentry_is_allowed() {
        let mut unit = unit();
        unit.transition(Stage::PortDiscovery).unwrap();
        assert!(unit.transition(Stage::PortDiscovery).is_ok());
    }

    #[test]
    fn failed_is_absorbing() {
        let mut unit = unit();
        unit.fail("host discovery timed out after 1800s").unwrap();

        assert_eq!(unit.stage, Stage::Failed);
        assert!(unit.completed_at.is_some());
        assert!(unit.transition(Stage::Complete).is_err());
        assert!(unit.fail("again").is_err());
        assert_eq!(unit.error.as_deref(), Some("host discovery timed out after 1800s"));
    }

    #[test]
    fn complete_cannot_fail() {
        let mut unit = unit();
        unit.transition(Stage::Complete).unwrap();
        assert!(unit.fail("late").is_err());
        assert_eq!(unit.stage, Stage::Complete);
    }

    #[test]
    fn timestamps_follow_transitions() {
        let mut unit = unit();
        assert!(unit.started_at.is_none());

        unit.transition(Stage::HostDiscovery).unwrap();
        let started = unit.started_at;
        assert!(started.is_some());
        assert!(unit.completed_at.is_none());

        unit.transition(Stage::Complete).unwrap();
        assert_eq!(unit.started_at, started);
        assert!(unit.completed_at.is_some());
    }

    #[test]
    fn live_hosts_are_append_only_and_ordered() {
        let mut unit = unit();
        unit.add_live_hosts(["10.0.0.9".to_owned(), "10.0.0.2".to_owned()]);
        unit.add_live_hosts(["10.0.0.2".to_owned(), "10.0.0.5".to_owned()]);
        assert_eq!(unit.live_hosts, ["10.0.0.9", "10.0.0.2", "10.0.0.5"]);
    }

    #[test]
    fn open_ports_are_sorted_and_unique() {
        let mut unit = unit();
        unit.set_open_ports(vec![443, 22, 80, 22]);
        assert_eq!(unit.open_ports, [22, 80, 443]);
    }

    #[test]
    fn task_kinds_map_to_stages_and_queues() {
        assert_eq!(TaskKind::HostDiscovery.running_stage(), Stage::HostDiscovery);
        assert_eq!(TaskKind::ServiceScan.complete_stage(), Stage::ServiceScanComplete);
        assert_eq!(TaskKind::VulnScan.complete_stage(), Stage::Complete);
        assert_eq!(TaskKind::VulnScan.family().to_string(), "nuclei");
        assert_eq!(TaskKind::PortDiscovery.family().to_string(), "nmap");
    }

    #[test]
    fn merge_keeps_existing_units() {
        let root = Path::new("scan_results");
        let mut state = ScanState::new(["10.0.0.1", "10.0.1.0/24"], root);
        state.get_mut("10.0.0.1").unwrap().transition(Stage::HostDiscoveryComplete).unwrap();

        let added = state.merge_targets(["10.0.0.1", "10.0.2.0/24"], root);

        assert_eq!(added, 1);
        assert_eq!(state.len(), 3);
        assert_eq!(state.get("10.0.0.1").unwrap().stage, Stage::HostDiscoveryComplete);
        assert_eq!(state.get("10.0.2.0/24").unwrap().stage, Stage::Pending);
        assert_eq!(
            state.get("10.0.2.0/24").unwrap().directory,
            root.join("10_0_2_0-24")
        );
        assert_eq!(
            state.keys().collect::<Vec<_>>(),
            ["10.0.0.1", "10.0.1.0/24", "10.0.2.0/24"]
        );
    }

    #[test]
    fn statistics_count_outcomes() {
        let mut state = ScanState::new(["a", "b", "c", "d", "e"], Path::new("o"));
        state.get_mut("a").unwrap().transition(Stage::Complete).unwrap();
        {
            let b = state.get_mut("b").unwrap();
            b.add_live_hosts(["10.0.0.1".to_owned()]);
            b.transition(Stage::Complete).unwrap();
        }
        state.get_mut("c").unwrap().fail("boom").unwrap();
        state.get_mut("d").unwrap().transition(Stage::PortDiscovery).unwrap();

        let stats = state.statistics();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.no_hosts, 1);
        assert_eq!(stats.no_ports, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.by_stage.get(&Stage::Complete), Some(&2));
    }

    #[test]
    fn statistics_count_mode_terminal_units_as_completed() {
        let mut state = ScanState::new(["hosts", "empty", "ports", "running"], Path::new("o"));
        for key in ["hosts", "empty", "ports"] {
            let unit = state.get_mut(key).unwrap();
            unit.transition(Stage::HostDiscoveryComplete).unwrap();
            unit.completed_at = Some(chrono::Utc::now());
        }
        state.get_mut("hosts").unwrap().add_live_hosts(["10.0.0.1".to_owned()]);
        {
            let ports = state.get_mut("ports").unwrap();
            ports.add_live_hosts(["10.0.0.2".to_owned()]);
            ports.transition(Stage::PortDiscoveryComplete).unwrap();
            ports.completed_at = Some(chrono::Utc::now());
        }
        state.get_mut("running").unwrap().transition(Stage::HostDiscoveryComplete).unwrap();

        let stats = state.statistics();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.no_hosts, 1);
        // "hosts" never had its ports scanned.
        assert_eq!(stats.no_ports, 1);
    }

    #[test]
    fn continuing_a_mode_terminal_unit_clears_completion() {
        let mut unit = unit();
        unit.transition(Stage::HostDiscoveryComplete).unwrap();
        unit.completed_at = Some(chrono::Utc::now());

        unit.transition(Stage::HostDiscoveryComplete).unwrap();
        assert!(unit.completed_at.is_some());
        unit.transition(Stage::PortDiscovery).unwrap();
        assert!(unit.completed_at.is_none());
    }

    #[test]
    fn serialized_layout_keeps_insertion_order() {
        let mut state = ScanState::new(["10.0.9.0/24", "10.0.1.0/24"], Path::new("o"));
        state.get_mut("10.0.9.0/24").unwrap().vuln_status = Some(VulnStatus::Running);

        let json = serde_json::to_string(&state).unwrap();

        let first = json.find("\"10.0.9.0/24\"").unwrap();
        let second = json.find("\"10.0.1.0/24\"").unwrap();
        assert!(first < second);
        assert!(json.contains("\"stage\":\"pending\""));
        assert!(json.contains("\"vuln_status\":\"running\""));
        assert!(!json.contains("queued_nmap"));
    }

    #[test]
    fn summary_totals_hosts_and_ports() {
        let mut state = ScanState::new(["a", "b"], Path::new("o"));
        {
            let a = state.get_mut("a").unwrap();
            a.add_live_hosts(["1.1.1.1".to_owned(), "1.1.1.2".to_owned()]);
            a.set_open_ports(vec![22, 80]);
        }
        state.get_mut("b").unwrap().add_live_hosts(["2.2.2.2".to_owned()]);

        let summary = state.summary();
        assert_eq!(summary.total_targets, 2);
        assert_eq!(summary.total_hosts, 3);
        assert_eq!(summary.total_ports, 2);
        assert_eq!(summary.hosts_with_ports, 1);
    }
}
