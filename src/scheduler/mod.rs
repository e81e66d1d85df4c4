//! Drives every work unit through the scan pipeline.
//!
//! The scheduler is the only owner of the [`ScanState`]. Workers receive
//! [`Task`] snapshots through two FIFO queues (nmap and nuclei) and report
//! back over a single event channel; every state change the scheduler makes
//! in response is persisted before the next one.
//!
//! Stage order per unit:
//!
//! ```text
//! pending -> host_discovery -> host_discovery_complete -> port_discovery
//!   -> port_discovery_complete -> service_scan -> service_scan_complete
//!   -> nuclei_scan -> complete
//! ```
//!
//! Any non-final stage may move to `failed`.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, TaskError};
use crate::executor::ScanExecutor;
use crate::input::{ScanMode, VulnOrder};
use crate::parser::ResultParser;
use crate::state::store::StateStore;
use crate::state::{QueueFamily, ScanState, Stage, TaskKind, VulnStatus, WorkUnit};
use crate::task::{ParsedResult, RawResult, Task, TaskEvent};
use crate::worker::WorkerPool;

pub mod queue;

pub use queue::{QueueClosed, QueueReceiver, WorkQueue};

/// Which stages run and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub mode: ScanMode,
    /// `None` when vulnerability scanning is disabled or unavailable.
    pub vuln_order: Option<VulnOrder>,
    /// Send units with live hosts but no open ports to the vulnerability
    /// scanner instead of completing them.
    pub vuln_without_ports: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            mode: ScanMode::Full,
            vuln_order: Some(VulnOrder::AfterServiceScan),
            vuln_without_ports: false,
        }
    }
}

impl Policy {
    /// Vulnerability order that applies in the current mode.
    pub fn vuln(&self) -> Option<VulnOrder> {
        self.vuln_order.filter(|_| self.mode == ScanMode::Full)
    }

    fn runs_concurrent_vuln(&self) -> bool {
        self.vuln() == Some(VulnOrder::AfterHostDiscovery)
    }

    /// True once `stage` is as far as the current mode goes.
    pub fn mode_reached(&self, stage: Stage) -> bool {
        match self.mode {
            ScanMode::Full => false,
            ScanMode::HostsOnly => stage.rank() >= Stage::HostDiscoveryComplete.rank(),
            ScanMode::PortsOnly => stage.rank() >= Stage::PortDiscoveryComplete.rank(),
        }
    }

    /// A unit needs no more work in this run.
    pub fn is_terminal(&self, unit: &WorkUnit) -> bool {
        unit.stage.is_final() || self.mode_reached(unit.stage)
    }
}

/// Wall-clock limit per task kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub host_discovery: Duration,
    pub port_discovery: Duration,
    pub service_scan: Duration,
    pub vuln_scan: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            host_discovery: Duration::from_secs(30 * 60),
            port_discovery: Duration::from_secs(60 * 60),
            service_scan: Duration::from_secs(60 * 60),
            vuln_scan: Duration::from_secs(60 * 60),
        }
    }
}

impl Deadlines {
    pub const fn for_task(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::HostDiscovery => self.host_discovery,
            TaskKind::PortDiscovery => self.port_discovery,
            TaskKind::ServiceScan => self.service_scan,
            TaskKind::VulnScan => self.vuln_scan,
        }
    }
}

/// Worker pool sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workers {
    pub nmap: usize,
    pub nuclei: usize,
}

impl Default for Workers {
    fn default() -> Self {
        Self { nmap: 1, nuclei: 1 }
    }
}

/// Exit status of an interrupted run, as a shell reports SIGINT.
pub const INTERRUPTED_EXIT: u8 = 130;

/// What [`Scheduler::run`] hands back.
#[derive(Debug)]
pub struct RunReport {
    pub state: ScanState,
    /// The run was cancelled before every unit finished.
    pub interrupted: bool,
}

impl RunReport {
    /// Process exit status for this run. Per-unit failures do not count.
    pub const fn exit_code(&self) -> u8 {
        if self.interrupted {
            INTERRUPTED_EXIT
        } else {
            0
        }
    }
}

/// How the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Cancelled,
}

/// Next step of a unit's nmap chain, or of its ordered vulnerability scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Wait,
    Finish,
    Run(TaskKind),
}

fn next_step(policy: &Policy, unit: &WorkUnit) -> Step {
    if policy.is_terminal(unit) {
        return Step::Wait;
    }

    let ordered_vuln = policy.vuln() == Some(VulnOrder::AfterServiceScan);
    // End of the nmap chain: wait while a concurrent vuln scan is owed,
    // otherwise finish. Units without live hosts never owe one.
    let chain_done = || {
        if concurrent_vuln_due(policy, unit) {
            Step::Wait
        } else {
            Step::Finish
        }
    };

    match unit.stage {
        Stage::Pending | Stage::HostDiscovery => Step::Run(TaskKind::HostDiscovery),
        Stage::HostDiscoveryComplete if unit.live_hosts.is_empty() => chain_done(),
        Stage::HostDiscoveryComplete | Stage::PortDiscovery => Step::Run(TaskKind::PortDiscovery),
        Stage::PortDiscoveryComplete if unit.open_ports.is_empty() => {
            if ordered_vuln && policy.vuln_without_ports {
                Step::Run(TaskKind::VulnScan)
            } else {
                chain_done()
            }
        }
        Stage::PortDiscoveryComplete | Stage::ServiceScan => Step::Run(TaskKind::ServiceScan),
        Stage::ServiceScanComplete | Stage::NucleiScan if ordered_vuln => {
            Step::Run(TaskKind::VulnScan)
        }
        Stage::ServiceScanComplete | Stage::NucleiScan => chain_done(),
        Stage::Complete | Stage::Failed => Step::Wait,
    }
}

fn concurrent_vuln_due(policy: &Policy, unit: &WorkUnit) -> bool {
    policy.runs_concurrent_vuln()
        && !unit.stage.is_final()
        && unit.stage.rank() >= Stage::HostDiscoveryComplete.rank()
        && !unit.live_hosts.is_empty()
        && !unit.vuln_status.is_some_and(VulnStatus::is_done)
}

/// Owns the scan state and the two queues.
pub struct Scheduler {
    state: ScanState,
    store: StateStore,
    policy: Policy,
    deadlines: Deadlines,
    parser: Arc<dyn ResultParser>,
    nmap: WorkQueue<Task>,
    nuclei: WorkQueue<Task>,
    outstanding: usize,
}

impl Scheduler {
    pub fn new(
        state: ScanState,
        store: StateStore,
        policy: Policy,
        deadlines: Deadlines,
        parser: Arc<dyn ResultParser>,
    ) -> Self {
        Self {
            state,
            store,
            policy,
            deadlines,
            parser,
            nmap: WorkQueue::new(QueueFamily::Nmap),
            nuclei: WorkQueue::new(QueueFamily::Nuclei),
            outstanding: 0,
        }
    }

    pub const fn state(&self) -> &ScanState {
        &self.state
    }

    pub const fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn into_state(self) -> ScanState {
        self.state
    }

    /// Tasks enqueued but not yet reported finished.
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn receiver(&self, family: QueueFamily) -> QueueReceiver<Task> {
        self.queue(family).receiver()
    }

    const fn queue(&self, family: QueueFamily) -> &WorkQueue<Task> {
        match family {
            QueueFamily::Nmap => &self.nmap,
            QueueFamily::Nuclei => &self.nuclei,
        }
    }

    /// Every unit is terminal and nothing is in flight.
    pub fn is_finished(&self) -> bool {
        self.outstanding == 0 && self.state.units().all(|u| self.policy.is_terminal(u))
    }

    /// Saves synchronously. On a multi-threaded runtime the save runs in
    /// place so the other runtime threads keep serving workers.
    fn persist(&mut self) -> Result<()> {
        let Self { store, state, .. } = self;
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                task::block_in_place(|| store.save(state))
            }
            _ => store.save(state),
        }
    }

    fn unfinished(&self) -> usize {
        self.state.units().filter(|u| !self.policy.is_terminal(u)).count()
    }

    /// Applies automatic transitions and enqueues every eligible task.
    ///
    /// Safe to call repeatedly: a unit already waiting in a queue is never
    /// enqueued there again. Returns the number of tasks enqueued.
    pub fn schedule(&mut self) -> Result<usize> {
        let mut changed = false;
        let mut enqueued = 0;

        for unit in self.state.units_mut() {
            if unit.stage.is_final() {
                continue;
            }

            if self.policy.mode_reached(unit.stage) {
                if unit.completed_at.is_none() {
                    debug!("[{}] reached the end of this scan mode at {}", unit.target, unit.stage);
                    unit.completed_at = Some(Utc::now());
                    changed = true;
                }
                continue;
            }

            match next_step(&self.policy, unit) {
                Step::Wait => {}
                Step::Finish => {
                    if unit.transition(Stage::Complete).is_ok() {
                        info!("[{}] complete", unit.target);
                        changed = true;
                    }
                }
                Step::Run(kind) => {
                    let queue = match kind.family() {
                        QueueFamily::Nmap => &self.nmap,
                        QueueFamily::Nuclei => &self.nuclei,
                    };
                    if enqueue(queue, unit, kind, &self.deadlines) {
                        enqueued += 1;
                    }
                }
            }

            if concurrent_vuln_due(&self.policy, unit)
                && enqueue(&self.nuclei, unit, TaskKind::VulnScan, &self.deadlines)
            {
                enqueued += 1;
            }
        }

        self.outstanding += enqueued;
        if changed {
            self.persist()?;
        }
        Ok(enqueued)
    }

    /// Dispatches one worker report.
    pub fn handle(&mut self, event: TaskEvent) -> Result<()> {
        match event {
            TaskEvent::Started { key, kind } => self.task_started(&key, kind),
            TaskEvent::Finished { key, kind, outcome } => self.task_finished(&key, kind, outcome),
        }
    }

    /// Records that a worker picked up `kind` for `key`.
    pub fn task_started(&mut self, key: &str, kind: TaskKind) -> Result<()> {
        let concurrent = kind == TaskKind::VulnScan && self.policy.runs_concurrent_vuln();
        let Some(unit) = self.state.get_mut(key) else {
            warn!("[{key}] report for unknown target ignored");
            return Ok(());
        };
        if unit.stage.is_final() {
            debug!("[{key}] {kind} started after the unit ended");
            return Ok(());
        }

        info!("[{key}] starting {kind}");
        if concurrent {
            unit.vuln_status = Some(VulnStatus::Running);
            unit.started_at.get_or_insert_with(Utc::now);
        } else if let Err(e) = unit.transition(kind.running_stage()) {
            warn!("{e}");
            return Ok(());
        }
        self.persist()
    }

    /// Merges a finished task into the state and schedules whatever follows.
    pub fn task_finished(
        &mut self,
        key: &str,
        kind: TaskKind,
        outcome: std::result::Result<RawResult, TaskError>,
    ) -> Result<()> {
        self.outstanding = self.outstanding.saturating_sub(1);
        let concurrent = kind == TaskKind::VulnScan && self.policy.runs_concurrent_vuln();
        let parsed = outcome.and_then(|raw| self.parser.parse(kind, &raw));

        let Some(unit) = self.state.get_mut(key) else {
            warn!("[{key}] report for unknown target ignored");
            return Ok(());
        };
        unit.set_queued(kind.family(), false);

        if unit.stage.is_final() {
            debug!("[{key}] discarding {kind} result, unit already {}", unit.stage);
            return self.schedule().map(drop);
        }

        match parsed {
            Ok(parsed) => apply(unit, kind, parsed, concurrent),
            Err(e) => {
                warn!("[{key}] {e}");
                if concurrent {
                    unit.vuln_status = Some(VulnStatus::Failed);
                }
                if let Err(e) = unit.fail(e.to_string()) {
                    warn!("{e}");
                }
            }
        }

        self.persist()?;
        self.schedule().map(drop)
    }

    /// Runs the scan until every unit is terminal or `cancel` fires.
    ///
    /// Cancellation abandons in-flight tasks: their units keep the last
    /// persisted stage and are picked up again on resume.
    pub async fn run(
        mut self,
        executor: Arc<dyn ScanExecutor>,
        workers: Workers,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let workers_cancel = cancel.child_token();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let pools = [
            (QueueFamily::Nmap, Some(workers.nmap)),
            (QueueFamily::Nuclei, self.policy.vuln().map(|_| workers.nuclei)),
        ];
        for (family, concurrency) in pools {
            let Some(concurrency) = concurrency else {
                continue;
            };
            let executor = Arc::clone(&executor);
            handles.extend(WorkerPool::new(family.to_string(), concurrency).spawn(
                self.receiver(family),
                move |task: Task| {
                    let executor = Arc::clone(&executor);
                    async move { executor.execute(&task).await }
                },
                events_tx.clone(),
                workers_cancel.clone(),
            ));
        }
        drop(events_tx);

        let outcome = self.drive(&mut events_rx, &cancel).await;

        self.nmap.close();
        self.nuclei.close();
        if !matches!(outcome, Ok(Outcome::Finished)) {
            workers_cancel.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker ended abnormally: {e}");
            }
        }

        let outcome = outcome?;
        Ok(RunReport {
            interrupted: outcome == Outcome::Cancelled,
            state: self.state,
        })
    }

    /// Event loop, until every unit is terminal or `cancel` fires.
    async fn drive(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<TaskEvent>,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let enqueued = self.schedule()?;
        info!(
            "Scheduling {} targets, {enqueued} tasks queued",
            self.state.len()
        );

        loop {
            if self.is_finished() {
                info!("All targets processed");
                return Ok(Outcome::Finished);
            }
            if self.outstanding == 0 {
                // Nothing queued yet not finished: no worker could ever change that.
                return Err(Error::Stalled {
                    unfinished: self.unfinished(),
                });
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    warn!("Cancelled with {} tasks outstanding", self.outstanding);
                    return Ok(Outcome::Cancelled);
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event)?,
                    None => return Err(Error::WorkersGone),
                },
            }
        }
    }
}

/// Pushes a task for `unit` unless one is already waiting in that queue.
fn enqueue(queue: &WorkQueue<Task>, unit: &mut WorkUnit, kind: TaskKind, deadlines: &Deadlines) -> bool {
    let family = kind.family();
    if unit.is_queued(family) {
        return false;
    }
    match queue.push(Task::for_unit(unit, kind, deadlines.for_task(kind))) {
        Ok(()) => {
            debug!("[{}] queued {kind}", unit.target);
            unit.set_queued(family, true);
            true
        }
        Err(e) => {
            warn!("[{}] {e}", unit.target);
            false
        }
    }
}

/// Merges a successful result and advances the unit.
fn apply(unit: &mut WorkUnit, kind: TaskKind, parsed: ParsedResult, concurrent: bool) {
    match kind {
        TaskKind::HostDiscovery => {
            unit.add_live_hosts(parsed.live_hosts.unwrap_or_default());
            info!("[{}] {} live hosts", unit.target, unit.live_hosts.len());
        }
        TaskKind::PortDiscovery => {
            unit.set_open_ports(parsed.open_ports.unwrap_or_default());
            unit.target_urls = parsed.target_urls.unwrap_or_default();
            info!("[{}] {} open ports", unit.target, unit.open_ports.len());
        }
        TaskKind::ServiceScan => info!("[{}] service scan finished", unit.target),
        TaskKind::VulnScan => info!("[{}] nuclei scan finished", unit.target),
    }

    if concurrent {
        unit.vuln_status = Some(VulnStatus::Complete);
        return;
    }
    if let Err(e) = unit.transition(kind.complete_stage()) {
        warn!("{e}");
    }
}
