//! This crate exposes the internal functionality of the `reconflow`
//! reconnaissance orchestrator.
//!
//! reconflow takes a list of IPv4 addresses and networks, cuts it into
//! manageable work units and drives each one through nmap host discovery,
//! port discovery and service detection, followed by a nuclei vulnerability
//! scan. Progress is written to a JSON state file after every step, so a scan
//! that is interrupted (or crashes) picks up where it left off.
//!
//! ## Architecture Overview
//!
//! 1. **Target resolution**: [`address::TargetResolver`] validates target
//!    lines and splits wide networks into /24 keys
//! 2. **State**: [`state::ScanState`] tracks one [`state::WorkUnit`] per key and
//!    [`state::store::StateStore`] persists it atomically
//! 3. **Scheduling**: [`scheduler::Scheduler`] applies stage transitions and
//!    feeds the nmap and nuclei queues
//! 4. **Workers**: [`worker::WorkerPool`] runs tasks under per-task deadlines
//!    through a [`executor::ScanExecutor`]
//! 5. **Parsing**: [`parser::ResultParser`] turns tool output into hosts,
//!    ports and `ip:port` targets
//!
//! ## Basic Usage Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use reconflow::address::TargetResolver;
//! use reconflow::executor::{CommandExecutor, NmapSettings, ScanExecutor};
//! use reconflow::parser::NmapResultParser;
//! use reconflow::scheduler::{Deadlines, Policy, Scheduler, Workers};
//! use reconflow::state::{store::StateStore, ScanState};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let resolution = TargetResolver::new(true).resolve(["192.168.0.0/23", "10.0.0.7"]);
//!     let output = Path::new("scan_results");
//!     let state = ScanState::new(resolution.keys, output);
//!     let store = StateStore::new(output.join("lab_state.json"));
//!
//!     let executor = Arc::new(CommandExecutor::new(NmapSettings::default(), true));
//!     let policy = Policy {
//!         vuln_order: Policy::default().vuln_order.filter(|_| executor.vuln_scan_available()),
//!         ..Policy::default()
//!     };
//!     let scheduler = Scheduler::new(state, store, policy, Deadlines::default(), Arc::new(NmapResultParser));
//!
//!     let report = scheduler
//!         .run(executor, Workers::default(), CancellationToken::new())
//!         .await?;
//!     println!("{} targets processed", report.state.len());
//!     Ok(())
//! }
//! ```
#![allow(clippy::needless_doctest_main)]

pub mod tui;

pub mod input;

pub mod address;

pub mod error;

pub mod state;

pub mod task;

pub mod scheduler;

pub mod worker;

pub mod executor;

pub mod parser;
