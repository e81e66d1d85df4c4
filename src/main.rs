use reconflow::address::{resolve_file, TargetResolver};
use reconflow::error::{CorruptStateError, Error};
use reconflow::executor::{running_as_root, CommandExecutor, ScanExecutor};
use reconflow::input::{Config, Opts, ScanConfig};
use reconflow::parser::NmapResultParser;
use reconflow::scheduler::Scheduler;
use reconflow::state::store::StateStore;
use reconflow::state::ScanState;
use reconflow::tui::{print_opening, print_statistics, print_summary};
use reconflow::{detail, output, warning};

use anyhow::Context;
use log::{debug, error, info};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[cfg(not(tarpaulin_include))]
#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut opts: Opts = Opts::read();
    let config = match Config::read(opts.config_path.clone()) {
        Ok(config) => config,
        Err(e) => {
            error!("Found {e} in configuration file. Aborting scan.");
            return ExitCode::FAILURE;
        }
    };
    opts.merge(&config);
    debug!("Main() `opts` arguments are {opts:?}");

    if opts.accessible {
        colored::control::set_override(false);
    }

    let config = match ScanConfig::from_opts(&opts) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the scan and returns the process exit status.
#[cfg(not(tarpaulin_include))]
async fn run(config: &ScanConfig) -> anyhow::Result<u8> {
    print_opening(config.accessible);
    if !running_as_root() {
        warning!(
            "Not running as root: nmap SYN scans and ICMP host discovery need raw sockets and may fail.",
            config.accessible
        );
    }

    let resolution = resolve_file(&config.targets_file, TargetResolver::new(config.split_subnets))
        .await
        .with_context(|| format!("cannot read targets from {}", config.targets_file.display()))?;
    if !resolution.rejected.is_empty() {
        warning!(
            format!("{} target lines were skipped", resolution.rejected.len()),
            config.accessible
        );
    }
    if resolution.keys.is_empty() {
        return Err(Error::NoValidTargets.into());
    }
    detail!(
        format!(
            "{} work units from {} target lines",
            resolution.keys.len(),
            resolution.lines
        ),
        config.accessible
    );

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("cannot create {}", config.output_dir.display()))?;

    let store = StateStore::new(&config.state_file);
    let mut state = if config.resume {
        match store.load() {
            Ok(mut state) => {
                output!(
                    format!("Resuming from {}", store.path().display()),
                    config.accessible
                );
                print_statistics(&state.statistics(), config.accessible);
                let added = state.merge_targets(resolution.keys, &config.output_dir);
                if added > 0 {
                    info!("{added} new targets added to the resumed scan");
                }
                state
            }
            Err(CorruptStateError::Missing(path)) => {
                warning!(
                    format!("No state file at {}, starting a new scan", path.display()),
                    config.accessible
                );
                ScanState::new(resolution.keys, &config.output_dir)
            }
            Err(e) => return Err(Error::from(e).into()),
        }
    } else {
        if store.exists() {
            info!("Overwriting {} (use --resume to continue it)", store.path().display());
        }
        ScanState::new(resolution.keys, &config.output_dir)
    };

    for unit in state.units() {
        std::fs::create_dir_all(&unit.directory)
            .with_context(|| format!("cannot create {}", unit.directory.display()))?;
    }
    store.save(&mut state)?;

    let executor = Arc::new(CommandExecutor::new(config.nmap.clone(), config.nuclei_enabled));
    let policy = config.policy(executor.vuln_scan_available());
    let scheduler = Scheduler::new(
        state,
        store,
        policy,
        config.deadlines,
        Arc::new(NmapResultParser),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping workers");
            on_interrupt.cancel();
        }
    });

    let report = scheduler.run(executor, config.workers, cancel).await?;
    print_summary(&report.state, config.accessible);

    if report.interrupted {
        warning!(
            format!(
                "Scan interrupted. Progress is saved in {}; rerun with --resume to continue.",
                config.state_file.display()
            ),
            config.accessible
        );
    } else {
        output!(
            format!("Results written to {}", config.output_dir.display()),
            config.accessible
        );
    }
    Ok(report.exit_code())
}
