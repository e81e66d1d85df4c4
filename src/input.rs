//! Provides a means to read, parse and hold configuration options for scans.
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::executor::NmapSettings;
use crate::scheduler::{Deadlines, Policy, Workers};

const MAX_WORKERS: u64 = 100;
const MAX_TIMEOUT_MINUTES: u64 = 1440;
const MAX_RATE: u64 = 100_000;
const MAX_HOSTGROUP: u64 = 8192;
const TOP_PORT_NUMBER: u64 = 65535;

/// How far each target is taken through the pipeline.
///   - Full runs every stage.
///   - `HostsOnly` stops after host discovery.
///   - `PortsOnly` stops after port discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Full,
    HostsOnly,
    PortsOnly,
}

/// When nuclei runs relative to the nmap stages.
///   - after-service waits for the service scan to finish.
///   - after-hosts starts as soon as live hosts are known, next to the
///     remaining nmap stages.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum VulnOrder {
    #[value(name = "after-service")]
    #[serde(rename = "after-service")]
    AfterServiceScan,
    #[value(name = "after-hosts")]
    #[serde(rename = "after-hosts")]
    AfterHostDiscovery,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "reconflow",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Resumable network reconnaissance driven by nmap and nuclei.
/// Targets are split into /24 work units and taken through host discovery,
/// port discovery, service detection and vulnerability scanning. Progress is
/// saved after every step; rerun with --resume to continue an interrupted scan.
pub struct Opts {
    /// File with one IPv4 address or CIDR per line. Blank lines and lines
    /// starting with '#' are ignored.
    pub targets_file: PathBuf,

    /// Directory that receives one sub-directory of scan output per target.
    #[arg(short, long, default_value = "scan_results")]
    pub output_dir: PathBuf,

    /// State file path. Defaults to <output-dir>/<targets-file-stem>_state.json.
    #[arg(short, long)]
    pub state_file: Option<PathBuf>,

    /// Continue from the state file instead of starting over.
    #[arg(short, long)]
    pub resume: bool,

    /// Keep networks larger than /24 as a single work unit.
    #[arg(long)]
    pub no_split: bool,

    /// Number of concurrent nmap workers.
    #[arg(long, default_value = "1")]
    pub max_nmap: usize,

    /// Number of concurrent nuclei workers.
    #[arg(long, default_value = "1")]
    pub max_nuclei: usize,

    /// Host discovery timeout in minutes.
    #[arg(long, default_value = "30")]
    pub host_timeout: u64,

    /// Port discovery and service scan timeout in minutes.
    #[arg(short, long, default_value = "60")]
    pub timeout: u64,

    /// Nuclei scan timeout in minutes.
    #[arg(long, default_value = "60")]
    pub nuclei_timeout: u64,

    /// Number of most common ports probed during port discovery.
    #[arg(long, default_value = "1000")]
    pub top_ports: u32,

    /// Minimum packet rate for port discovery.
    #[arg(long, default_value = "500")]
    pub min_rate: u32,

    /// Minimum packet rate for host discovery.
    #[arg(long, default_value = "1000")]
    pub host_min_rate: u32,

    /// Minimum parallel host group size for host discovery.
    #[arg(long, default_value = "512")]
    pub host_min_hostgroup: u32,

    /// Maximum probe round-trip time for host discovery, in nmap time syntax.
    #[arg(long, default_value = "200ms")]
    pub host_max_rtt_timeout: String,

    /// Maximum probe retransmissions.
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Service detection intensity, 0 (light) to 9 (all probes).
    #[arg(long, default_value = "2")]
    pub version_intensity: u8,

    /// Stop every target after host discovery.
    #[arg(long, conflicts_with = "ports_only")]
    pub hosts_only: bool,

    /// Stop every target after port discovery.
    #[arg(long)]
    pub ports_only: bool,

    /// Never run nuclei.
    #[arg(long)]
    pub no_nuclei: bool,

    /// When nuclei runs for a target.
    #[arg(long, value_enum, ignore_case = true, default_value = "after-service")]
    pub nuclei_order: VulnOrder,

    /// Run nuclei against live hosts even when no open port was found.
    #[arg(long)]
    pub nuclei_without_ports: bool,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::parse()
    }

    /// Reads the command line arguments into an Opts struct and merge
    /// values found within the user configuration file.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            output_dir,
            max_nmap,
            max_nuclei,
            host_timeout,
            timeout,
            nuclei_timeout,
            top_ports,
            min_rate,
            host_min_rate,
            host_min_hostgroup,
            host_max_rtt_timeout,
            max_retries,
            version_intensity,
            no_split,
            hosts_only,
            ports_only,
            no_nuclei,
            nuclei_order,
            nuclei_without_ports,
            accessible
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        // An explicit --state-file always wins over the config file.
        if self.state_file.is_none() {
            merge_optional!(state_file);
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    output_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
    max_nmap: Option<usize>,
    max_nuclei: Option<usize>,
    host_timeout: Option<u64>,
    timeout: Option<u64>,
    nuclei_timeout: Option<u64>,
    top_ports: Option<u32>,
    min_rate: Option<u32>,
    host_min_rate: Option<u32>,
    host_min_hostgroup: Option<u32>,
    host_max_rtt_timeout: Option<String>,
    max_retries: Option<u32>,
    version_intensity: Option<u8>,
    no_split: Option<bool>,
    hosts_only: Option<bool>,
    ports_only: Option<bool>,
    no_nuclei: Option<bool>,
    nuclei_order: Option<VulnOrder>,
    nuclei_without_ports: Option<bool>,
    accessible: Option<bool>,
}

#[cfg(not(tarpaulin_include))]
#[allow(clippy::doc_link_with_quotes)]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing or unreadable file yields an empty config.
    ///
    /// # Format
    ///
    /// output_dir = "scan_results"
    /// max_nmap = 4
    /// timeout = 90
    /// nuclei_order = "after-hosts"
    /// no_split = false
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, toml::de::Error> {
        let Some(config_path) = custom_config_path.or_else(default_config_path) else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(config_path).unwrap_or_default();
        toml::from_str(&content)
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::home_dir()?;
    config_path.push(".reconflow.toml");
    Some(config_path)
}

/// Validated settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub targets_file: PathBuf,
    pub output_dir: PathBuf,
    pub state_file: PathBuf,
    pub resume: bool,
    pub split_subnets: bool,
    pub workers: Workers,
    pub deadlines: Deadlines,
    pub nmap: NmapSettings,
    pub mode: ScanMode,
    pub nuclei_enabled: bool,
    pub nuclei_order: VulnOrder,
    pub nuclei_without_ports: bool,
    pub accessible: bool,
}

fn check_range(name: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            min,
            max,
            value,
        })
    }
}

const fn minutes(value: u64) -> Duration {
    Duration::from_secs(value * 60)
}

/// `<output-dir>/<targets-file-stem>_state.json`
pub fn default_state_file(output_dir: &Path, targets_file: &Path) -> PathBuf {
    let stem = targets_file
        .file_stem()
        .map_or_else(|| "targets".into(), |s| s.to_string_lossy());
    output_dir.join(format!("{stem}_state.json"))
}

impl ScanConfig {
    /// Checks every option against its allowed range.
    pub fn from_opts(opts: &Opts) -> Result<Self, ConfigError> {
        if opts.hosts_only && opts.ports_only {
            return Err(ConfigError::ConflictingModes);
        }

        check_range("--max-nmap", opts.max_nmap as u64, 1, MAX_WORKERS)?;
        check_range("--max-nuclei", opts.max_nuclei as u64, 1, MAX_WORKERS)?;
        check_range("--host-timeout", opts.host_timeout, 1, MAX_TIMEOUT_MINUTES)?;
        check_range("--timeout", opts.timeout, 1, MAX_TIMEOUT_MINUTES)?;
        check_range("--nuclei-timeout", opts.nuclei_timeout, 1, MAX_TIMEOUT_MINUTES)?;
        check_range("--top-ports", opts.top_ports.into(), 1, TOP_PORT_NUMBER)?;
        check_range("--min-rate", opts.min_rate.into(), 1, MAX_RATE)?;
        check_range("--host-min-rate", opts.host_min_rate.into(), 1, MAX_RATE)?;
        check_range("--host-min-hostgroup", opts.host_min_hostgroup.into(), 1, MAX_HOSTGROUP)?;
        check_range("--version-intensity", opts.version_intensity.into(), 0, 9)?;

        if opts.host_max_rtt_timeout.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "--host-max-rtt-timeout",
                reason: "cannot be empty".to_owned(),
            });
        }
        if opts.output_dir.exists() && !opts.output_dir.is_dir() {
            return Err(ConfigError::InvalidPath(format!(
                "output path {} is not a directory",
                opts.output_dir.display()
            )));
        }

        let state_file = opts
            .state_file
            .clone()
            .unwrap_or_else(|| default_state_file(&opts.output_dir, &opts.targets_file));
        if state_file.is_dir() {
            return Err(ConfigError::InvalidPath(format!(
                "state file {} is a directory",
                state_file.display()
            )));
        }

        let mode = if opts.hosts_only {
            ScanMode::HostsOnly
        } else if opts.ports_only {
            ScanMode::PortsOnly
        } else {
            ScanMode::Full
        };

        Ok(Self {
            targets_file: opts.targets_file.clone(),
            output_dir: opts.output_dir.clone(),
            state_file,
            resume: opts.resume,
            split_subnets: !opts.no_split,
            workers: Workers {
                nmap: opts.max_nmap,
                nuclei: opts.max_nuclei,
            },
            deadlines: Deadlines {
                host_discovery: minutes(opts.host_timeout),
                port_discovery: minutes(opts.timeout),
                service_scan: minutes(opts.timeout),
                vuln_scan: minutes(opts.nuclei_timeout),
            },
            nmap: NmapSettings {
                top_ports: opts.top_ports,
                min_rate: opts.min_rate,
                host_min_rate: opts.host_min_rate,
                host_min_hostgroup: opts.host_min_hostgroup,
                host_max_rtt_timeout: opts.host_max_rtt_timeout.clone(),
                max_retries: opts.max_retries,
                version_intensity: opts.version_intensity,
            },
            mode,
            nuclei_enabled: !opts.no_nuclei,
            nuclei_order: opts.nuclei_order,
            nuclei_without_ports: opts.nuclei_without_ports,
            accessible: opts.accessible,
        })
    }

    /// Pipeline policy given whether nuclei can actually run.
    pub fn policy(&self, vuln_available: bool) -> Policy {
        Policy {
            mode: self.mode,
            vuln_order: (self.nuclei_enabled && vuln_available).then_some(self.nuclei_order),
            vuln_without_ports: self.nuclei_without_ports,
        }
    }
}
