//! Runs nmap and nuclei for one task.
//!
//! Every command is built from a fixed argument template whose `{{name}}`
//! placeholders are filled per task. Input lists are written into the unit's
//! directory from the task snapshot before the process starts: `ips.txt` for
//! the nmap chain, and `target_urls.txt` or `nuclei/hosts.txt` for nuclei, so
//! a concurrent nuclei scan never rewrites a file nmap is reading. Child processes are killed if the
//! task future is dropped, so deadlines and cancellation never leave scans
//! running in the background.
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use itertools::Itertools;
use log::{debug, info};
use serde::Serialize;
use text_placeholder::Template;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::TaskError;
use crate::state::TaskKind;
use crate::task::{RawResult, Task};

const HOST_DISCOVERY: &[&str] = &[
    "nmap",
    "-vvv",
    "-n",
    "-sn",
    "-PE",
    "-PM",
    "-PP",
    "--min-hostgroup",
    "{{host_min_hostgroup}}",
    "--min-rate",
    "{{host_min_rate}}",
    "--max-retries",
    "{{max_retries}}",
    "--max-rtt-timeout",
    "{{host_max_rtt_timeout}}",
    "-oA",
    "{{output}}",
    "{{target}}",
];

const PORT_DISCOVERY: &[&str] = &[
    "nmap",
    "-n",
    "-Pn",
    "-sS",
    "--min-rate",
    "{{min_rate}}",
    "--max-retries",
    "{{max_retries}}",
    "--top-ports",
    "{{top_ports}}",
    "-oX",
    "{{output}}",
    "-iL",
    "{{input}}",
];

const SERVICE_SCAN: &[&str] = &[
    "nmap",
    "-n",
    "-Pn",
    "-sV",
    "--version-intensity",
    "{{version_intensity}}",
    "-iL",
    "{{input}}",
    "-p",
    "{{ports}}",
    "-oA",
    "{{output}}",
];

const VULN_SCAN: &[&str] = &[
    "nuclei",
    "-list",
    "{{input}}",
    "-markdown-export",
    "{{report_dir}}",
    "-json-export",
    "{{output}}",
];

/// Runs the external tool for a task and reports where its output went.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<RawResult, TaskError>;

    /// Whether vulnerability scan tasks can be run at all.
    fn vuln_scan_available(&self) -> bool {
        true
    }
}

/// Nmap tuning shared by every scan of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmapSettings {
    pub top_ports: u32,
    pub min_rate: u32,
    pub host_min_rate: u32,
    pub host_min_hostgroup: u32,
    pub host_max_rtt_timeout: String,
    pub max_retries: u32,
    pub version_intensity: u8,
}

impl Default for NmapSettings {
    fn default() -> Self {
        Self {
            top_ports: 1000,
            min_rate: 500,
            host_min_rate: 1000,
            host_min_hostgroup: 512,
            host_max_rtt_timeout: "200ms".to_owned(),
            max_retries: 3,
            version_intensity: 2,
        }
    }
}

/// Values substituted into the command templates.
#[derive(Serialize, Debug, Default)]
struct CommandContext {
    target: String,
    input: String,
    output: String,
    report_dir: String,
    ports: String,
    top_ports: String,
    min_rate: String,
    host_min_rate: String,
    host_min_hostgroup: String,
    host_max_rtt_timeout: String,
    max_retries: String,
    version_intensity: String,
}

impl CommandContext {
    fn new(settings: &NmapSettings) -> Self {
        Self {
            top_ports: settings.top_ports.to_string(),
            min_rate: settings.min_rate.to_string(),
            host_min_rate: settings.host_min_rate.to_string(),
            host_min_hostgroup: settings.host_min_hostgroup.to_string(),
            host_max_rtt_timeout: settings.host_max_rtt_timeout.clone(),
            max_retries: settings.max_retries.to_string(),
            version_intensity: settings.version_intensity.to_string(),
            ..Self::default()
        }
    }
}

fn render(template: &[&str], context: &CommandContext) -> Result<Vec<String>, String> {
    template
        .iter()
        .map(|part| {
            Template::new(part)
                .fill_with_struct(context)
                .map_err(|e| format!("cannot fill '{part}': {e}"))
        })
        .collect()
}

/// Executes the real nmap and nuclei binaries.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    settings: NmapSettings,
    nuclei: bool,
}

impl CommandExecutor {
    /// `nuclei_enabled` is the user's choice; the binary must also be on `PATH`.
    pub fn new(settings: NmapSettings, nuclei_enabled: bool) -> Self {
        let nuclei = nuclei_enabled && binary_on_path("nuclei");
        if nuclei_enabled && !nuclei {
            info!("nuclei not found on PATH, vulnerability scans are disabled");
        }
        Self { settings, nuclei }
    }

    /// Builds the argument list for `task` and writes its input files.
    async fn prepare(&self, task: &Task) -> Result<(Vec<String>, PathBuf), TaskError> {
        let kind = task.kind;
        let dir = &task.directory;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| TaskError::execution(kind, format!("cannot create {}: {e}", dir.display())))?;

        let mut context = CommandContext::new(&self.settings);
        let (template, raw) = match kind {
            TaskKind::HostDiscovery => {
                let base = dir.join("hosts");
                context.target.clone_from(&task.key);
                context.output = base.display().to_string();
                (HOST_DISCOVERY, base.with_extension("gnmap"))
            }
            TaskKind::PortDiscovery => {
                let output = dir.join("open-ports.xml");
                context.input = write_list(kind, &dir.join("ips.txt"), &task.live_hosts).await?;
                context.output = output.display().to_string();
                (PORT_DISCOVERY, output)
            }
            TaskKind::ServiceScan => {
                let base = dir.join("service_scan");
                context.input = write_list(kind, &dir.join("ips.txt"), &task.live_hosts).await?;
                context.ports = task.open_ports.iter().join(",");
                context.output = base.display().to_string();
                (SERVICE_SCAN, base.with_extension("xml"))
            }
            TaskKind::VulnScan => {
                let report_dir = dir.join("nuclei");
                fs::create_dir_all(&report_dir).await.map_err(|e| {
                    TaskError::execution(kind, format!("cannot create {}: {e}", report_dir.display()))
                })?;
                context.input = if task.target_urls.is_empty() {
                    write_list(kind, &report_dir.join("hosts.txt"), &task.live_hosts).await?
                } else {
                    write_list(kind, &dir.join("target_urls.txt"), &task.target_urls).await?
                };
                let output = report_dir.join("output.json");
                context.report_dir = report_dir.display().to_string();
                context.output = output.display().to_string();
                (VULN_SCAN, output)
            }
        };

        let args = render(template, &context).map_err(|e| TaskError::execution(kind, e))?;
        Ok((args, raw))
    }
}

#[async_trait]
impl ScanExecutor for CommandExecutor {
    async fn execute(&self, task: &Task) -> Result<RawResult, TaskError> {
        let (args, output) = self.prepare(task).await?;
        run_command(&task.key, task.kind, &args).await?;
        Ok(RawResult::new(output))
    }

    fn vuln_scan_available(&self) -> bool {
        self.nuclei
    }
}

/// Writes one item per line, replacing `path` only once the list is complete.
async fn write_list(kind: TaskKind, path: &Path, items: &[String]) -> Result<String, TaskError> {
    let mut content = items.join("\n");
    content.push('\n');
    let tmp = path.with_extension("tmp");
    let written = async {
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await
    };
    written
        .await
        .map_err(|e| TaskError::execution(kind, format!("cannot write {}: {e}", path.display())))?;
    Ok(path.display().to_string())
}

/// Spawns `args`, forwards its output to the debug log and waits for it.
///
/// The child is killed if the returned future is dropped.
pub async fn run_command(key: &str, kind: TaskKind, args: &[String]) -> Result<(), TaskError> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| TaskError::execution(kind, "empty command"))?;
    debug!("[{key}] running: {}", args.join(" "));

    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TaskError::execution(kind, format!("cannot start {program}: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, (), ()) = tokio::join!(
        child.wait(),
        forward(key, stdout),
        forward(key, stderr)
    );
    let status = status.map_err(|e| TaskError::execution(kind, e.to_string()))?;

    if status.success() {
        return Ok(());
    }
    Err(TaskError::execution(
        kind,
        status
            .code()
            .map_or_else(|| "terminated by signal".to_owned(), |code| format!("exit code {code}")),
    ))
}

async fn forward<R: AsyncRead + Unpin>(key: &str, stream: Option<R>) {
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{key}] {line}");
    }
}

/// True when an executable file called `name` is in a `PATH` directory.
pub fn binary_on_path(name: &str) -> bool {
    env::var_os("PATH").is_some_and(|paths| env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
}

/// True when the effective user is root, which nmap needs for `-sS` and
/// ICMP probes.
#[cfg(unix)]
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub const fn running_as_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::{
        binary_on_path, render, run_command, running_as_root, CommandContext, CommandExecutor,
        NmapSettings, HOST_DISCOVERY, SERVICE_SCAN,
    };
    use crate::state::TaskKind;
    use crate::task::Task;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    fn task(dir: &Path, kind: TaskKind) -> Task {
        Task {
            key: "10.0.0.0/24".to_owned(),
            kind,
            directory: dir.to_path_buf(),
            live_hosts: vec!["10.0.0.1".to_owned(), "10.0.0.7".to_owned()],
            open_ports: vec![22, 443],
            target_urls: vec![],
            deadline: Duration::from_secs(60),
        }
    }

    #[test]
    fn host_discovery_template_is_filled() {
        let mut context = CommandContext::new(&NmapSettings::default());
        context.target = "10.0.0.0/24".to_owned();
        context.output = "out/10_0_0_0-24/hosts".to_owned();

        let args = render(HOST_DISCOVERY, &context).unwrap();
        assert_eq!(args.first().map(String::as_str), Some("nmap"));
        assert!(args.windows(2).any(|w| w == ["--min-hostgroup", "512"]));
        assert!(args.windows(2).any(|w| w == ["--max-rtt-timeout", "200ms"]));
        assert!(args.windows(2).any(|w| w == ["-oA", "out/10_0_0_0-24/hosts"]));
        assert_eq!(args.last().map(String::as_str), Some("10.0.0.0/24"));
    }

    #[test]
    fn service_scan_template_lists_ports() {
        let mut context = CommandContext::new(&NmapSettings {
            version_intensity: 7,
            ..NmapSettings::default()
        });
        context.ports = "22,443".to_owned();
        let args = render(SERVICE_SCAN, &context).unwrap();
        assert!(args.windows(2).any(|w| w == ["-p", "22,443"]));
        assert!(args.windows(2).any(|w| w == ["--version-intensity", "7"]));
    }

    #[tokio::test]
    async fn port_discovery_writes_host_list() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(NmapSettings::default(), false);

        let (args, output) = executor
            .prepare(&task(dir.path(), TaskKind::PortDiscovery))
            .await
            .unwrap();

        assert_eq!(output, dir.path().join("open-ports.xml"));
        assert_eq!(
            fs::read_to_string(dir.path().join("ips.txt")).unwrap(),
            "10.0.0.1\n10.0.0.7\n"
        );
        assert!(args.windows(2).any(|w| w == ["--top-ports", "1000"]));
    }

    #[tokio::test]
    async fn vuln_scan_prefers_target_urls() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(NmapSettings::default(), false);
        let mut task = task(dir.path(), TaskKind::VulnScan);
        task.target_urls = vec!["10.0.0.1:22".to_owned(), "10.0.0.1:443".to_owned()];

        let (args, output) = executor.prepare(&task).await.unwrap();

        let list = dir.path().join("target_urls.txt");
        assert_eq!(fs::read_to_string(&list).unwrap(), "10.0.0.1:22\n10.0.0.1:443\n");
        assert_eq!(args[2], list.display().to_string());
        assert_eq!(output, dir.path().join("nuclei/output.json"));
        assert!(dir.path().join("nuclei").is_dir());
    }

    #[tokio::test]
    async fn vuln_scan_falls_back_to_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(NmapSettings::default(), false);
        let (args, _) = executor
            .prepare(&task(dir.path(), TaskKind::VulnScan))
            .await
            .unwrap();
        let hosts = dir.path().join("nuclei/hosts.txt");
        assert_eq!(args[2], hosts.display().to_string());
        assert_eq!(fs::read_to_string(hosts).unwrap(), "10.0.0.1\n10.0.0.7\n");
    }

    #[tokio::test]
    async fn vuln_scan_leaves_nmap_input_alone() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandExecutor::new(NmapSettings::default(), false);
        executor
            .prepare(&task(dir.path(), TaskKind::PortDiscovery))
            .await
            .unwrap();
        let ips = dir.path().join("ips.txt");
        let before = fs::metadata(&ips).unwrap().modified().unwrap();

        let mut vuln = task(dir.path(), TaskKind::VulnScan);
        vuln.live_hosts = vec!["10.0.0.99".to_owned()];
        executor.prepare(&vuln).await.unwrap();

        assert_eq!(fs::read_to_string(&ips).unwrap(), "10.0.0.1\n10.0.0.7\n");
        assert_eq!(fs::metadata(&ips).unwrap().modified().unwrap(), before);
        assert!(!dir.path().join("ips.tmp").exists());
    }

    #[test]
    fn disabled_nuclei_is_unavailable() {
        use super::ScanExecutor;
        assert!(!CommandExecutor::new(NmapSettings::default(), false).vuln_scan_available());
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_execution_error() {
        let args = ["sh", "-c", "echo scanning; exit 3"].map(str::to_owned);
        let err = run_command("10.0.0.1", TaskKind::PortDiscovery, &args)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "port discovery failed: exit code 3");
    }

    #[tokio::test]
    async fn missing_binary_is_an_execution_error() {
        let args = ["reconflow-no-such-binary".to_owned()];
        let err = run_command("10.0.0.1", TaskKind::HostDiscovery, &args)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot start reconflow-no-such-binary"));
    }

    #[tokio::test]
    async fn successful_command() {
        let args = ["sh", "-c", "exit 0"].map(str::to_owned);
        assert!(run_command("10.0.0.1", TaskKind::ServiceScan, &args).await.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn root_check_matches_effective_uid() {
        let status = fs::read_to_string("/proc/self/status").unwrap();
        let euid = status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|ids| ids.split_whitespace().nth(1))
            .unwrap();
        assert_eq!(running_as_root(), euid == "0");
    }

    #[test]
    fn path_lookup() {
        assert!(binary_on_path("sh"));
        assert!(!binary_on_path("reconflow-no-such-binary"));
    }
}
