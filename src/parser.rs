//! Turns raw nmap output into live hosts, open ports and `ip:port` targets.
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use itertools::Itertools;
use log::debug;
use serde::Deserialize;

use crate::error::TaskError;
use crate::state::TaskKind;
use crate::task::{ParsedResult, RawResult};

/// Extracts discovered data from a finished task's raw output.
pub trait ResultParser: Send + Sync {
    fn parse(&self, kind: TaskKind, raw: &RawResult) -> Result<ParsedResult, TaskError>;
}

/// Reads the files written by [`crate::executor::CommandExecutor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NmapResultParser;

impl ResultParser for NmapResultParser {
    fn parse(&self, kind: TaskKind, raw: &RawResult) -> Result<ParsedResult, TaskError> {
        match kind {
            TaskKind::HostDiscovery => {
                let content = read(kind, &raw.output)?;
                Ok(ParsedResult {
                    live_hosts: Some(parse_gnmap_hosts(&content)),
                    ..ParsedResult::default()
                })
            }
            TaskKind::PortDiscovery => {
                let content = read(kind, &raw.output)?;
                let ports = parse_open_ports(&content).map_err(|e| TaskError::parse(kind, e))?;
                Ok(ParsedResult {
                    open_ports: Some(ports.ports()),
                    target_urls: Some(ports.target_urls()),
                    ..ParsedResult::default()
                })
            }
            TaskKind::ServiceScan => {
                if raw.output.is_file() {
                    Ok(ParsedResult::default())
                } else {
                    Err(TaskError::parse(
                        kind,
                        format!("{} was not written", raw.output.display()),
                    ))
                }
            }
            TaskKind::VulnScan => Ok(ParsedResult::default()),
        }
    }
}

fn read(kind: TaskKind, path: &Path) -> Result<String, TaskError> {
    fs::read_to_string(path)
        .map_err(|e| TaskError::parse(kind, format!("cannot read {}: {e}", path.display())))
}

/// Addresses of every `Status: Up` line in greppable output, in file order.
pub fn parse_gnmap_hosts(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| line.contains("Status: Up"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_owned)
        .unique()
        .collect()
}

#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<Host>,
}

#[derive(Debug, Deserialize)]
struct Host {
    #[serde(rename = "address", default)]
    addresses: Vec<Address>,
    #[serde(default)]
    ports: Option<Ports>,
}

#[derive(Debug, Deserialize)]
struct Address {
    #[serde(rename = "@addr")]
    addr: String,
    #[serde(rename = "@addrtype", default)]
    addrtype: String,
}

#[derive(Debug, Deserialize)]
struct Ports {
    #[serde(rename = "port", default)]
    ports: Vec<Port>,
}

#[derive(Debug, Deserialize)]
struct Port {
    #[serde(rename = "@portid")]
    portid: u16,
    state: PortState,
}

#[derive(Debug, Deserialize)]
struct PortState {
    #[serde(rename = "@state")]
    state: String,
}

/// Open ports found per host address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenPorts {
    hosts: Vec<(String, Vec<u16>)>,
}

impl OpenPorts {
    /// Every open port across all hosts, sorted and unique.
    pub fn ports(&self) -> Vec<u16> {
        self.hosts
            .iter()
            .flat_map(|(_, ports)| ports.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// One `ip:port` entry per open port of each host.
    pub fn target_urls(&self) -> Vec<String> {
        self.hosts
            .iter()
            .flat_map(|(ip, ports)| ports.iter().map(move |port| format!("{ip}:{port}")))
            .collect()
    }
}

/// Parses nmap XML output, keeping ports in the `open` state.
pub fn parse_open_ports(xml: &str) -> Result<OpenPorts, String> {
    let run: NmapRun = quick_xml::de::from_str(xml).map_err(|e| e.to_string())?;
    let mut open = OpenPorts::default();

    for host in run.hosts {
        let Some(ip) = host
            .addresses
            .into_iter()
            .find(|a| a.addrtype.is_empty() || a.addrtype == "ipv4")
            .map(|a| a.addr)
        else {
            continue;
        };

        let ports: Vec<u16> = host
            .ports
            .map(|p| p.ports)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.state.state == "open")
            .map(|p| p.portid)
            .sorted_unstable()
            .dedup()
            .collect();

        debug!("{ip}: {} open ports", ports.len());
        if !ports.is_empty() {
            open.hosts.push((ip, ports));
        }
    }

    Ok(open)
}

#[cfg(test)]
mod tests {
    use super::{parse_gnmap_hosts, parse_open_ports, NmapResultParser, ResultParser};
    use crate::state::TaskKind;
    use crate::task::RawResult;
    use std::fs;

    const GNMAP: &str = "\
# Nmap 7.94 scan initiated as: nmap -vvv -n -sn -oA out/hosts 10.0.0.0/24
Host: 10.0.0.1 ()\tStatus: Up
Host: 10.0.0.2 ()\tStatus: Down
Host: 10.0.0.7 ()\tStatus: Up
Host: 10.0.0.1 ()\tStatus: Up
# Nmap done at Thu Jan  1 00:00:00 2024 -- 256 IP addresses (2 hosts up) scanned
";

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nmaprun>
<nmaprun scanner="nmap" args="nmap -n -Pn -sS" start="1700000000" version="7.94">
<scaninfo type="syn" protocol="tcp" numservices="1000" services="1-1000"/>
<verbose level="0"/>
<host starttime="1700000000" endtime="1700000010"><status state="up" reason="user-set"/>
<address addr="10.0.0.1" addrtype="ipv4"/>
<address addr="AA:BB:CC:DD:EE:FF" addrtype="mac"/>
<ports><extraports state="closed" count="997"/>
<port protocol="tcp" portid="443"><state state="open" reason="syn-ack"/><service name="https"/></port>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh"/></port>
<port protocol="tcp" portid="25"><state state="filtered" reason="no-response"/></port>
</ports>
</host>
<hosthint><status state="up"/><address addr="10.0.0.7" addrtype="ipv4"/></hosthint>
<host><status state="up" reason="user-set"/>
<address addr="10.0.0.7" addrtype="ipv4"/>
<ports><port protocol="tcp" portid="80"><state state="open" reason="syn-ack"/></port>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/></port></ports>
</host>
<host><status state="up"/><address addr="10.0.0.9" addrtype="ipv4"/><ports><extraports state="filtered" count="1000"/></ports></host>
<runstats><finished time="1700000020"/><hosts up="3" down="0" total="3"/></runstats>
</nmaprun>
"#;

    #[test]
    fn gnmap_keeps_up_hosts_once_in_order() {
        assert_eq!(parse_gnmap_hosts(GNMAP), ["10.0.0.1", "10.0.0.7"]);
    }

    #[test]
    fn gnmap_without_up_hosts_is_empty() {
        assert!(parse_gnmap_hosts("# Nmap done -- 256 IP addresses (0 hosts up)\n").is_empty());
    }

    #[test]
    fn xml_yields_sorted_ports_and_targets() {
        let open = parse_open_ports(XML).unwrap();
        assert_eq!(open.ports(), [22, 80, 443]);
        assert_eq!(
            open.target_urls(),
            ["10.0.0.1:22", "10.0.0.1:443", "10.0.0.7:22", "10.0.0.7:80"]
        );
    }

    #[test]
    fn xml_without_hosts_is_empty() {
        let open = parse_open_ports(r#"<nmaprun scanner="nmap"><runstats/></nmaprun>"#).unwrap();
        assert!(open.ports().is_empty());
        assert!(open.target_urls().is_empty());
    }

    #[test]
    fn truncated_xml_is_an_error() {
        assert!(parse_open_ports("<nmaprun><host><address addr=").is_err());
    }

    #[test]
    fn missing_output_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let raw = RawResult::new(dir.path().join("hosts.gnmap"));
        let err = NmapResultParser.parse(TaskKind::HostDiscovery, &raw).unwrap_err();
        assert!(err.to_string().starts_with("host discovery output unreadable"));

        let raw = RawResult::new(dir.path().join("service_scan.xml"));
        assert!(NmapResultParser.parse(TaskKind::ServiceScan, &raw).is_err());
    }

    #[test]
    fn port_discovery_result_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open-ports.xml");
        fs::write(&path, XML).unwrap();

        let parsed = NmapResultParser
            .parse(TaskKind::PortDiscovery, &RawResult::new(&path))
            .unwrap();
        assert_eq!(parsed.open_ports, Some(vec![22, 80, 443]));
        assert_eq!(parsed.target_urls.map(|t| t.len()), Some(4));
        assert!(parsed.live_hosts.is_none());
    }
}
