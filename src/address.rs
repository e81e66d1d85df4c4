//! Provides functions to parse target lists into work-unit keys.
//!
//! A target line is a single IPv4 address or an IPv4 CIDR. Octets are
//! rejected when they carry leading zeros, since some tools read
//! `010` as octal. Networks wider than a /24 are cut into /24 chunks so
//! every work unit stays a manageable size for a single nmap run.
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use cidr_utils::cidr::Ipv4Cidr;
use cidr_utils::separator::Ipv4CidrSeparator;
use log::{debug, warn};
use tokio::fs;
use tokio::io;

use crate::error::ValidationError;

/// Networks wider than this are split into chunks of this prefix length.
pub const CHUNK_PREFIX: u8 = 24;

/// A validated target line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Host(Ipv4Addr),
    Network { address: Ipv4Addr, prefix: u8 },
}

impl Target {
    /// Returns the prefix length, treating a bare host as a /32.
    pub const fn prefix(&self) -> u8 {
        match self {
            Self::Host(_) => 32,
            Self::Network { prefix, .. } => *prefix,
        }
    }
}

/// Outcome of resolving a whole target list.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Canonical keys in first-seen order, without duplicates.
    pub keys: Vec<String>,
    /// Lines that failed validation. These never abort resolution.
    pub rejected: Vec<ValidationError>,
    /// Number of non-comment, non-blank lines seen.
    pub lines: usize,
}

/// Turns raw target lines into work-unit keys.
///
/// ```rust
/// # use reconflow::address::TargetResolver;
/// let resolution = TargetResolver::new(true).resolve(["10.0.0.0/23", "# lab", "10.0.0.1"]);
/// assert_eq!(resolution.keys, ["10.0.0.0/24", "10.0.1.0/24", "10.0.0.1"]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TargetResolver {
    split_subnets: bool,
}

impl TargetResolver {
    pub const fn new(split_subnets: bool) -> Self {
        Self { split_subnets }
    }

    /// Resolves lines in order. Blank lines and `#` comments are skipped,
    /// invalid lines are logged and reported in [`Resolution::rejected`].
    pub fn resolve<'a, I>(&self, lines: I) -> Resolution
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut resolution = Resolution::default();
        let mut seen = HashSet::new();

        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            resolution.lines += 1;

            let target = match parse_target(line) {
                Ok(target) => target,
                Err(e) => {
                    warn!("Skipping invalid target: {e}");
                    resolution.rejected.push(e);
                    continue;
                }
            };

            let keys = self.expand(line, target);
            if keys.len() > 1 {
                debug!("{line} -> {} /{CHUNK_PREFIX} subnets", keys.len());
            }
            for key in keys {
                if seen.insert(key.clone()) {
                    resolution.keys.push(key);
                }
            }
        }

        resolution
    }

    fn expand(&self, line: &str, target: Target) -> Vec<String> {
        match target {
            Target::Network { address, prefix } if self.split_subnets && prefix < CHUNK_PREFIX => {
                split_network(address, prefix)
            }
            _ => vec![line.to_owned()],
        }
    }
}

/// Reads a newline-delimited target file and resolves it.
pub async fn resolve_file(path: &Path, resolver: TargetResolver) -> io::Result<Resolution> {
    let content = fs::read_to_string(path).await?;
    Ok(resolver.resolve(content.lines()))
}

/// Strictly validates one target line.
pub fn parse_target(line: &str) -> Result<Target, ValidationError> {
    let malformed = || ValidationError::Malformed(line.to_owned());

    let (ip_part, prefix_part) = match line.split_once('/') {
        Some((ip, prefix)) => (ip, Some(prefix)),
        None => (line, None),
    };

    let octets: Vec<&str> = ip_part.split('.').collect();
    if octets.len() != 4 {
        return Err(malformed());
    }

    let mut bytes = [0u8; 4];
    for (slot, octet) in bytes.iter_mut().zip(&octets) {
        *slot = parse_decimal(octet, 255, line, ValidationError::OctetOutOfRange)? as u8;
    }
    let address = Ipv4Addr::from(bytes);

    match prefix_part {
        None => Ok(Target::Host(address)),
        Some(prefix) => {
            let prefix = parse_decimal(prefix, 32, line, ValidationError::PrefixOutOfRange)?;
            if prefix == 0 {
                return Err(ValidationError::PrefixOutOfRange(line.to_owned()));
            }
            Ok(Target::Network {
                address,
                prefix: prefix as u8,
            })
        }
    }
}

/// Parses a plain decimal component: digits only, at most three of them,
/// no leading zero unless the value is zero itself.
fn parse_decimal(
    component: &str,
    max: u16,
    line: &str,
    out_of_range: fn(String) -> ValidationError,
) -> Result<u16, ValidationError> {
    if component.is_empty() || component.len() > 3 || !component.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::Malformed(line.to_owned()));
    }
    if component.len() > 1 && component.starts_with('0') {
        return Err(ValidationError::LeadingZero(line.to_owned()));
    }
    let value: u16 = component
        .parse()
        .map_err(|_| ValidationError::Malformed(line.to_owned()))?;
    if value > max {
        return Err(out_of_range(line.to_owned()));
    }
    Ok(value)
}

/// Splits a network wider than a /24 into its /24 chunks. Host bits in
/// `address` are ignored, so `10.0.5.9/16` covers `10.0.0.0/16`.
fn split_network(address: Ipv4Addr, prefix: u8) -> Vec<String> {
    let mask = u32::MAX << (32 - u32::from(prefix));
    let base = Ipv4Addr::from(u32::from(address) & mask);

    Ipv4Cidr::new(base, prefix)
        .ok()
        .and_then(|network| Ipv4CidrSeparator::sub_networks(&network, CHUNK_PREFIX))
        .map(|chunks| {
            chunks
                .iter()
                .map(|chunk| format!("{}/{CHUNK_PREFIX}", chunk.first_address()))
                .collect()
        })
        .unwrap_or_default()
}

/// Derives the filesystem-safe directory token for a key.
///
/// `.` becomes `_` and `/` becomes `-`, so `10.0.0.1` and `10.0.0.1/32`
/// land in different directories. Anything else outside `[A-Za-z0-9_-]`
/// is replaced with `_`.
pub fn directory_token(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '.' => '_',
            '/' => '-',
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => c,
            _ => '_',
        })
        .collect()
}
