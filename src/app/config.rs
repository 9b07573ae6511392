//! Startup configuration: the hosts file and the per-mode run configs.

use std::collections::HashMap;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use thiserror::Error;

use crate::core::id::{ProcessId, MAX_PROCESSES};
use crate::core::membership::Membership;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("duplicate process id {0}")]
    DuplicateId(ProcessId),
    #[error("hosts file is empty")]
    NoHosts,
    #[error("process ids must be dense 1..=N")]
    NonDenseIds,
    #[error("group of {0} exceeds the limit of {MAX_PROCESSES} processes")]
    TooManyProcesses(usize),
    #[error("cannot resolve {0} to an IPv4 address")]
    UnresolvableHost(String),
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn malformed(line: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::Malformed {
        line,
        reason: reason.into(),
    }
}

/// Parses `id host port` lines into the group membership. Ids must be dense
/// `1..=N`; hostnames are resolved to IPv4 here, once, so the hot path only
/// ever sees socket addresses.
pub fn load_hosts(path: &Path) -> Result<Membership, ConfigError> {
    let text = read(path)?;
    let mut addrs: HashMap<ProcessId, SocketAddr> = HashMap::new();

    for (index, line) in text.lines().enumerate() {
        let line_nr = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(id), Some(host), Some(port), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed(line_nr, "expected `id host port`"));
        };

        let id: ProcessId = id
            .parse()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| malformed(line_nr, "process id must be in 1..=255"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| malformed(line_nr, "invalid port"))?;
        let addr = resolve_ipv4(host, port)?;

        if addrs.insert(id, addr).is_some() {
            return Err(ConfigError::DuplicateId(id));
        }
    }

    if addrs.is_empty() {
        return Err(ConfigError::NoHosts);
    }
    if addrs.len() > MAX_PROCESSES {
        return Err(ConfigError::TooManyProcesses(addrs.len()));
    }
    if (1..=addrs.len()).any(|id| !addrs.contains_key(&(id as ProcessId))) {
        return Err(ConfigError::NonDenseIds);
    }

    Ok(Membership::new(addrs))
}

fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
        .ok_or_else(|| ConfigError::UnresolvableHost(host.to_string()))
}

/// FIFO mode config: a single integer, the number of values to broadcast.
pub fn load_fifo_config(path: &Path) -> Result<u32, ConfigError> {
    let text = read(path)?;
    text.split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| malformed(1, "expected a message count"))
}

/// Lattice mode config: `p vs ds` header, then `p` proposal lines.
#[derive(Debug, Clone)]
pub struct LatticeConfig {
    /// Number of proposals this node submits.
    pub proposal_count: usize,
    /// Largest number of values in a single proposal.
    pub max_proposal_size: usize,
    /// Distinct values across all proposals of all nodes; doubles as the
    /// early-decision threshold.
    pub unique_proposals: usize,
    pub proposals: Vec<Vec<u32>>,
}

pub fn load_lattice_config(path: &Path) -> Result<LatticeConfig, ConfigError> {
    let text = read(path)?;
    let mut lines = text.lines().enumerate();

    let (_, header) = lines
        .next()
        .ok_or_else(|| malformed(1, "missing `p vs ds` header"))?;
    let header_fields: Vec<usize> = header
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| malformed(1, "expected `p vs ds`"))?;
    let &[proposal_count, max_proposal_size, unique_proposals] = header_fields.as_slice() else {
        return Err(malformed(1, "expected `p vs ds`"));
    };

    let mut proposals = Vec::with_capacity(proposal_count);
    for (index, line) in lines {
        let line_nr = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let values: Vec<u32> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| malformed(line_nr, "invalid proposal value"))?;
        if values.len() > max_proposal_size {
            return Err(malformed(line_nr, "proposal exceeds declared size"));
        }
        proposals.push(values);
    }

    if proposals.len() != proposal_count {
        return Err(malformed(
            1,
            format!(
                "header declares {proposal_count} proposals, found {}",
                proposals.len()
            ),
        ));
    }

    Ok(LatticeConfig {
        proposal_count,
        max_proposal_size,
        unique_proposals,
        proposals,
    })
}
