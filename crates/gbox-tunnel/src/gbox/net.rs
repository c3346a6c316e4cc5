use std::{collections::HashSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Local listeners only ever bind loopback.
pub const LOCAL_BIND_HOST: &str = "127.0.0.1";

/// Address placed in `Open` frames. The remote side validates the port, not the host.
pub const REMOTE_TARGET_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

impl PortMapping {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }

    pub fn remote_target(&self) -> String {
        format!("{REMOTE_TARGET_HOST}:{}", self.remote)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PortSpecError {
    #[error("invalid port mapping {0:?} (expected [local:]remote)")]
    Syntax(String),
    #[error("invalid port {0:?} (expected 1-65535)")]
    Port(String),
    #[error("local port {0} is mapped more than once")]
    DuplicateLocal(u16),
    #[error("no ports given")]
    Empty,
}

impl FromStr for PortMapping {
    type Err = PortSpecError;

    /// `remote` alone means the same port locally.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split(':');
        let (local, remote) = match (parts.next(), parts.next(), parts.next()) {
            (Some(r), None, None) => (r, r),
            (Some(l), Some(r), None) => (l, r),
            _ => return Err(PortSpecError::Syntax(s.to_string())),
        };
        Ok(Self {
            local: parse_port(local)?,
            remote: parse_port(remote)?,
        })
    }
}

fn parse_port(s: &str) -> Result<u16, PortSpecError> {
    match s.trim().parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(PortSpecError::Port(s.trim().to_string())),
    }
}

pub fn parse_mappings<S: AsRef<str>>(specs: &[S]) -> Result<Vec<PortMapping>, PortSpecError> {
    if specs.is_empty() {
        return Err(PortSpecError::Empty);
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(specs.len());
    for s in specs {
        let m: PortMapping = s.as_ref().parse()?;
        if !seen.insert(m.local) {
            return Err(PortSpecError::DuplicateLocal(m.local));
        }
        out.push(m);
    }
    Ok(out)
}
