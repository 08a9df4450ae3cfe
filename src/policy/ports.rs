//! Port Allow-List

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Context;

use crate::Result;

/// Fixed set of destination ports the bridge may connect to.
///
/// Built once at startup and shared read-only with every request handler.
/// Entries are plain integers: a configured value outside the TCP port range
/// is kept but can never be dialed, because requests for it are refused
/// before any dial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPolicy {
    ports: BTreeSet<i64>,
}

impl PortPolicy {
    /// Create a policy from an explicit set of ports
    pub fn new<I, P>(ports: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<i64>,
    {
        Self {
            ports: ports.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated port list such as `"8484,8585"`.
    ///
    /// Every element must parse as an integer; the first element that does
    /// not fails the whole list. An empty (or all-whitespace) value yields an
    /// empty policy that rejects everything.
    pub fn parse(list: &str) -> Result<Self> {
        if list.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut ports = BTreeSet::new();
        for entry in list.split(',') {
            let port = entry
                .parse::<i64>()
                .with_context(|| format!("Unparsable port {:?} in port list", entry))?;
            ports.insert(port);
        }

        Ok(Self { ports })
    }

    /// Whether a requested port is on the allow-list.
    ///
    /// Accepts any integer; never fails.
    pub fn is_allowed(&self, port: i64) -> bool {
        self.ports.contains(&port)
    }

    /// Number of allowed entries
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// True when no port is allowed
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Entries that fall outside `1..=65535` and so can never be dialed
    pub fn undialable(&self) -> impl Iterator<Item = i64> + '_ {
        self.ports
            .iter()
            .copied()
            .filter(|port| !(1..=i64::from(u16::MAX)).contains(port))
    }
}

impl fmt::Display for PortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ports: Vec<String> = self.ports.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", ports.join(","))
    }
}
