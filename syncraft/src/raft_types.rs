use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftError;

/// The network address of a cluster member, which doubles as its stable
/// identity within the cluster.
///
/// Addresses order lexicographically (host first, then port); this order is
/// used to break ties when two peers dial each other simultaneously.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// Create a new instance.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(2, ':');
        let port = parts.next().and_then(|p| p.parse::<u16>().ok());
        let host = parts.next();
        match (host, port) {
            (Some(host), Some(port)) if !host.is_empty() => Ok(Self::new(host, port)),
            _ => Err(RaftError::InvalidAddress(s.to_string())),
        }
    }
}

/// The identity of a log entry: its term and its 1-based position in the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait for summarizing a message for logging purposes, without dumping
/// whole payloads into the log stream.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address_parse_and_display() {
        let addr = "localhost:6010".parse::<NodeAddress>().unwrap();
        assert_eq!(addr, NodeAddress::new("localhost", 6010));
        assert_eq!(addr.to_string(), "localhost:6010");

        assert!("localhost".parse::<NodeAddress>().is_err());
        assert!(":6010".parse::<NodeAddress>().is_err());
        assert!("localhost:notaport".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_node_address_ordering() {
        let a = NodeAddress::new("localhost", 6001);
        let b = NodeAddress::new("localhost", 6002);
        let c = NodeAddress::new("otherhost", 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_log_id_ordering() {
        // Term dominates index, per the up-to-date comparison rule.
        assert!(LogId::new(2, 1) > LogId::new(1, 9));
        assert!(LogId::new(2, 3) > LogId::new(2, 2));
    }
}
