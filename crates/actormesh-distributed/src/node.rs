//! C6 — `NodeId`: a parsed `name@host:port` identity (spec §4.6).

use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
#[error("invalid node id {0:?}: expected name@host:port")]
pub struct InvalidNodeId(String);

/// A cluster node's address and logical name. Value object: two `NodeId`s
/// are equal iff their canonical strings are equal.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId {
    canonical: String,
    name_len: usize,
    host_len: usize,
}

impl NodeId {
    /// Parses `name@host:port`: exactly one `@`, exactly one `:` after it,
    /// non-empty name/host, port in `1..=65535`.
    pub fn parse(s: &str) -> Result<Self, InvalidNodeId> {
        let err = || InvalidNodeId(s.to_string());

        let (name, rest) = s.split_once('@').ok_or_else(err)?;
        let (host, port) = rest.split_once(':').ok_or_else(err)?;
        if name.is_empty() || host.is_empty() || name.contains('@') || host.contains('@') || host.contains(':') {
            return Err(err());
        }
        let port: u16 = port.parse().map_err(|_| err())?;
        if port == 0 {
            return Err(err());
        }

        Ok(NodeId {
            canonical: s.to_string(),
            name_len: name.len(),
            host_len: host.len(),
        })
    }

    pub fn new(name: &str, host: &str, port: u16) -> Result<Self, InvalidNodeId> {
        Self::parse(&format!("{name}@{host}:{port}"))
    }

    pub fn name(&self) -> &str {
        &self.canonical[..self.name_len]
    }

    pub fn host(&self) -> &str {
        &self.canonical[self.name_len + 1..self.name_len + 1 + self.host_len]
    }

    pub fn port(&self) -> u16 {
        self.canonical[self.name_len + 1 + self.host_len + 1..]
            .parse()
            .expect("validated at parse time")
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl FromStr for NodeId {
    type Err = InvalidNodeId;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_host_port() {
        let id = NodeId::parse("a@127.0.0.1:4371").unwrap();
        assert_eq!(id.name(), "a");
        assert_eq!(id.host(), "127.0.0.1");
        assert_eq!(id.port(), 4371);
        assert_eq!(id.as_str(), "a@127.0.0.1:4371");
    }

    #[test]
    fn rejects_malformed_forms() {
        for bad in ["a@h", "a:1", "@h:1", "a@:1", "a@h:", "a@h:0", "a@h:99999", "a@h@x:1"] {
            assert!(NodeId::parse(bad).is_err(), "expected {bad} to be rejected");
        }
    }

    #[test]
    fn equality_is_by_canonical_string() {
        assert_eq!(NodeId::parse("a@h:1").unwrap(), NodeId::parse("a@h:1").unwrap());
        assert_ne!(NodeId::parse("a@h:1").unwrap(), NodeId::parse("b@h:1").unwrap());
    }
}
