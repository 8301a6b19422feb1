//! Rendezvous addresses
//!
//! Two schemes are understood: `tcp://host:port` and `ipc:///path/to/socket`.
//! The latter is a Unix domain socket and leaves a single socket file behind
//! while the leader is bound.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MeshError;

/// Where the leader listens when nothing else is configured
pub const DEFAULT_ENDPOINT: &str = "ipc:///tmp/hansleader.ipc";

/// A parsed rendezvous address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`; port `0` asks the OS for a free port when binding
    Tcp(String),
    /// Filesystem path of a Unix domain socket
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self, MeshError> {
        let invalid = |reason: &str| MeshError::InvalidEndpoint {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = address.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| invalid("expected tcp://host:port"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            port.parse::<u16>().map_err(|_| invalid("port must be a number between 0 and 65535"))?;
            Ok(Endpoint::Tcp(rest.to_string()))
        } else if let Some(path) = address.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(invalid("missing socket path"));
            }
            Ok(Endpoint::Ipc(PathBuf::from(path)))
        } else {
            Err(invalid("unsupported scheme, expected tcp:// or ipc://"))
        }
    }

    pub fn tcp(host_port: impl Into<String>) -> Self {
        Endpoint::Tcp(host_port.into())
    }

    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Endpoint::Ipc(path.into())
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Endpoint::Tcp(_) => "tcp",
            Endpoint::Ipc(_) => "ipc",
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Ipc(PathBuf::from("/tmp/hansleader.ipc"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
