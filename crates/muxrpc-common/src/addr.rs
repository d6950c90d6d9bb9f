//! Endpoint address grammar and the HTTP tunnel surface constants.
//!
//! Endpoints are written as `"<scheme>@<target>"`: `tcp@host:port` and
//! `unix@/path` yield a raw codec session over that transport, while
//! `http@host:port` tunnels the session through an HTTP CONNECT exchange
//! so RPC can share a port with an HTTP server.

use std::fmt;
use std::str::FromStr;

use crate::error::RpcError;

/// Status line payload acknowledging a CONNECT on the RPC path.
pub const CONNECTED: &str = "200 Connected to go-rpc";
/// Path the RPC tunnel is mounted on.
pub const DEFAULT_RPC_PATH: &str = "/_gorpc_";
/// HTTP header carrying endpoint addresses between servers, the registry
/// and discovery.
pub const SERVERS_HEADER: &str = "X-Gorpc-Servers";

/// A parsed `scheme@target` endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    /// `tcp@host:port`
    Tcp(String),
    /// `unix@/path/to.sock`
    Unix(String),
    /// `http@host:port`, tunneled through HTTP CONNECT
    Http(String),
}

impl FromStr for Addr {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, target) = s
            .split_once('@')
            .ok_or_else(|| RpcError::InvalidAddress(s.to_string()))?;
        match scheme {
            "tcp" => Ok(Addr::Tcp(target.to_string())),
            "unix" => Ok(Addr::Unix(target.to_string())),
            "http" => Ok(Addr::Http(target.to_string())),
            _ => Err(RpcError::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(target) => write!(f, "tcp@{target}"),
            Addr::Unix(target) => write!(f, "unix@{target}"),
            Addr::Http(target) => write!(f, "http@{target}"),
        }
    }
}
