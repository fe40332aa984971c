//! CSI endpoint parsing.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::error::PluginError;

static ENDPOINT: LazyLock<Regex> = LazyLock::new(|| {
    // Scheme is case-insensitive, the address is taken verbatim.
    Regex::new(r"^(?i:(unix|tcp))://(.+)$").expect("endpoint pattern is valid")
});

/// Where the gRPC server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

/// Parse `unix://<path>` or `tcp://<host>:<port>`.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint, PluginError> {
    let captures = ENDPOINT
        .captures(endpoint)
        .ok_or_else(|| PluginError::InvalidEndpoint(endpoint.to_string()))?;

    let address = captures[2].to_string();
    if captures[1].eq_ignore_ascii_case("unix") {
        Ok(Endpoint::Unix(PathBuf::from(address)))
    } else {
        Ok(Endpoint::Tcp(address))
    }
}
