//! Upstream variant records and address parsing.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::UpstreamConfig;

#[derive(Debug, Error)]
#[error("invalid upstream address '{address}': {reason}")]
pub struct AddressError {
    address: String,
    reason: String,
}

/// A resolved upstream a variant proxies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub address: SocketAddr,
    pub tls: bool,
    pub sni: String,
}

impl Upstream {
    /// Validates the configured address; SNI defaults to its host part.
    pub fn from_config(cfg: &UpstreamConfig) -> Result<Self, AddressError> {
        let address = parse_upstream_address(&cfg.address)?;
        let sni = cfg
            .sni
            .clone()
            .unwrap_or_else(|| split_host_port(&cfg.address).0.to_string());
        Ok(Self {
            address,
            tls: cfg.tls,
            sni,
        })
    }
}

/// Parses an upstream address string into a SocketAddr.
///
/// Expects "IP:PORT" (e.g. "192.168.1.1:8080" or "[::1]:8080").
pub fn parse_upstream_address(address: &str) -> Result<SocketAddr, AddressError> {
    address.parse::<SocketAddr>().map_err(|e| AddressError {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

/// Splits an authority into host and optional port. IPv6 brackets are
/// removed from the host; the port is `None` when the authority carries
/// none. Malformed bracket forms come back whole, port-less.
pub fn split_host_port(authority: &str) -> (&str, Option<&str>) {
    if let Some(bracketed) = authority.strip_prefix('[') {
        match bracketed.split_once(']') {
            Some((host, rest)) => return (host, rest.strip_prefix(':')),
            None => return (authority, None),
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    }
}
