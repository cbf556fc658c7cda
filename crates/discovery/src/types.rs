use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// A peer found during one browse window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredService {
    /// Service instance name (the peer's advertised host name).
    pub name: String,
    /// mDNS host the records resolve to.
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// Plain hostname from the TXT record.
    pub hostname: String,
}

impl DiscoveredService {
    /// `ip:port` for connecting, preferring the first resolved address.
    pub fn address(&self) -> String {
        match self.addresses.first() {
            Some(ip) => format!("{ip}:{}", self.port),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}
