use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, warn};

use beamdrop_protocol::constants::{ENGINE_VERSION, SERVICE_TYPE};

use crate::DiscoveryError;

/// Handle for one live advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    full_name: String,
}

impl Advertisement {
    pub fn full_name(&self) -> &str {
        &self.full_name
    }
}

/// Advertises this sender on the local link via mDNS/DNS-SD.
///
/// One advertisement at a time; `publish` while published is a no-op that
/// returns the existing handle, and `unpublish` is safe to call at any
/// point of the shutdown path.
#[derive(Default)]
pub struct Publisher {
    daemon: Option<ServiceDaemon>,
    active: Option<Advertisement>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the service record: instance `name`, the listener `port`,
    /// TXT keys `hostname` and `version`.
    pub fn publish(&mut self, name: &str, port: u16) -> Result<Advertisement, DiscoveryError> {
        if let Some(ad) = &self.active {
            debug!(full_name = %ad.full_name, "already advertising");
            return Ok(ad.clone());
        }

        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Mdns(format!("failed to create mDNS daemon: {e}")))?;

        let ips = lan_ipv4_all();
        if ips.is_empty() {
            return Err(DiscoveryError::Network("no usable LAN IPv4 address".into()));
        }

        let plain_hostname = local_hostname();
        let mdns_hostname = format!("{plain_hostname}.local.");
        let service_type = format!("{SERVICE_TYPE}.local.");
        let full_name = format!("{name}.{service_type}");

        let properties = [
            ("hostname", plain_hostname.as_str()),
            ("version", ENGINE_VERSION),
        ];

        let service = ServiceInfo::new(
            &service_type,
            name,
            &mdns_hostname,
            &ips[..],
            port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::Mdns(format!("failed to build service record: {e}")))?;

        daemon
            .register(service)
            .map_err(|e| DiscoveryError::Mdns(format!("failed to register '{full_name}': {e}")))?;

        debug!(%full_name, port, "advertising published");
        let ad = Advertisement { full_name };
        self.daemon = Some(daemon);
        self.active = Some(ad.clone());
        Ok(ad)
    }

    /// Releases the advertisement. No-op when nothing is published.
    pub fn unpublish(&mut self) {
        let Some(ad) = self.active.take() else {
            return;
        };
        if let Some(daemon) = self.daemon.take() {
            if let Err(e) = daemon.unregister(&ad.full_name) {
                warn!(full_name = %ad.full_name, "mDNS unregister failed: {e}");
            }
            let _ = daemon.shutdown();
        }
        debug!(full_name = %ad.full_name, "advertising withdrawn");
    }

    pub fn is_published(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.unpublish();
    }
}

/// The first usable LAN IPv4 address, for display in connection info.
pub fn lan_ipv4() -> Option<IpAddr> {
    lan_ipv4_all().into_iter().next()
}

/// All non-loopback, non-link-local IPv4 addresses.
fn lan_ipv4_all() -> Vec<IpAddr> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };

    let mut ips = Vec::new();
    for iface in interfaces {
        if iface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(ipv4) = iface.ip() {
            // Link-local (169.254.x.x) means no DHCP lease; useless to peers.
            if ipv4.octets()[0] == 169 && ipv4.octets()[1] == 254 {
                continue;
            }
            ips.push(IpAddr::V4(ipv4));
        }
    }
    ips
}

/// The machine's hostname, without any mDNS suffix.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_nonempty() {
        assert!(!local_hostname().is_empty());
    }

    #[test]
    fn unpublish_without_publish_is_noop() {
        let mut publisher = Publisher::new();
        publisher.unpublish();
        assert!(!publisher.is_published());
    }

    #[test]
    fn advertisement_full_name() {
        let ad = Advertisement {
            full_name: "den-pc._file-transfer._tcp.local.".into(),
        };
        assert!(ad.full_name().starts_with("den-pc."));
    }
}
