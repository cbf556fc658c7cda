use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::time::Instant;
use tracing::{debug, warn};

use beamdrop_protocol::constants::SERVICE_TYPE;

use crate::types::DiscoveredService;

/// One up/down observation inside a browse window.
#[derive(Debug)]
enum BrowseDelta {
    Up(DiscoveredService),
    Down(String),
}

/// Browses the local link for `window` and returns the peers present at
/// the end of it, in first-seen order.
///
/// Discovery is best-effort: daemon or browse failures are logged and an
/// empty (or partial) snapshot is returned instead of an error.
pub async fn browse(window: Duration) -> Vec<DiscoveredService> {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            warn!("failed to create mDNS daemon: {e}");
            return Vec::new();
        }
    };

    let service_type = format!("{SERVICE_TYPE}.local.");
    let receiver = match daemon.browse(&service_type) {
        Ok(rx) => rx,
        Err(e) => {
            warn!("failed to browse {service_type}: {e}");
            let _ = daemon.shutdown();
            return Vec::new();
        }
    };

    let mut services: Vec<DiscoveredService> = Vec::new();
    let deadline = Instant::now() + window;

    while Instant::now() < deadline {
        // The flume receiver blocks; bridge it onto the runtime the same
        // way the continuous-discovery loop does.
        let recv = tokio::task::spawn_blocking({
            let rx = receiver.clone();
            move || rx.recv_timeout(Duration::from_millis(100))
        });

        match tokio::time::timeout_at(deadline, recv).await {
            Ok(Ok(Ok(event))) => {
                if let Some(delta) = delta_from_event(&service_type, event) {
                    apply_delta(&mut services, delta);
                }
            }
            Ok(Ok(Err(_))) => {} // per-recv timeout; keep polling until the window ends
            Ok(Err(e)) => {
                warn!("mDNS receive task failed: {e}");
                break;
            }
            Err(_) => break, // window elapsed
        }
    }

    let _ = daemon.shutdown();
    debug!(count = services.len(), "browse window closed");
    services
}

/// Maintains the ordered live set: `up` appends (first seen wins its slot,
/// later sightings refresh it in place), `down` removes by name.
fn apply_delta(services: &mut Vec<DiscoveredService>, delta: BrowseDelta) {
    match delta {
        BrowseDelta::Up(svc) => {
            if let Some(existing) = services.iter_mut().find(|s| s.name == svc.name) {
                *existing = svc;
            } else {
                services.push(svc);
            }
        }
        BrowseDelta::Down(name) => {
            services.retain(|s| s.name != name);
        }
    }
}

fn delta_from_event(service_type: &str, event: ServiceEvent) -> Option<BrowseDelta> {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let name = instance_name(info.get_fullname(), service_type);

            let mut hostname = String::new();
            for property in info.get_properties().iter() {
                if property.key() == "hostname" {
                    hostname = property.val_str().to_string();
                }
            }
            if hostname.is_empty() {
                hostname = info.get_hostname().trim_end_matches(".local.").to_string();
            }

            let addresses: Vec<IpAddr> = info
                .get_addresses()
                .iter()
                .copied()
                .filter(usable_address)
                .collect();

            Some(BrowseDelta::Up(DiscoveredService {
                name,
                host: info.get_hostname().to_string(),
                addresses,
                port: info.get_port(),
                hostname,
            }))
        }
        ServiceEvent::ServiceRemoved(_, full_name) => {
            Some(BrowseDelta::Down(instance_name(&full_name, service_type)))
        }
        _ => None,
    }
}

fn instance_name(full_name: &str, service_type: &str) -> String {
    full_name
        .strip_suffix(service_type)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(full_name)
        .to_string()
}

fn usable_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] != 127 && !(o[0] == 169 && o[1] == 254)
        }
        IpAddr::V6(_) => false,
    }
}
