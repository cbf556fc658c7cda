//! mDNS/DNS-SD advertising and discovery for the local link.
//!
//! Advertising is tied to the sender lifecycle: the supervisor publishes
//! while the session is idle and listening, and unpublishes the moment a
//! receiver authenticates. Browsing is a bounded window that returns a
//! snapshot rather than a live stream.

mod browser;
mod publisher;
mod types;

pub use browser::browse;
pub use publisher::{lan_ipv4, local_hostname, Advertisement, Publisher};
pub use types::DiscoveredService;

/// Errors for discovery operations.
///
/// Only publishing surfaces these; browse is best-effort and logs instead.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(String),

    #[error("network error: {0}")]
    Network(String),
}
