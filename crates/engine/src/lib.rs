//! Process-wide lifecycle supervisor and public engine façade.
//!
//! The [`Engine`] owns the discovery publisher, at most one local sender
//! session, at most one receiver connection and at most one remote
//! session. Advertising is on exactly while the sender is idle and
//! listening; shutdown is idempotent and releases everything.

mod advertise;
mod engine;

pub use engine::Engine;

pub use beamdrop_discovery::DiscoveredService;
pub use beamdrop_protocol::{
    ConnectionInfo, EngineConfig, EngineEvent, TransferMode, TransferProgress,
};
pub use beamdrop_remote::PeerChannel;

/// Top-level engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a session is already active")]
    SessionActive,

    #[error("no active session")]
    NoSession,

    #[error(transparent)]
    Local(#[from] beamdrop_local::LocalError),

    #[error(transparent)]
    Remote(#[from] beamdrop_remote::RemoteError),

    #[error(transparent)]
    Discovery(#[from] beamdrop_discovery::DiscoveryError),
}
