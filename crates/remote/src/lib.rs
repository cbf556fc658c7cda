//! Remote-mode transfer over a brokered peer channel.
//!
//! The rendezvous collaborator hands the engine a reliable, ordered,
//! message-framed channel between two peers. This crate layers the
//! flow-controlled chunked protocol on top: windowed sends acknowledged
//! every `W` chunks, per-transfer receiver state with bounded write
//! queues, and streamed disk materialisation.

pub mod channel;
mod receiver;
pub mod session;

pub use channel::PeerChannel;
pub use session::RemoteSession;

/// Errors for the remote transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("peer channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    FileOps(#[from] beamdrop_file_ops::FileOpsError),

    #[error("remote protocol error: {0}")]
    Protocol(String),
}
