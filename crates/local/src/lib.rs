//! Local-mode transfer over direct LAN TCP.
//!
//! The sender binds an ephemeral listener, authenticates exactly one
//! receiver by session code, then streams files as
//! `metadata -> payload -> file-end` sequences, waiting for the receiver's
//! `file-saved` before advancing. The receiver connects, authenticates and
//! materialises each file under a collision-free name.

mod handshake;
pub mod receiver;
pub mod sender;

pub use receiver::{connect_to_sender, ReceiverConnection};
pub use sender::{SenderSession, SenderState};

use beamdrop_protocol::frames::CodecError;

/// Errors for the local TCP session.
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error("failed to bind listener: {0}")]
    BindFailed(std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("protocol violation: expected {expected}, got {got}")]
    ProtocolViolation {
        expected: &'static str,
        got: &'static str,
    },

    #[error("invalid connection code")]
    InvalidCode,

    #[error("sender reported an error: {0}")]
    RemoteError(String),

    #[error("connection refused")]
    ConnectRefused,

    #[error("connection timed out")]
    Timeout,

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    FileOps(#[from] beamdrop_file_ops::FileOpsError),

    #[error(transparent)]
    Code(#[from] beamdrop_protocol::code::CodeError),

    #[error("peer disconnected")]
    PeerDisconnect,

    #[error("no authenticated receiver")]
    NotConnected,

    #[error("session is stopping")]
    Stopping,
}
