use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of a transfer session this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Sender,
    Receiver,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Sender => write!(f, "sender"),
            TransferMode::Receiver => write!(f, "receiver"),
        }
    }
}

/// Per-file metadata announced before the payload run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub file_name: String,
    pub file_size: u64,
    /// 1-based position of this file in the batch.
    pub current_file: u32,
    pub total_files: u32,
}

impl TransferMetadata {
    /// Checks the `1 <= current_file <= total_files` bound the receiver
    /// relies on before allocating state.
    pub fn is_valid(&self) -> bool {
        self.current_file >= 1 && self.current_file <= self.total_files
    }
}

/// What a sender publishes once its listener is bound.
///
/// For remote mode `address` is `"REMOTE"`, `port` is 0 and `code` carries
/// the rendezvous peer identity instead of a session code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub address: String,
    pub port: u16,
    pub code: String,
    pub hostname: String,
}

impl ConnectionInfo {
    /// Marker address used when the session runs over the remote channel.
    pub const REMOTE_ADDRESS: &'static str = "REMOTE";

    pub fn remote(peer_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            address: Self::REMOTE_ADDRESS.into(),
            port: 0,
            code: peer_id.into(),
            hostname: hostname.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.address == Self::REMOTE_ADDRESS
    }
}
