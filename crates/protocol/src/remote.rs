//! Records carried on the remote peer channel.
//!
//! The channel is message-framed JSON text, so chunk payloads are
//! base64-wrapped. Everything else about the payload stays opaque to the
//! engine.

use serde::{Deserialize, Serialize};

use crate::types::TransferMode;

/// Allocates a fresh opaque id for one file transmission.
///
/// A new id per file keeps duplicate filenames within one session
/// unambiguous on both ends.
pub fn new_transfer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A record on the remote channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RemoteFrame {
    /// Sender -> receiver, one per file, before any chunks.
    #[serde(rename_all = "camelCase")]
    FileMeta {
        file_name: String,
        transfer_id: String,
        file_size: u64,
        total_chunks: u64,
    },
    /// Sender -> receiver; `chunk_index` starts at 0.
    #[serde(rename_all = "camelCase")]
    FileChunk {
        transfer_id: String,
        chunk_index: u64,
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
    },
    /// Receiver -> sender, every window of chunks and on the final chunk.
    #[serde(rename_all = "camelCase")]
    ChunkAck {
        transfer_id: String,
        received_chunks: u64,
    },
    /// Sender -> receiver, after the final ACK wait.
    #[serde(rename_all = "camelCase")]
    FileComplete { transfer_id: String, file_size: u64 },
    /// Either side; the channel closes after a short grace period.
    DisconnectRequest { reason: String, mode: TransferMode },
}

impl RemoteFrame {
    /// The transfer this record belongs to, if it is per-transfer.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            RemoteFrame::FileMeta { transfer_id, .. }
            | RemoteFrame::FileChunk { transfer_id, .. }
            | RemoteFrame::ChunkAck { transfer_id, .. }
            | RemoteFrame::FileComplete { transfer_id, .. } => Some(transfer_id),
            RemoteFrame::DisconnectRequest { .. } => None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_ids_are_unique() {
        assert_ne!(new_transfer_id(), new_transfer_id());
    }

    #[test]
    fn chunk_payload_is_base64_on_the_wire() {
        let frame = RemoteFrame::FileChunk {
            transfer_id: "t1".into(),
            chunk_index: 0,
            chunk: vec![0x00, 0xFF, 0x10, 0x20],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"AP8QIA==\""), "got {json}");

        let parsed: RemoteFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn record_tags_are_kebab_case() {
        let frame = RemoteFrame::FileMeta {
            file_name: "dup.bin".into(),
            transfer_id: new_transfer_id(),
            file_size: 5_242_880,
            total_chunks: 20,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"file-meta\""));
        assert!(json.contains("\"fileName\""));
        assert!(json.contains("\"totalChunks\""));
    }

    #[test]
    fn disconnect_request_roundtrip() {
        let frame = RemoteFrame::DisconnectRequest {
            reason: "user cancelled".into(),
            mode: TransferMode::Sender,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"disconnect-request\""));
        assert!(json.contains("\"sender\""));
        let parsed: RemoteFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn transfer_id_accessor() {
        let ack = RemoteFrame::ChunkAck {
            transfer_id: "t9".into(),
            received_chunks: 40,
        };
        assert_eq!(ack.transfer_id(), Some("t9"));

        let bye = RemoteFrame::DisconnectRequest {
            reason: String::new(),
            mode: TransferMode::Receiver,
        };
        assert_eq!(bye.transfer_id(), None);
    }
}
