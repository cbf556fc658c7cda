//! Immutable event records published to the host application.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::TransferMode;

/// Progress of one file, emitted at most every 100 ms per file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub file_name: String,
    /// Percent complete, 0.0 to 100.0, monotonically non-decreasing.
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_bytes: Option<u64>,
    pub total_bytes: u64,
    pub current_file: u32,
    pub total_files: u32,
    /// Bytes per second over a short sliding window, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

/// Everything the engine reports to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EngineEvent {
    ConnectionStatus {
        connected: bool,
        mode: TransferMode,
    },
    ConnectionLost {
        mode: TransferMode,
        reason: String,
    },
    TransferProgress(TransferProgress),
    #[serde(rename_all = "camelCase")]
    FileReceived {
        file_name: String,
        file_size: u64,
        save_path: PathBuf,
        current_file: u32,
        total_files: u32,
    },
    TransferComplete,
    TransferError {
        message: String,
    },
}
