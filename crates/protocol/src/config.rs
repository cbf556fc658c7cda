//! Engine configuration recognised by the core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Tunables for one engine instance. `Default` is the documented contract;
/// hosts deserialize overrides from their own settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Listener port; 0 asks the OS for an ephemeral one.
    pub port: u16,
    /// Local-mode streaming block size in bytes.
    pub chunk_size: usize,
    /// Remote-mode chunk size in bytes.
    pub remote_chunk_size: usize,
    /// Remote sliding-window width in chunks.
    pub window_size: u64,
    pub auth_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub discovery_window_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 0,
            chunk_size: constants::LOCAL_CHUNK_SIZE,
            remote_chunk_size: constants::REMOTE_CHUNK_SIZE,
            window_size: constants::ACK_WINDOW,
            auth_timeout_ms: constants::AUTH_TIMEOUT.as_millis() as u64,
            ack_timeout_ms: constants::ACK_TIMEOUT.as_millis() as u64,
            discovery_window_ms: constants::DISCOVERY_WINDOW.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }
}
