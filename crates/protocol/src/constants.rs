use std::time::Duration;

/// Terminates every control record on the local TCP wire.
pub const FRAME_DELIMITER: [u8; 4] = [0, 0, 0, 0];

/// Maximum accepted control-record length, delimiter excluded.
///
/// A peer that streams more than this without a delimiter is not speaking
/// the protocol; the connection is torn down instead of buffering further.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Block size for streaming file payload on the local wire (64 KiB).
pub const LOCAL_CHUNK_SIZE: usize = 64 * 1024;

/// Chunk size for the remote channel protocol (256 KiB).
pub const REMOTE_CHUNK_SIZE: usize = 256 * 1024;

/// Sliding-window width for remote chunk acknowledgements.
pub const ACK_WINDOW: u64 = 20;

/// How long an accepted socket may stay unauthenticated.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Soft wait for a per-file `file-saved` acknowledgement (local mode).
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Soft wait for one window slot to open (remote mode).
pub const CHUNK_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Soft wait for the final chunk acknowledgement (remote mode).
pub const FINAL_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Default discovery browse window.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);

/// Pause between the last payload byte and the `file-end` record.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Minimum interval between progress events for one file.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Buffered remote payload is flushed to disk once it reaches this size.
pub const WRITE_FLUSH_THRESHOLD: usize = 1024 * 1024;

/// Maximum pending flushes per remote transfer before new flushes defer.
pub const WRITE_QUEUE_DEPTH: usize = 5;

/// Bounded wait for the remote write queue to drain at `file-complete`.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after a `disconnect-request` before the channel is closed.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(100);

/// DNS-SD service type advertised and browsed on the local link.
pub const SERVICE_TYPE: &str = "_file-transfer._tcp";

/// Engine version published in the service TXT record.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
