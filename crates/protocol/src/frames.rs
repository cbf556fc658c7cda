//! Control-frame codec for the local TCP wire.
//!
//! # Wire format
//!
//! ```text
//! CONTROL:  [JSON record][0x00 0x00 0x00 0x00]
//! PAYLOAD:  exactly `file_size` raw bytes between the `metadata` and
//!           `file-end` records of one file
//! ```
//!
//! The codec owns the receive buffer and drains it cursor-style. While a
//! payload run is armed the delimiter has no meaning: arbitrary binary data,
//! including runs of zero bytes, passes through untouched.

use serde::{Deserialize, Serialize};

use crate::constants::{FRAME_DELIMITER, MAX_FRAME_SIZE};
use crate::types::TransferMetadata;

/// A self-describing control record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Receiver -> sender, once, immediately after connect.
    Auth { code: String },
    /// Sender -> receiver, once, on code match.
    AuthSuccess,
    /// Sender -> receiver, fatal; the socket closes after this.
    Error { message: String },
    /// Sender -> receiver, one per file, before the payload run.
    Metadata { data: TransferMetadata },
    /// Sender -> receiver, after the last payload byte of a file.
    FileEnd,
    /// Receiver -> sender, one per file, after the durable write.
    FileSaved,
}

/// Message the sender emits when the submitted code does not match.
pub const INVALID_CODE_MESSAGE: &str = "Invalid connection code";

/// Errors raised while parsing the byte stream.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed control frame: {0}")]
    MalformedFrame(String),

    #[error("control frame exceeds {MAX_FRAME_SIZE} bytes without a delimiter")]
    FrameTooLarge,

    #[error("stream ended mid-payload: got {got} of {expected} bytes")]
    TruncatedPayload { expected: u64, got: u64 },

    #[error("failed to encode control frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serialises a control record and appends the frame delimiter.
pub fn encode_control(frame: &ControlFrame) -> Result<Vec<u8>, CodecError> {
    let mut out = serde_json::to_vec(frame)?;
    out.extend_from_slice(&FRAME_DELIMITER);
    Ok(out)
}

/// One decoded item from the stream.
#[derive(Debug, PartialEq)]
pub enum FrameEvent {
    Control(ControlFrame),
    /// A run of opaque payload bytes, at most the remaining expected length.
    Payload(Vec<u8>),
}

#[derive(Debug)]
struct PayloadRun {
    expected: u64,
    consumed: u64,
}

/// Incremental decoder for the mixed control/payload stream.
///
/// Feed raw socket bytes with [`push`](Self::push), then drain decoded items
/// with [`next_event`](Self::next_event) until it returns `None`. Arm payload
/// mode with [`expect_payload`](Self::expect_payload) when a `metadata`
/// record announces a file; the codec reverts to control mode by itself once
/// the full payload length has been drained.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
    /// Where to resume the delimiter scan; avoids rescanning the prefix on
    /// every push.
    scan_from: usize,
    payload: Option<PayloadRun>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Arms payload mode for the next `len` bytes.
    ///
    /// A zero-length run reverts immediately, so empty files never enter
    /// payload mode.
    pub fn expect_payload(&mut self, len: u64) {
        if len > 0 {
            self.payload = Some(PayloadRun {
                expected: len,
                consumed: 0,
            });
        }
    }

    pub fn in_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Bytes of the current payload run drained so far.
    pub fn payload_consumed(&self) -> u64 {
        self.payload.as_ref().map(|p| p.consumed).unwrap_or(0)
    }

    /// Decodes the next item, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<FrameEvent>, CodecError> {
        if let Some(run) = self.payload.as_mut() {
            if self.buf.is_empty() {
                return Ok(None);
            }
            let want = (run.expected - run.consumed) as usize;
            let take = want.min(self.buf.len());
            let chunk: Vec<u8> = self.buf.drain(..take).collect();
            run.consumed += take as u64;
            if run.consumed == run.expected {
                self.payload = None;
            }
            self.scan_from = 0;
            return Ok(Some(FrameEvent::Payload(chunk)));
        }

        match find_delimiter(&self.buf, self.scan_from) {
            Some(at) => {
                let record = &self.buf[..at];
                let frame: ControlFrame = serde_json::from_slice(record).map_err(|e| {
                    CodecError::MalformedFrame(format!(
                        "{e} in {:?}",
                        String::from_utf8_lossy(&record[..record.len().min(128)])
                    ))
                })?;
                self.buf.drain(..at + FRAME_DELIMITER.len());
                self.scan_from = 0;
                Ok(Some(FrameEvent::Control(frame)))
            }
            None => {
                if self.buf.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge);
                }
                // The delimiter may straddle the next push; keep its
                // possible prefix in the scan range.
                self.scan_from = self.buf.len().saturating_sub(FRAME_DELIMITER.len() - 1);
                Ok(None)
            }
        }
    }

    /// Must be called at transport EOF: a payload run cut short is a
    /// protocol error, not a clean close.
    pub fn finish(&self) -> Result<(), CodecError> {
        match &self.payload {
            Some(run) => Err(CodecError::TruncatedPayload {
                expected: run.expected,
                got: run.consumed,
            }),
            None => Ok(()),
        }
    }
}

fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < FRAME_DELIMITER.len() {
        return None;
    }
    (from..=buf.len() - FRAME_DELIMITER.len())
        .find(|&i| buf[i..i + FRAME_DELIMITER.len()] == FRAME_DELIMITER)
}
