//! Wire protocol and shared data model for the transfer engine.
//!
//! Control traffic on the local TCP wire is a sequence of self-describing
//! JSON records, each terminated by a four-zero-byte delimiter. Between a
//! `metadata` record and its `file-end` record the wire carries exactly
//! `file_size` opaque payload bytes; [`frames::FrameCodec`] switches between
//! the two interpretations so payload bytes are never scanned for the
//! delimiter.
//!
//! Remote-mode traffic rides a reliable ordered message channel as the JSON
//! records in [`remote`].

pub mod code;
pub mod config;
pub mod constants;
pub mod events;
pub mod frames;
pub mod progress;
pub mod remote;
pub mod types;

pub use code::{CodeError, SessionCode};
pub use config::EngineConfig;
pub use events::{EngineEvent, TransferProgress};
pub use frames::{encode_control, CodecError, ControlFrame, FrameCodec, FrameEvent};
pub use remote::{new_transfer_id, RemoteFrame};
pub use types::{ConnectionInfo, TransferMetadata, TransferMode};
