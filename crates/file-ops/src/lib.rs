//! Receiver-side filesystem helpers: sender-supplied name validation,
//! collision-free target naming and spool-file materialisation.

mod spool;
mod unique;
mod validate;

pub use spool::SpoolFile;
pub use unique::unique_target_path;
pub use validate::validate_file_name;

/// Errors for receiver-side file operations.
#[derive(Debug, thiserror::Error)]
pub enum FileOpsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file name: {0}")]
    InvalidName(String),
}
