use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::unique::unique_target_path;
use crate::validate::validate_file_name;
use crate::FileOpsError;

/// A file being received, written under a hidden spool name and renamed to
/// its collision-free target only once complete.
///
/// Spooling narrows the check-then-write race of the naming policy to the
/// final rename, and a crashed transfer leaves a `.part` file instead of a
/// half-written target.
#[derive(Debug)]
pub struct SpoolFile {
    dir: PathBuf,
    requested: String,
    spool_path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl SpoolFile {
    /// Opens a spool file in `dir` for the sender-supplied `requested`
    /// name. The name is validated here, before anything touches disk.
    pub async fn create(dir: &Path, requested: &str) -> Result<Self, FileOpsError> {
        validate_file_name(requested)?;
        tokio::fs::create_dir_all(dir).await?;

        let spool_path = dir.join(format!(".{}.part", uuid::Uuid::new_v4()));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&spool_path)
            .await?;

        Ok(Self {
            dir: dir.to_path_buf(),
            requested: requested.to_string(),
            spool_path,
            file: Some(file),
            bytes_written: 0,
        })
    }

    /// Appends payload bytes.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), FileOpsError> {
        let file = self
            .file
            .as_mut()
            .expect("write after finalize or discard");
        file.write_all(bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn requested_name(&self) -> &str {
        &self.requested
    }

    /// Flushes, picks the collision-free target at this instant, and
    /// renames the spool file onto it. Returns the on-disk path.
    pub async fn finalize(mut self) -> Result<PathBuf, FileOpsError> {
        let mut file = self.file.take().expect("finalize twice");
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let target = unique_target_path(&self.dir, &self.requested);
        tokio::fs::rename(&self.spool_path, &target).await?;
        debug!(requested = %self.requested, target = %target.display(), "file materialised");
        Ok(target)
    }

    /// Removes the spool file without materialising it.
    pub async fn discard(mut self) {
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.spool_path).await {
            debug!(path = %self.spool_path.display(), "spool cleanup failed: {e}");
        }
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        // Finalize/discard consume self; reaching Drop with the handle still
        // open means the transfer died. Best-effort cleanup, sync because
        // Drop cannot await.
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.spool_path);
        }
    }
}
