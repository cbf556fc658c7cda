//! Receiver-side per-transfer state for the remote protocol.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use beamdrop_file_ops::{FileOpsError, SpoolFile};
use beamdrop_protocol::constants::{DRAIN_TIMEOUT, WRITE_FLUSH_THRESHOLD, WRITE_QUEUE_DEPTH};
use beamdrop_protocol::progress::{ProgressThrottle, SpeedCalculator};
use beamdrop_protocol::{EngineEvent, RemoteFrame, TransferProgress};

use crate::RemoteError;

/// A disk write handed to a transfer's write queue.
enum WriteJob {
    Flush(Vec<u8>),
    Finalize(oneshot::Sender<Result<PathBuf, FileOpsError>>),
    Discard,
}

/// Serialises disk writes for one transfer on its own task.
///
/// The queue is bounded: once `WRITE_QUEUE_DEPTH` flushes are pending,
/// enqueueing suspends until the task catches up, which is exactly the
/// backpressure the receive loop wants.
struct WriteQueue {
    tx: mpsc::Sender<WriteJob>,
}

impl WriteQueue {
    fn spawn(spool: SpoolFile) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(WRITE_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut spool = Some(spool);
            let mut failure: Option<std::io::Error> = None;
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Flush(bytes) => {
                        if failure.is_some() {
                            continue;
                        }
                        if let Some(s) = spool.as_mut() {
                            if let Err(e) = s.write(&bytes).await {
                                warn!("flush failed: {e}");
                                failure = Some(std::io::Error::other(e.to_string()));
                            }
                        }
                    }
                    WriteJob::Finalize(reply) => {
                        let result = match (spool.take(), failure.take()) {
                            (Some(s), None) => s.finalize().await,
                            (Some(s), Some(e)) => {
                                s.discard().await;
                                Err(FileOpsError::Io(e))
                            }
                            (None, _) => Err(FileOpsError::Io(std::io::Error::other(
                                "transfer already finalised",
                            ))),
                        };
                        let _ = reply.send(result);
                        break;
                    }
                    WriteJob::Discard => {
                        if let Some(s) = spool.take() {
                            s.discard().await;
                        }
                        break;
                    }
                }
            }
        });
        Self { tx }
    }

    async fn flush(&self, bytes: Vec<u8>) {
        // A send error means the queue task died; the finalize path will
        // report the underlying failure.
        let _ = self.tx.send(WriteJob::Flush(bytes)).await;
    }

    async fn finalize(&self) -> Result<PathBuf, FileOpsError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriteJob::Finalize(reply_tx))
            .await
            .map_err(|_| FileOpsError::Io(std::io::Error::other("write queue gone")))?;
        match tokio::time::timeout(DRAIN_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FileOpsError::Io(std::io::Error::other("write queue gone"))),
            Err(_) => Err(FileOpsError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write queue did not drain in time",
            ))),
        }
    }

    async fn discard(&self) {
        let _ = self.tx.send(WriteJob::Discard).await;
    }
}

/// State for one incoming file, keyed by its transfer id.
struct IncomingTransfer {
    file_name: String,
    file_size: u64,
    total_chunks: u64,
    received_chunks: u64,
    received_bytes: u64,
    /// Payload awaiting the next flush; capped by the flush threshold.
    buffer: Vec<u8>,
    queue: WriteQueue,
    throttle: ProgressThrottle,
    speed: SpeedCalculator,
    /// 1-based position of this file within the session, for progress.
    sequence: u32,
}

/// All incoming transfers of one remote session.
pub(crate) struct IncomingSet {
    save_dir: PathBuf,
    transfers: HashMap<String, IncomingTransfer>,
    window: u64,
    files_seen: u32,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl IncomingSet {
    pub(crate) fn new(
        save_dir: &Path,
        window: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            save_dir: save_dir.to_path_buf(),
            transfers: HashMap::new(),
            window,
            files_seen: 0,
            events,
        }
    }

    /// Handles `file-meta`: allocates state and the streaming spool handle.
    pub(crate) async fn begin(
        &mut self,
        file_name: String,
        transfer_id: String,
        file_size: u64,
        total_chunks: u64,
    ) -> Result<(), RemoteError> {
        if self.transfers.contains_key(&transfer_id) {
            return Err(RemoteError::Protocol(format!(
                "duplicate transfer id {transfer_id}"
            )));
        }

        let spool = SpoolFile::create(&self.save_dir, &file_name).await?;
        self.files_seen += 1;
        debug!(file = %file_name, transfer_id = %transfer_id, file_size, "incoming file");

        self.transfers.insert(
            transfer_id,
            IncomingTransfer {
                file_name,
                file_size,
                total_chunks,
                received_chunks: 0,
                received_bytes: 0,
                buffer: Vec::new(),
                queue: WriteQueue::spawn(spool),
                throttle: ProgressThrottle::new(file_size),
                speed: SpeedCalculator::new(),
                sequence: self.files_seen,
            },
        );
        Ok(())
    }

    /// Handles `file-chunk`. Returns an ACK to send back when one is due
    /// (every `window` chunks and on the final chunk).
    pub(crate) async fn chunk(
        &mut self,
        transfer_id: &str,
        chunk_index: u64,
        chunk: Vec<u8>,
    ) -> Result<Option<RemoteFrame>, RemoteError> {
        let transfer = self.transfers.get_mut(transfer_id).ok_or_else(|| {
            RemoteError::Protocol(format!("chunk for unknown transfer {transfer_id}"))
        })?;

        if chunk_index != transfer.received_chunks {
            return Err(RemoteError::Protocol(format!(
                "chunk {chunk_index} out of order (expected {})",
                transfer.received_chunks
            )));
        }

        transfer.received_chunks += 1;
        transfer.received_bytes += chunk.len() as u64;
        transfer.speed.add_sample(chunk.len() as u64);
        transfer.buffer.extend_from_slice(&chunk);

        let last = transfer.received_chunks == transfer.total_chunks;
        if transfer.buffer.len() >= WRITE_FLUSH_THRESHOLD || last {
            let pending = std::mem::take(&mut transfer.buffer);
            // Suspends once the queue is WRITE_QUEUE_DEPTH deep.
            transfer.queue.flush(pending).await;
        }

        if let Some(percent) = transfer.throttle.tick(transfer.received_bytes) {
            let _ = self
                .events
                .send(EngineEvent::TransferProgress(TransferProgress {
                    file_name: transfer.file_name.clone(),
                    progress: percent,
                    sent_bytes: None,
                    received_bytes: Some(transfer.received_bytes),
                    total_bytes: transfer.file_size,
                    current_file: transfer.sequence,
                    total_files: self.files_seen,
                    speed: transfer.speed.bytes_per_second(),
                }));
        }

        let ack_due = last || transfer.received_chunks % self.window == 0;
        Ok(ack_due.then(|| RemoteFrame::ChunkAck {
            transfer_id: transfer_id.to_string(),
            received_chunks: transfer.received_chunks,
        }))
    }

    /// Handles `file-complete`: drains the queue, closes the handle and
    /// frees the per-transfer state.
    pub(crate) async fn complete(
        &mut self,
        transfer_id: &str,
        file_size: u64,
    ) -> Result<(), RemoteError> {
        let mut transfer = self.transfers.remove(transfer_id).ok_or_else(|| {
            RemoteError::Protocol(format!("completion for unknown transfer {transfer_id}"))
        })?;

        if transfer.received_bytes != file_size {
            transfer.queue.discard().await;
            return Err(RemoteError::Protocol(format!(
                "{}: received {} bytes, sender claims {file_size}",
                transfer.file_name, transfer.received_bytes
            )));
        }

        if !transfer.buffer.is_empty() {
            let pending = std::mem::take(&mut transfer.buffer);
            transfer.queue.flush(pending).await;
        }

        let save_path = transfer.queue.finalize().await?;
        info!(file = %transfer.file_name, path = %save_path.display(), "file received");
        let _ = self.events.send(EngineEvent::FileReceived {
            file_name: transfer.file_name,
            file_size,
            save_path,
            current_file: transfer.sequence,
            total_files: self.files_seen,
        });
        Ok(())
    }

    /// Drops every in-flight transfer, discarding partial spools.
    pub(crate) async fn abort_all(&mut self) {
        for (_, transfer) in self.transfers.drain() {
            transfer.queue.discard().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn events() -> (
        mpsc::UnboundedSender<EngineEvent>,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn single_transfer_end_to_end() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 20, tx);

        set.begin("a.bin".into(), "t1".into(), 6, 2).await.unwrap();
        assert!(set.chunk("t1", 0, b"abc".to_vec()).await.unwrap().is_none());
        // Final chunk always triggers an ACK.
        let ack = set.chunk("t1", 1, b"def".to_vec()).await.unwrap().unwrap();
        assert_eq!(
            ack,
            RemoteFrame::ChunkAck {
                transfer_id: "t1".into(),
                received_chunks: 2
            }
        );
        set.complete("t1", 6).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("a.bin")).unwrap(),
            b"abcdef"
        );
    }

    #[tokio::test]
    async fn ack_every_window() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 3, tx);

        set.begin("w.bin".into(), "t1".into(), 7, 7).await.unwrap();
        let mut acks = Vec::new();
        for i in 0..7u64 {
            if let Some(RemoteFrame::ChunkAck {
                received_chunks, ..
            }) = set.chunk("t1", i, vec![0u8]).await.unwrap()
            {
                acks.push(received_chunks);
            }
        }
        // Window of 3 over 7 chunks: after chunks 3, 6 and the final 7th.
        assert_eq!(acks, vec![3, 6, 7]);
    }

    #[tokio::test]
    async fn duplicate_filenames_never_interleave() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 20, tx);

        set.begin("dup.bin".into(), "t1".into(), 4, 1).await.unwrap();
        set.begin("dup.bin".into(), "t2".into(), 4, 1).await.unwrap();

        // Interleaved chunks route by transfer id.
        set.chunk("t1", 0, b"AAAA".to_vec()).await.unwrap();
        set.chunk("t2", 0, b"BBBB".to_vec()).await.unwrap();
        set.complete("t1", 4).await.unwrap();
        set.complete("t2", 4).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("dup.bin")).unwrap(), b"AAAA");
        assert_eq!(
            std::fs::read(dir.path().join("dup (1).bin")).unwrap(),
            b"BBBB"
        );
    }

    #[tokio::test]
    async fn empty_file_completes_without_chunks() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 20, tx);

        set.begin("empty.bin".into(), "t1".into(), 0, 0).await.unwrap();
        set.complete("t1", 0).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("empty.bin")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 20, tx);

        set.begin("x.bin".into(), "t1".into(), 8, 2).await.unwrap();
        let err = set.chunk("t1", 1, b"late".to_vec()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_transfer_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 20, tx);
        assert!(set.chunk("ghost", 0, vec![1]).await.is_err());
        assert!(set.complete("ghost", 0).await.is_err());
    }

    #[tokio::test]
    async fn short_byte_count_fails_completion() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 20, tx);

        set.begin("short.bin".into(), "t1".into(), 10, 1).await.unwrap();
        set.chunk("t1", 0, b"only4".to_vec()).await.unwrap();
        let err = set.complete("t1", 10).await.unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)));
        // Nothing materialised.
        assert!(!dir.path().join("short.bin").exists());
    }

    #[tokio::test]
    async fn abort_discards_partials() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = events();
        let mut set = IncomingSet::new(dir.path(), 20, tx);

        set.begin("p.bin".into(), "t1".into(), 8, 2).await.unwrap();
        set.chunk("t1", 0, b"half".to_vec()).await.unwrap();
        set.abort_all().await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
