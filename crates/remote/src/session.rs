//! One remote transfer session over a brokered channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamdrop_protocol::constants::{CHUNK_ACK_TIMEOUT, DISCONNECT_GRACE, FINAL_ACK_TIMEOUT};
use beamdrop_protocol::progress::{ProgressThrottle, SpeedCalculator};
use beamdrop_protocol::remote::new_transfer_id;
use beamdrop_protocol::{
    EngineConfig, EngineEvent, RemoteFrame, TransferMode, TransferProgress,
};

use crate::channel::PeerChannel;
use crate::receiver::IncomingSet;
use crate::RemoteError;

/// Tracks the highest acknowledged chunk count per outgoing transfer.
#[derive(Default)]
struct AckTable {
    entries: std::sync::Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl AckTable {
    fn register(&self, transfer_id: &str) -> watch::Receiver<u64> {
        let (tx, rx) = watch::channel(0);
        self.entries
            .lock()
            .unwrap()
            .insert(transfer_id.to_string(), tx);
        rx
    }

    fn record(&self, transfer_id: &str, received_chunks: u64) {
        if let Some(tx) = self.entries.lock().unwrap().get(transfer_id) {
            // ACKs may arrive duplicated; the count never moves backwards.
            tx.send_if_modified(|current| {
                if received_chunks > *current {
                    *current = received_chunks;
                    true
                } else {
                    false
                }
            });
        } else {
            debug!(transfer_id, "ack for unknown transfer, ignoring");
        }
    }

    fn forget(&self, transfer_id: &str) {
        self.entries.lock().unwrap().remove(transfer_id);
    }
}

/// A live remote session: windowed chunked sending plus streamed receiving,
/// both multiplexed over one [`PeerChannel`].
pub struct RemoteSession {
    channel: Arc<PeerChannel>,
    config: EngineConfig,
    mode: TransferMode,
    events: mpsc::UnboundedSender<EngineEvent>,
    acks: Arc<AckTable>,
    cancel: CancellationToken,
    /// Serialises outgoing batches; one `send_files` at a time.
    send_gate: Mutex<()>,
}

impl RemoteSession {
    /// Adopts a connected channel and starts the inbound dispatch pump.
    pub fn new(
        channel: PeerChannel,
        save_dir: &Path,
        mode: TransferMode,
        config: EngineConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<Self> {
        let channel = Arc::new(channel);
        let session = Arc::new(Self {
            channel: Arc::clone(&channel),
            config: config.clone(),
            mode,
            events: events.clone(),
            acks: Arc::new(AckTable::default()),
            cancel: CancellationToken::new(),
            send_gate: Mutex::new(()),
        });

        let incoming = IncomingSet::new(save_dir, config.window_size, events);
        tokio::spawn(Arc::clone(&session).dispatch_pump(incoming));

        let _ = session.events.send(EngineEvent::ConnectionStatus {
            connected: true,
            mode,
        });
        session
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.channel.is_closed()
    }

    /// Sends `paths` in order, each under a fresh transfer id.
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<(), RemoteError> {
        let _gate = self.send_gate.lock().await;
        if self.is_closed() {
            return Err(RemoteError::ChannelClosed);
        }

        let total = paths.len() as u32;
        for (index, path) in paths.iter().enumerate() {
            self.send_one(path, index as u32 + 1, total).await?;
        }
        let _ = self.events.send(EngineEvent::TransferComplete);
        Ok(())
    }

    async fn send_one(&self, path: &Path, current: u32, total: u32) -> Result<(), RemoteError> {
        let file_size = tokio::fs::metadata(path).await?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                RemoteError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path has no usable file name: {}", path.display()),
                ))
            })?
            .to_string();

        let chunk_size = self.config.remote_chunk_size as u64;
        let total_chunks = file_size.div_ceil(chunk_size);
        let transfer_id = new_transfer_id();
        let window = self.config.window_size;

        debug!(file = %file_name, transfer_id = %transfer_id, total_chunks, "remote send starting");
        let mut acks = self.acks.register(&transfer_id);

        let result = async {
            self.channel
                .send(RemoteFrame::FileMeta {
                    file_name: file_name.clone(),
                    transfer_id: transfer_id.clone(),
                    file_size,
                    total_chunks,
                })
                .await?;

            let mut file = tokio::fs::File::open(path).await?;
            let mut throttle = ProgressThrottle::new(file_size);
            let mut speed = SpeedCalculator::new();
            let mut sent: u64 = 0;
            let mut buf = vec![0u8; chunk_size as usize];

            for chunk_index in 0..total_chunks {
                if self.is_closed() {
                    return Err(RemoteError::ChannelClosed);
                }

                // Sliding window: chunk i waits for receivedChunks >= i - W.
                if chunk_index >= window {
                    let floor = chunk_index - window;
                    let waited = tokio::time::timeout(
                        CHUNK_ACK_TIMEOUT,
                        acks.wait_for(|count| *count >= floor),
                    )
                    .await;
                    match waited {
                        Ok(Ok(_)) => {}
                        Ok(Err(_)) => return Err(RemoteError::ChannelClosed),
                        Err(_) => {
                            // Soft: log and keep going rather than stall the
                            // whole batch on one missing ack.
                            warn!(
                                file = %file_name,
                                chunk_index,
                                "window ack wait timed out, continuing"
                            );
                        }
                    }
                }

                let want = (file_size - sent).min(chunk_size) as usize;
                file.read_exact(&mut buf[..want]).await?;
                self.channel
                    .send(RemoteFrame::FileChunk {
                        transfer_id: transfer_id.clone(),
                        chunk_index,
                        chunk: buf[..want].to_vec(),
                    })
                    .await?;
                sent += want as u64;
                speed.add_sample(want as u64);

                if let Some(percent) = throttle.tick(sent) {
                    let _ = self
                        .events
                        .send(EngineEvent::TransferProgress(TransferProgress {
                            file_name: file_name.clone(),
                            progress: percent,
                            sent_bytes: Some(sent),
                            received_bytes: None,
                            total_bytes: file_size,
                            current_file: current,
                            total_files: total,
                            speed: speed.bytes_per_second(),
                        }));
                }
            }

            if file_size == 0 {
                let _ = self
                    .events
                    .send(EngineEvent::TransferProgress(TransferProgress {
                        file_name: file_name.clone(),
                        progress: 100.0,
                        sent_bytes: Some(0),
                        received_bytes: None,
                        total_bytes: 0,
                        current_file: current,
                        total_files: total,
                        speed: None,
                    }));
            }

            // Final ACK, then the completion record. The wait is soft.
            let final_wait = tokio::time::timeout(
                FINAL_ACK_TIMEOUT,
                acks.wait_for(|count| *count >= total_chunks),
            )
            .await;
            match final_wait {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => return Err(RemoteError::ChannelClosed),
                Err(_) => warn!(file = %file_name, "final ack wait timed out, continuing"),
            }

            self.channel
                .send(RemoteFrame::FileComplete {
                    transfer_id: transfer_id.clone(),
                    file_size,
                })
                .await?;
            Ok(())
        }
        .await;

        self.acks.forget(&transfer_id);
        result
    }

    /// Announces the disconnect, allows in-flight records a short grace to
    /// flush, then closes the channel.
    pub async fn disconnect(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self
            .channel
            .send(RemoteFrame::DisconnectRequest {
                reason: reason.to_string(),
                mode: self.mode,
            })
            .await;
        tokio::time::sleep(DISCONNECT_GRACE).await;
        self.shutdown();
    }

    /// Closes the channel and stops the pump without the farewell record.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.channel.close();
    }

    /// Routes inbound records: data records feed the incoming set, ACKs
    /// feed the ack table, `disconnect-request` ends the session.
    async fn dispatch_pump(self: Arc<Self>, mut incoming: IncomingSet) {
        let reason = loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break "session shut down".to_string(),
                f = self.channel.recv() => f,
            };
            let Some(frame) = frame else {
                break "channel closed".to_string();
            };

            let handled = match frame {
                RemoteFrame::FileMeta {
                    file_name,
                    transfer_id,
                    file_size,
                    total_chunks,
                } => {
                    incoming
                        .begin(file_name, transfer_id, file_size, total_chunks)
                        .await
                }
                RemoteFrame::FileChunk {
                    transfer_id,
                    chunk_index,
                    chunk,
                } => match incoming.chunk(&transfer_id, chunk_index, chunk).await {
                    Ok(Some(ack)) => self.channel.send(ack).await,
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                },
                RemoteFrame::ChunkAck {
                    transfer_id,
                    received_chunks,
                } => {
                    self.acks.record(&transfer_id, received_chunks);
                    Ok(())
                }
                RemoteFrame::FileComplete {
                    transfer_id,
                    file_size,
                } => incoming.complete(&transfer_id, file_size).await,
                RemoteFrame::DisconnectRequest { reason, mode } => {
                    info!(%reason, %mode, "peer requested disconnect");
                    tokio::time::sleep(DISCONNECT_GRACE).await;
                    break reason;
                }
            };

            if let Err(e) = handled {
                warn!("remote record handling failed: {e}");
                let _ = self.events.send(EngineEvent::TransferError {
                    message: e.to_string(),
                });
            }
        };

        incoming.abort_all().await;
        self.channel.close();
        self.cancel.cancel();
        let _ = self.events.send(EngineEvent::ConnectionLost {
            mode: self.mode,
            reason,
        });
        let _ = self.events.send(EngineEvent::ConnectionStatus {
            connected: false,
            mode: self.mode,
        });
    }
}
