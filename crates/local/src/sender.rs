//! The sending side of a local session.
//!
//! One listener, one session code, at most one authenticated receiver.
//! Files are streamed strictly in order; file N+1's metadata is not sent
//! until file N's `file-saved` arrived or its soft timeout expired.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamdrop_protocol::constants::SETTLE_DELAY;
use beamdrop_protocol::frames::{ControlFrame, FrameCodec, FrameEvent};
use beamdrop_protocol::progress::{ProgressThrottle, SpeedCalculator};
use beamdrop_protocol::{
    ConnectionInfo, EngineConfig, EngineEvent, SessionCode, TransferMetadata, TransferMode,
    TransferProgress,
};

use crate::handshake::{self, AcceptOutcome};
use crate::LocalError;

const READ_BUF: usize = 8 * 1024;

/// Externally visible sender lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Listener bound, no authenticated receiver. Advertising belongs on.
    Listening,
    /// One receiver authenticated, no transfer running.
    Authed,
    /// A `send_files` batch is in flight.
    Sending,
    /// `stop` ran; the session is gone for good.
    Terminated,
}

struct PeerSlot {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// One-shot rendezvous armed by `send_one` and resolved by the read
    /// pump when the receiver's `file-saved` arrives.
    pending_ack: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

/// An active sending session.
///
/// Created with [`start`](Self::start), which binds the listener and spawns
/// the accept loop. The session reports lifecycle transitions on a watch
/// channel so the supervisor can gate mDNS advertising on `Listening`.
pub struct SenderSession {
    config: EngineConfig,
    code: SessionCode,
    info: ConnectionInfo,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
    stopping: AtomicBool,
    state_tx: watch::Sender<SenderState>,
    peer: PeerSlot,
}

impl SenderSession {
    /// Binds a listener, generates the session code and starts accepting.
    ///
    /// `address` and `hostname` are display values for the returned
    /// connection info; the listener itself binds all interfaces.
    pub async fn start(
        config: EngineConfig,
        address: String,
        hostname: String,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<Self>, LocalError> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(LocalError::BindFailed)?;
        let port = listener.local_addr().map_err(LocalError::BindFailed)?.port();

        let code = SessionCode::generate()?;
        let info = ConnectionInfo {
            address,
            port,
            code: code.as_str().to_string(),
            hostname,
        };
        info!(port, code = %code, "sender listening");

        let (state_tx, _) = watch::channel(SenderState::Listening);
        let session = Arc::new(Self {
            config,
            code,
            info,
            events,
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            state_tx,
            peer: PeerSlot {
                writer: tokio::sync::Mutex::new(None),
                pending_ack: std::sync::Mutex::new(None),
            },
        });

        tokio::spawn(Arc::clone(&session).accept_loop(listener));
        Ok(session)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    pub fn state(&self) -> SenderState {
        *self.state_tx.borrow()
    }

    /// Subscribes to lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<SenderState> {
        self.state_tx.subscribe()
    }

    /// Tears the session down: advertising gate, active socket, listener.
    /// Idempotent; concurrent calls collapse into one.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping sender session");
        self.cancel.cancel();
        if let Some(mut writer) = self.peer.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.peer.pending_ack.lock().unwrap().take();
        self.state_tx.send_replace(SenderState::Terminated);
    }

    /// Streams `paths` in order to the authenticated receiver.
    ///
    /// Each file waits for its `file-saved` acknowledgement (30 s soft;
    /// on timeout the batch proceeds) before the next metadata goes out.
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<(), LocalError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(LocalError::Stopping);
        }
        if self.peer.writer.lock().await.is_none() {
            return Err(LocalError::NotConnected);
        }

        self.state_tx.send_replace(SenderState::Sending);
        let total = paths.len() as u32;

        let result = async {
            for (index, path) in paths.iter().enumerate() {
                self.send_one(path, index as u32 + 1, total).await?;
            }
            Ok(())
        }
        .await;

        // Back to AUTHED while the peer is still there; the read pump has
        // already moved us to LISTENING if it is not.
        if self.peer.writer.lock().await.is_some() && !self.stopping.load(Ordering::SeqCst) {
            self.state_tx.send_replace(SenderState::Authed);
        }

        match result {
            Ok(()) => {
                self.emit(EngineEvent::TransferComplete);
                Ok(())
            }
            // Cancellation is the caller's own doing, not a transfer error.
            Err(e @ LocalError::Stopping) => Err(e),
            Err(e) => {
                self.emit(EngineEvent::TransferError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Sends one file: metadata, payload blocks, settle, `file-end`, then
    /// the acknowledgement wait. Returns whether the ack arrived in time.
    async fn send_one(&self, path: &Path, current: u32, total: u32) -> Result<bool, LocalError> {
        let file_size = tokio::fs::metadata(path).await?.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                LocalError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path has no usable file name: {}", path.display()),
                ))
            })?
            .to_string();

        let metadata = TransferMetadata {
            file_name: file_name.clone(),
            file_size,
            current_file: current,
            total_files: total,
        };
        debug!(file = %file_name, file_size, current, total, "sending file");

        let mut writer_guard = self.peer.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(LocalError::NotConnected)?;
        handshake::write_frame(writer, &ControlFrame::Metadata { data: metadata }).await?;

        let mut file = tokio::fs::File::open(path).await?;
        let mut throttle = ProgressThrottle::new(file_size);
        let mut speed = SpeedCalculator::new();
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; self.config.chunk_size];

        loop {
            if self.cancel.is_cancelled() {
                return Err(LocalError::Stopping);
            }
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            // write_all suspends while the kernel send buffer is full; disk
            // reads stay paused until the socket drains.
            writer.write_all(&buf[..n]).await?;
            sent += n as u64;
            speed.add_sample(n as u64);

            if let Some(percent) = throttle.tick(sent) {
                self.emit_progress(&file_name, percent, sent, file_size, current, total, &speed);
            }
        }

        if sent != file_size {
            return Err(LocalError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} shrank while being read", path.display()),
            )));
        }

        // Terminating 100% tick (the loop above never runs for empty files).
        if file_size == 0 {
            self.emit_progress(&file_name, 100.0, 0, 0, current, total, &speed);
        }

        // Let the payload drain ahead of the end-marker record.
        tokio::time::sleep(SETTLE_DELAY).await;

        // Arm the rendezvous before the end marker goes out so the ack
        // cannot slip past it.
        let (ack_tx, ack_rx) = oneshot::channel();
        *self.peer.pending_ack.lock().unwrap() = Some(ack_tx);
        handshake::write_frame(writer, &ControlFrame::FileEnd).await?;
        drop(writer_guard);

        match tokio::time::timeout(self.config.ack_timeout(), ack_rx).await {
            Ok(Ok(())) => {
                debug!(file = %file_name, "file acknowledged");
                Ok(true)
            }
            Ok(Err(_)) => Err(LocalError::PeerDisconnect),
            Err(_) => {
                warn!(file = %file_name, "acknowledgement timed out, proceeding");
                self.peer.pending_ack.lock().unwrap().take();
                Ok(false)
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = listener.accept() => r,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            // One authenticated receiver at a time; latecomers are dropped
            // unanswered until the session is idle again.
            if !matches!(self.state(), SenderState::Listening) {
                debug!(%addr, "connection while busy, destroying");
                continue;
            }

            match handshake::guard_accepted(
                stream,
                &self.code,
                self.config.auth_timeout(),
                &self.cancel,
            )
            .await
            {
                AcceptOutcome::Authenticated(stream, codec) => {
                    info!(%addr, "receiver authenticated");
                    self.adopt_peer(stream, codec).await;
                }
                AcceptOutcome::Rejected => continue,
            }
        }
    }

    async fn adopt_peer(self: &Arc<Self>, stream: TcpStream, codec: FrameCodec) {
        let (read_half, write_half) = stream.into_split();
        *self.peer.writer.lock().await = Some(write_half);
        self.state_tx.send_replace(SenderState::Authed);
        self.emit(EngineEvent::ConnectionStatus {
            connected: true,
            mode: TransferMode::Sender,
        });
        tokio::spawn(Arc::clone(self).read_pump(read_half, codec));
    }

    /// Drains the authenticated receiver's control frames.
    ///
    /// The only expected inbound frame is `file-saved`; it resolves the
    /// pending rendezvous. Socket loss tears the peer state down before
    /// the session goes back to listening, so advertising never resumes
    /// over a half-dead transfer.
    async fn read_pump(self: Arc<Self>, mut read: OwnedReadHalf, mut codec: FrameCodec) {
        let mut buf = vec![0u8; READ_BUF];
        let reason = loop {
            let read_result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break "session stopped",
                r = read.read(&mut buf) => r,
            };
            match read_result {
                Ok(0) => break "peer closed the connection",
                Ok(n) => {
                    codec.push(&buf[..n]);
                    let mut failed = false;
                    loop {
                        match codec.next_event() {
                            Ok(Some(FrameEvent::Control(ControlFrame::FileSaved))) => {
                                if let Some(tx) = self.peer.pending_ack.lock().unwrap().take() {
                                    let _ = tx.send(());
                                } else {
                                    debug!("unsolicited file-saved, ignoring");
                                }
                            }
                            Ok(Some(FrameEvent::Control(frame))) => {
                                debug!(?frame, "unexpected frame from receiver, ignoring");
                            }
                            Ok(Some(FrameEvent::Payload(_))) => {
                                unreachable!("sender never arms payload mode")
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("receiver sent malformed traffic: {e}");
                                failed = true;
                                break;
                            }
                        }
                    }
                    if failed {
                        break "malformed traffic";
                    }
                }
                Err(e) => {
                    warn!("socket error: {e}");
                    break "socket error";
                }
            }
        };

        // Partial state first, then the lifecycle transition.
        if let Some(mut writer) = self.peer.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.peer.pending_ack.lock().unwrap().take();

        if !self.stopping.load(Ordering::SeqCst) {
            info!(reason, "receiver gone, back to listening");
            self.emit(EngineEvent::ConnectionLost {
                mode: TransferMode::Sender,
                reason: reason.to_string(),
            });
            self.state_tx.send_replace(SenderState::Listening);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_progress(
        &self,
        file_name: &str,
        percent: f32,
        sent: u64,
        total_bytes: u64,
        current: u32,
        total: u32,
        speed: &SpeedCalculator,
    ) {
        self.emit(EngineEvent::TransferProgress(TransferProgress {
            file_name: file_name.to_string(),
            progress: percent,
            sent_bytes: Some(sent),
            received_bytes: None,
            total_bytes,
            current_file: current,
            total_files: total,
            speed: speed.bytes_per_second(),
        }));
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_returns_ephemeral_port_and_code() {
        let (events, _rx) = mpsc::unbounded_channel();
        let session = SenderSession::start(
            EngineConfig::default(),
            "192.168.1.10".into(),
            "test-host".into(),
            events,
        )
        .await
        .unwrap();

        let info = session.connection_info();
        assert_ne!(info.port, 0);
        assert_eq!(info.address, "192.168.1.10");
        assert_eq!(info.code.len(), 7);
        assert_eq!(session.state(), SenderState::Listening);
        session.stop().await;
    }

    #[tokio::test]
    async fn send_files_without_peer_fails() {
        let (events, _rx) = mpsc::unbounded_channel();
        let session = SenderSession::start(
            EngineConfig::default(),
            "127.0.0.1".into(),
            "h".into(),
            events,
        )
        .await
        .unwrap();

        let err = session
            .send_files(&[PathBuf::from("/nonexistent")])
            .await
            .unwrap_err();
        assert!(matches!(err, LocalError::NotConnected));
        session.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_terminal() {
        let (events, _rx) = mpsc::unbounded_channel();
        let session = SenderSession::start(
            EngineConfig::default(),
            "127.0.0.1".into(),
            "h".into(),
            events,
        )
        .await
        .unwrap();

        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SenderState::Terminated);

        let err = session.send_files(&[]).await.unwrap_err();
        assert!(matches!(err, LocalError::Stopping));
    }

    #[tokio::test]
    async fn listener_port_is_reusable_after_stop() {
        let (events, _rx) = mpsc::unbounded_channel();
        let session = SenderSession::start(
            EngineConfig::default(),
            "127.0.0.1".into(),
            "h".into(),
            events,
        )
        .await
        .unwrap();
        let port = session.connection_info().port;
        session.stop().await;

        // The accept loop drops the listener on cancellation; give the
        // task a beat to observe it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let rebound = TcpListener::bind(("0.0.0.0", port)).await;
        assert!(rebound.is_ok());
    }
}
