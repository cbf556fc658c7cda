//! The receiving side of a local session.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamdrop_file_ops::SpoolFile;
use beamdrop_protocol::constants::AUTH_TIMEOUT;
use beamdrop_protocol::frames::{ControlFrame, FrameCodec, FrameEvent};
use beamdrop_protocol::progress::{ProgressThrottle, SpeedCalculator};
use beamdrop_protocol::{
    EngineEvent, SessionCode, TransferMetadata, TransferMode, TransferProgress,
};

use crate::handshake;
use crate::LocalError;

const READ_BUF: usize = 64 * 1024;

/// Connect timeout; resolution and TCP setup both count against it.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A live authenticated connection to a sender.
///
/// The receive loop runs in a background task; [`disconnect`] is idempotent
/// and [`wait`] surfaces the loop's outcome.
///
/// [`disconnect`]: Self::disconnect
/// [`wait`]: Self::wait
#[derive(Debug)]
pub struct ReceiverConnection {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), LocalError>>,
}

impl ReceiverConnection {
    /// Destroys the socket and stops the receive loop. Safe to call any
    /// number of times.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the receive loop to end and returns how it ended.
    pub async fn wait(self) -> Result<(), LocalError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(LocalError::Io(io::Error::other(e))),
        }
    }
}

/// Connects to a sender, authenticates with `code` and starts receiving
/// files into `save_dir`.
pub async fn connect_to_sender(
    address: &str,
    port: u16,
    code: &str,
    save_dir: &Path,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> Result<ReceiverConnection, LocalError> {
    let code = SessionCode::parse(code)?;
    let stream = connect(address, port).await?;

    let (stream, codec) = handshake::authenticate_outbound(stream, &code, AUTH_TIMEOUT).await?;
    info!(address, port, "authenticated to sender");
    let _ = events.send(EngineEvent::ConnectionStatus {
        connected: true,
        mode: TransferMode::Receiver,
    });

    let cancel = CancellationToken::new();
    let task = tokio::spawn(receive_loop(
        stream,
        codec,
        save_dir.to_path_buf(),
        events,
        cancel.clone(),
    ));

    Ok(ReceiverConnection { cancel, task })
}

async fn connect(address: &str, port: u16) -> Result<TcpStream, LocalError> {
    let target = format!("{address}:{port}");
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|_| LocalError::HostNotFound(address.to_string()))?
        .collect();
    if resolved.is_empty() {
        return Err(LocalError::HostNotFound(address.to_string()));
    }

    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&resolved[..])).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Err(LocalError::ConnectRefused)
        }
        Ok(Err(e)) => Err(LocalError::Io(e)),
        Err(_) => Err(LocalError::Timeout),
    }
}

/// Per-file receive state.
enum Phase {
    /// Between files; only `metadata` is legal.
    AwaitMetadata,
    /// Draining exactly `file_size` payload bytes into the spool.
    Streaming {
        meta: TransferMetadata,
        spool: SpoolFile,
        throttle: ProgressThrottle,
        speed: SpeedCalculator,
    },
    /// All payload received; only `file-end` is legal.
    AwaitFileEnd {
        meta: TransferMetadata,
        spool: SpoolFile,
    },
}

impl Phase {
    fn discard_partial(self) -> Option<SpoolFile> {
        match self {
            Phase::AwaitMetadata => None,
            Phase::Streaming { spool, .. } | Phase::AwaitFileEnd { spool, .. } => Some(spool),
        }
    }
}

async fn receive_loop(
    mut stream: TcpStream,
    mut codec: FrameCodec,
    save_dir: PathBuf,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
) -> Result<(), LocalError> {
    let mut phase = Phase::AwaitMetadata;
    let mut buf = vec![0u8; READ_BUF];

    let outcome = loop {
        let read_result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("receiver disconnect requested");
                break Ok(false);
            }
            r = stream.read(&mut buf) => r,
        };

        let n = match read_result {
            Ok(0) => {
                // Clean close only between files; mid-payload it is a
                // truncation (I3 would be violated by materialising).
                break match codec.finish() {
                    Ok(()) => Ok(true),
                    Err(e) => Err(LocalError::from(e)),
                };
            }
            Ok(n) => n,
            Err(e) => break Err(LocalError::from(e)),
        };
        codec.push(&buf[..n]);

        match drain_events(&mut stream, &mut codec, &mut phase, &save_dir, &events).await {
            Ok(()) => {}
            Err(e) => break Err(e),
        }
    };

    // Never leave a half-written spool behind.
    if let Some(spool) = std::mem::replace(&mut phase, Phase::AwaitMetadata).discard_partial() {
        spool.discard().await;
    }

    match outcome {
        Ok(peer_closed) => {
            if peer_closed {
                let _ = events.send(EngineEvent::ConnectionLost {
                    mode: TransferMode::Receiver,
                    reason: "peer closed the connection".into(),
                });
            }
            let _ = events.send(EngineEvent::ConnectionStatus {
                connected: false,
                mode: TransferMode::Receiver,
            });
            Ok(())
        }
        Err(e) => {
            warn!("receive loop failed: {e}");
            let _ = events.send(EngineEvent::TransferError {
                message: e.to_string(),
            });
            let _ = events.send(EngineEvent::ConnectionLost {
                mode: TransferMode::Receiver,
                reason: e.to_string(),
            });
            Err(e)
        }
    }
}

/// Applies every decoded item currently in the codec to the phase machine.
async fn drain_events(
    stream: &mut TcpStream,
    codec: &mut FrameCodec,
    phase: &mut Phase,
    save_dir: &Path,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<(), LocalError> {
    loop {
        let event = match codec.next_event()? {
            Some(ev) => ev,
            None => return Ok(()),
        };

        let current = std::mem::replace(phase, Phase::AwaitMetadata);
        *phase = match (current, event) {
            (Phase::AwaitMetadata, FrameEvent::Control(ControlFrame::Metadata { data })) => {
                begin_file(codec, save_dir, events, data).await?
            }

            (
                Phase::Streaming {
                    meta,
                    mut spool,
                    mut throttle,
                    mut speed,
                },
                FrameEvent::Payload(chunk),
            ) => {
                spool.write(&chunk).await?;
                speed.add_sample(chunk.len() as u64);
                let received = spool.bytes_written();
                if let Some(percent) = throttle.tick(received) {
                    let _ = events.send(EngineEvent::TransferProgress(TransferProgress {
                        file_name: meta.file_name.clone(),
                        progress: percent,
                        sent_bytes: None,
                        received_bytes: Some(received),
                        total_bytes: meta.file_size,
                        current_file: meta.current_file,
                        total_files: meta.total_files,
                        speed: speed.bytes_per_second(),
                    }));
                }

                if received == meta.file_size {
                    Phase::AwaitFileEnd { meta, spool }
                } else {
                    Phase::Streaming {
                        meta,
                        spool,
                        throttle,
                        speed,
                    }
                }
            }

            (Phase::AwaitFileEnd { meta, spool }, FrameEvent::Control(ControlFrame::FileEnd)) => {
                finish_file(stream, events, meta, spool).await?
            }

            (_, FrameEvent::Control(ControlFrame::Error { message })) => {
                return Err(LocalError::RemoteError(message));
            }

            (phase_before, event) => {
                let expected = match &phase_before {
                    Phase::AwaitMetadata => "metadata",
                    Phase::Streaming { .. } => "payload",
                    Phase::AwaitFileEnd { .. } => "file-end",
                };
                if let Some(spool) = phase_before.discard_partial() {
                    spool.discard().await;
                }
                return Err(LocalError::ProtocolViolation {
                    expected,
                    got: frame_label(&event),
                });
            }
        };
    }
}

async fn begin_file(
    codec: &mut FrameCodec,
    save_dir: &Path,
    events: &mpsc::UnboundedSender<EngineEvent>,
    meta: TransferMetadata,
) -> Result<Phase, LocalError> {
    if !meta.is_valid() {
        return Err(LocalError::ProtocolViolation {
            expected: "metadata within file-count bounds",
            got: "metadata",
        });
    }
    debug!(
        file = %meta.file_name,
        size = meta.file_size,
        current = meta.current_file,
        total = meta.total_files,
        "file announced"
    );

    let spool = SpoolFile::create(save_dir, &meta.file_name).await?;
    codec.expect_payload(meta.file_size);

    let throttle = ProgressThrottle::new(meta.file_size);
    let _ = events.send(EngineEvent::TransferProgress(TransferProgress {
        file_name: meta.file_name.clone(),
        progress: 0.0,
        sent_bytes: None,
        received_bytes: Some(0),
        total_bytes: meta.file_size,
        current_file: meta.current_file,
        total_files: meta.total_files,
        speed: None,
    }));

    Ok(if meta.file_size == 0 {
        Phase::AwaitFileEnd { meta, spool }
    } else {
        Phase::Streaming {
            meta,
            spool,
            throttle,
            speed: SpeedCalculator::new(),
        }
    })
}

async fn finish_file(
    stream: &mut TcpStream,
    events: &mpsc::UnboundedSender<EngineEvent>,
    meta: TransferMetadata,
    spool: SpoolFile,
) -> Result<Phase, LocalError> {
    let save_path = spool.finalize().await?;
    info!(file = %meta.file_name, path = %save_path.display(), "file received");

    let _ = events.send(EngineEvent::FileReceived {
        file_name: meta.file_name.clone(),
        file_size: meta.file_size,
        save_path,
        current_file: meta.current_file,
        total_files: meta.total_files,
    });

    // The durable write happened above; only now may the ack go out.
    handshake::write_frame(stream, &ControlFrame::FileSaved).await?;
    Ok(Phase::AwaitMetadata)
}

fn frame_label(event: &FrameEvent) -> &'static str {
    match event {
        FrameEvent::Payload(_) => "payload",
        FrameEvent::Control(ControlFrame::Auth { .. }) => "auth",
        FrameEvent::Control(ControlFrame::AuthSuccess) => "auth-success",
        FrameEvent::Control(ControlFrame::Error { .. }) => "error",
        FrameEvent::Control(ControlFrame::Metadata { .. }) => "metadata",
        FrameEvent::Control(ControlFrame::FileEnd) => "file-end",
        FrameEvent::Control(ControlFrame::FileSaved) => "file-saved",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_refused_when_nobody_listens() {
        let (events, _rx) = mpsc::unbounded_channel();
        // Bind-then-drop to find a port that is closed right now.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let dir = tempfile::tempdir().unwrap();

        let err = connect_to_sender("127.0.0.1", port, "AB1-2C3", dir.path(), events)
            .await
            .unwrap_err();
        assert!(matches!(err, LocalError::ConnectRefused));
    }

    #[tokio::test]
    async fn unresolvable_host_surfaces_host_not_found() {
        let (events, _rx) = mpsc::unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let err = connect_to_sender(
            "host.invalid.beamdrop.test",
            9,
            "AB1-2C3",
            dir.path(),
            events,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LocalError::HostNotFound(_)));
    }

    #[tokio::test]
    async fn bad_code_string_rejected_before_connecting() {
        let (events, _rx) = mpsc::unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let err = connect_to_sender("127.0.0.1", 1, "not a code", dir.path(), events)
            .await
            .unwrap_err();
        assert!(matches!(err, LocalError::Code(_)));
    }
}
