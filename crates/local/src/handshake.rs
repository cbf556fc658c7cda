//! Code authentication on a fresh TCP connection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use beamdrop_protocol::frames::{
    encode_control, ControlFrame, FrameCodec, FrameEvent, INVALID_CODE_MESSAGE,
};
use beamdrop_protocol::SessionCode;

use crate::LocalError;

const READ_BUF: usize = 8 * 1024;

/// Result of guarding an accepted socket.
pub(crate) enum AcceptOutcome {
    /// Code matched; `auth-success` has been written. The codec carries any
    /// bytes that followed the auth record.
    Authenticated(TcpStream, FrameCodec),
    /// Wrong code, deadline expiry, malformed traffic or socket loss. The
    /// socket has been destroyed; keep listening.
    Rejected,
}

/// Sender side: waits up to `deadline` for a matching `auth` record.
///
/// Frames other than `auth` arriving before authentication are ignored.
/// A wrong code gets an `error` record before the socket is destroyed; the
/// listener session itself stays up either way.
pub(crate) async fn guard_accepted(
    mut stream: TcpStream,
    code: &SessionCode,
    deadline: Duration,
    cancel: &CancellationToken,
) -> AcceptOutcome {
    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; READ_BUF];

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return AcceptOutcome::Rejected,
        r = tokio::time::timeout(deadline, async {
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(n) => n,
                };
                codec.push(&buf[..n]);
                loop {
                    match codec.next_event() {
                        Ok(Some(FrameEvent::Control(ControlFrame::Auth { code }))) => {
                            return Some(code);
                        }
                        Ok(Some(FrameEvent::Control(other))) => {
                            debug!(frame = ?other, "ignoring pre-auth frame");
                        }
                        Ok(Some(FrameEvent::Payload(_))) => unreachable!("payload never armed"),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("malformed traffic before auth: {e}");
                            return None;
                        }
                    }
                }
            }
        }) => r,
    };

    match result {
        Err(_) => {
            debug!("authentication deadline expired, destroying socket");
            AcceptOutcome::Rejected
        }
        Ok(None) => AcceptOutcome::Rejected,
        Ok(Some(submitted)) => {
            if code.matches(&submitted) {
                match write_frame(&mut stream, &ControlFrame::AuthSuccess).await {
                    Ok(()) => AcceptOutcome::Authenticated(stream, codec),
                    Err(e) => {
                        warn!("failed to confirm authentication: {e}");
                        AcceptOutcome::Rejected
                    }
                }
            } else {
                debug!("invalid connection code submitted");
                let _ = write_frame(
                    &mut stream,
                    &ControlFrame::Error {
                        message: INVALID_CODE_MESSAGE.into(),
                    },
                )
                .await;
                AcceptOutcome::Rejected
            }
        }
    }
}

/// Receiver side: submits the code and waits for the verdict.
///
/// Returns the stream plus the codec holding any bytes the sender pushed
/// right after `auth-success`.
pub(crate) async fn authenticate_outbound(
    mut stream: TcpStream,
    code: &SessionCode,
    deadline: Duration,
) -> Result<(TcpStream, FrameCodec), LocalError> {
    write_frame(
        &mut stream,
        &ControlFrame::Auth {
            code: code.as_str().into(),
        },
    )
    .await?;

    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; READ_BUF];

    let verdict = tokio::time::timeout(deadline, async {
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(LocalError::PeerDisconnect);
            }
            codec.push(&buf[..n]);
            match codec.next_event()? {
                Some(FrameEvent::Control(ControlFrame::AuthSuccess)) => return Ok(()),
                Some(FrameEvent::Control(ControlFrame::Error { message })) => {
                    return Err(if message == INVALID_CODE_MESSAGE {
                        LocalError::InvalidCode
                    } else {
                        LocalError::RemoteError(message)
                    });
                }
                Some(FrameEvent::Control(other)) => {
                    debug!(frame = ?other, "ignoring frame while awaiting verdict");
                }
                Some(FrameEvent::Payload(_)) => unreachable!("payload never armed"),
                None => {}
            }
        }
    })
    .await
    .map_err(|_| LocalError::Timeout)?;

    verdict?;
    Ok((stream, codec))
}

pub(crate) async fn write_frame(
    stream: &mut (impl AsyncWriteExt + Unpin),
    frame: &ControlFrame,
) -> Result<(), LocalError> {
    let bytes = encode_control(frame)?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
