//! End-to-end local-mode transfers over loopback TCP.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use beamdrop_local::{connect_to_sender, LocalError, SenderSession, SenderState};
use beamdrop_protocol::frames::{encode_control, ControlFrame, FrameCodec, FrameEvent};
use beamdrop_protocol::{EngineConfig, EngineEvent};

const EVENT_WAIT: Duration = Duration::from_secs(10);

type Events = mpsc::UnboundedReceiver<EngineEvent>;

async fn start_sender() -> (std::sync::Arc<SenderSession>, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = SenderSession::start(
        EngineConfig::default(),
        "127.0.0.1".into(),
        "test-sender".into(),
        tx,
    )
    .await
    .unwrap();
    (session, rx)
}

async fn next_event(rx: &mut Events) -> EngineEvent {
    tokio::time::timeout(EVENT_WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_for_state(session: &SenderSession, state: SenderState) {
    let mut watch = session.watch_state();
    tokio::time::timeout(EVENT_WAIT, watch.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for sender state")
        .unwrap();
}

fn write_source_file(dir: &std::path::Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
    // Deterministic non-trivial content, including zero bytes, so framing
    // bugs cannot hide.
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

#[tokio::test]
async fn wrong_code_is_rejected_and_sender_keeps_listening() {
    let (session, _sender_events) = start_sender().await;
    let info = session.connection_info();
    assert_ne!(info.code, "ABC-DEF");

    let (rx_tx, _rx_events) = mpsc::unbounded_channel();
    let save = tempfile::tempdir().unwrap();
    let err = connect_to_sender("127.0.0.1", info.port, "ABC-DEF", save.path(), rx_tx)
        .await
        .unwrap_err();

    assert!(matches!(err, LocalError::InvalidCode));
    assert_eq!(session.state(), SenderState::Listening);

    // The session survives and still accepts the right code.
    let (rx_tx, _rx_events) = mpsc::unbounded_channel();
    let connection = connect_to_sender("127.0.0.1", info.port, &info.code, save.path(), rx_tx)
        .await
        .unwrap();
    wait_for_state(&session, SenderState::Authed).await;
    connection.disconnect();
    session.stop().await;
}

#[tokio::test]
async fn empty_file_transfers_and_completes() {
    let (session, mut sender_events) = start_sender().await;
    let info = session.connection_info();

    let src = tempfile::tempdir().unwrap();
    let save = tempfile::tempdir().unwrap();
    let (path, _) = write_source_file(src.path(), "empty.bin", 0);

    let (rx_tx, mut rx_events) = mpsc::unbounded_channel();
    let connection = connect_to_sender("127.0.0.1", info.port, &info.code, save.path(), rx_tx)
        .await
        .unwrap();
    wait_for_state(&session, SenderState::Authed).await;

    session.send_files(&[path]).await.unwrap();

    // Receiver materialised a zero-byte file.
    let received = loop {
        match next_event(&mut rx_events).await {
            EngineEvent::FileReceived {
                file_name,
                file_size,
                save_path,
                ..
            } => break (file_name, file_size, save_path),
            _ => continue,
        }
    };
    assert_eq!(received.0, "empty.bin");
    assert_eq!(received.1, 0);
    assert_eq!(std::fs::read(&received.2).unwrap().len(), 0);

    // Sender saw the ack and finished the batch.
    loop {
        match next_event(&mut sender_events).await {
            EngineEvent::TransferComplete => break,
            _ => continue,
        }
    }

    connection.disconnect();
    session.stop().await;
}

#[tokio::test]
async fn multi_file_batch_is_byte_identical_and_ordered() {
    let (session, mut sender_events) = start_sender().await;
    let info = session.connection_info();

    let src = tempfile::tempdir().unwrap();
    let save = tempfile::tempdir().unwrap();
    let (p1, d1) = write_source_file(src.path(), "a", 100);
    let (p2, d2) = write_source_file(src.path(), "b", 1_048_576);
    let (p3, d3) = write_source_file(src.path(), "c", 10_485_760);

    // Pre-existing "a" forces the collision rename.
    std::fs::write(save.path().join("a"), b"previous tenant").unwrap();

    let (rx_tx, mut rx_events) = mpsc::unbounded_channel();
    let connection = connect_to_sender("127.0.0.1", info.port, &info.code, save.path(), rx_tx)
        .await
        .unwrap();
    wait_for_state(&session, SenderState::Authed).await;

    session.send_files(&[p1, p2, p3]).await.unwrap();

    // Collect receiver events until all three files landed; check ordering
    // and per-file monotone progress along the way.
    let mut received = Vec::new();
    let mut last_progress: Option<(String, f32)> = None;
    while received.len() < 3 {
        match next_event(&mut rx_events).await {
            EngineEvent::FileReceived {
                file_name,
                save_path,
                current_file,
                ..
            } => received.push((file_name, save_path, current_file)),
            EngineEvent::TransferProgress(p) => {
                if let Some((ref name, last)) = last_progress {
                    if *name == p.file_name {
                        assert!(p.progress >= last, "progress went backwards");
                    }
                }
                last_progress = Some((p.file_name.clone(), p.progress));
            }
            EngineEvent::ConnectionStatus { .. } => {}
            other => panic!("unexpected receiver event {other:?}"),
        }
    }

    assert_eq!(
        received.iter().map(|r| r.2).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(received[0].0, "a");
    assert_eq!(received[0].1, save.path().join("a (1)"));
    assert_eq!(std::fs::read(&received[0].1).unwrap(), d1);
    assert_eq!(std::fs::read(&received[1].1).unwrap(), d2);
    assert_eq!(std::fs::read(&received[2].1).unwrap(), d3);

    // Untouched pre-existing file.
    assert_eq!(
        std::fs::read(save.path().join("a")).unwrap(),
        b"previous tenant"
    );

    loop {
        match next_event(&mut sender_events).await {
            EngineEvent::TransferComplete => break,
            _ => continue,
        }
    }

    connection.disconnect();
    session.stop().await;
}

#[tokio::test]
async fn sender_progress_reaches_hundred_percent() {
    let (session, mut sender_events) = start_sender().await;
    let info = session.connection_info();

    let src = tempfile::tempdir().unwrap();
    let save = tempfile::tempdir().unwrap();
    let (path, _) = write_source_file(src.path(), "big.bin", 2_000_000);

    let (rx_tx, _rx_events) = mpsc::unbounded_channel();
    let connection = connect_to_sender("127.0.0.1", info.port, &info.code, save.path(), rx_tx)
        .await
        .unwrap();
    wait_for_state(&session, SenderState::Authed).await;

    session.send_files(&[path]).await.unwrap();

    let mut max_progress = 0.0f32;
    loop {
        match next_event(&mut sender_events).await {
            EngineEvent::TransferProgress(p) => {
                assert!(p.progress >= max_progress);
                max_progress = p.progress;
            }
            EngineEvent::TransferComplete => break,
            _ => continue,
        }
    }
    assert_eq!(max_progress, 100.0);

    connection.disconnect();
    session.stop().await;
}

/// A hand-rolled receiver that authenticates, then abandons the transfer
/// partway through the payload.
#[tokio::test]
async fn receiver_vanishing_mid_transfer_returns_sender_to_listening() {
    let (session, mut sender_events) = start_sender().await;
    let info = session.connection_info();

    let src = tempfile::tempdir().unwrap();
    let (path, _) = write_source_file(src.path(), "big.bin", 10_485_760);

    // Raw-socket handshake.
    let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", info.port))
        .await
        .unwrap();
    socket
        .write_all(&encode_control(&ControlFrame::Auth {
            code: info.code.clone(),
        }).unwrap())
        .await
        .unwrap();

    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 4096];
    'auth: loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "sender closed during handshake");
        codec.push(&buf[..n]);
        while let Some(ev) = codec.next_event().unwrap() {
            if matches!(ev, FrameEvent::Control(ControlFrame::AuthSuccess)) {
                break 'auth;
            }
        }
    }
    wait_for_state(&session, SenderState::Authed).await;

    // Start the batch, swallow roughly half the payload, then vanish.
    let sender = session.clone();
    let batch = tokio::spawn(async move { sender.send_files(&[path]).await });

    let mut swallowed = 0usize;
    while swallowed < 5_000_000 {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        swallowed += n;
    }
    drop(socket);

    let result = batch.await.unwrap();
    assert!(result.is_err(), "batch should fail on peer loss");

    // The sender reported the loss and went back to listening only after
    // tearing the peer state down.
    let mut saw_lost = false;
    while let Ok(Some(ev)) = tokio::time::timeout(EVENT_WAIT, sender_events.recv()).await {
        if matches!(ev, EngineEvent::ConnectionLost { .. }) {
            saw_lost = true;
            break;
        }
    }
    assert!(saw_lost);
    wait_for_state(&session, SenderState::Listening).await;

    session.stop().await;
}

/// Drives the sender with a scripted peer to pin the wire format: metadata,
/// exact-length payload, file-end, then the ack.
#[tokio::test]
async fn wire_sequence_is_metadata_payload_end() {
    let (session, _sender_events) = start_sender().await;
    let info = session.connection_info();

    let src = tempfile::tempdir().unwrap();
    let payload_len = 70_000; // spans two 64 KiB blocks
    let (path, data) = write_source_file(src.path(), "wire.bin", payload_len);

    let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", info.port))
        .await
        .unwrap();
    socket
        .write_all(&encode_control(&ControlFrame::Auth {
            code: info.code.clone(),
        }).unwrap())
        .await
        .unwrap();

    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 8192];
    let mut payload = Vec::new();
    let mut saw_metadata = false;
    let mut saw_auth = false;

    let sender = session.clone();
    let batch = tokio::spawn(async move { sender.send_files(&[path]).await });

    'wire: loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "sender closed early");
        codec.push(&buf[..n]);
        while let Some(ev) = codec.next_event().unwrap() {
            match ev {
                FrameEvent::Control(ControlFrame::AuthSuccess) => saw_auth = true,
                FrameEvent::Control(ControlFrame::Metadata { data }) => {
                    assert!(saw_auth);
                    assert_eq!(data.file_name, "wire.bin");
                    assert_eq!(data.file_size, payload_len as u64);
                    assert_eq!((data.current_file, data.total_files), (1, 1));
                    saw_metadata = true;
                    codec.expect_payload(data.file_size);
                }
                FrameEvent::Payload(chunk) => payload.extend(chunk),
                FrameEvent::Control(ControlFrame::FileEnd) => {
                    assert!(saw_metadata);
                    assert_eq!(payload, data, "payload must be byte-exact");
                    break 'wire;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    // Acknowledge so the batch resolves without the 30 s soft timeout.
    socket
        .write_all(&encode_control(&ControlFrame::FileSaved).unwrap())
        .await
        .unwrap();
    batch.await.unwrap().unwrap();

    session.stop().await;
}
