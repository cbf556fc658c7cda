//! The engine façade owned by the host application.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use beamdrop_discovery::{browse, lan_ipv4, local_hostname, DiscoveredService};
use beamdrop_local::{connect_to_sender, ReceiverConnection, SenderSession};
use beamdrop_protocol::{ConnectionInfo, EngineConfig, EngineEvent, TransferMode};
use beamdrop_remote::{PeerChannel, RemoteSession};

use crate::advertise::advertise_while_listening;
use crate::EngineError;

#[derive(Default)]
struct Slots {
    sender: Option<Arc<SenderSession>>,
    advertise_task: Option<JoinHandle<()>>,
    receiver: Option<ReceiverConnection>,
    remote: Option<Arc<RemoteSession>>,
}

/// Process-wide owner of every session resource.
///
/// All operations are safe to call in any order; `shutdown` wins over
/// everything and deduplicates concurrent calls.
pub struct Engine {
    config: EngineConfig,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    slots: tokio::sync::Mutex<Slots>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Creates an engine and the event stream the host subscribes to.
    pub fn new(config: EngineConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                events_tx,
                slots: tokio::sync::Mutex::new(Slots::default()),
                shut_down: AtomicBool::new(false),
            }),
            events_rx,
        )
    }

    /// Starts the local sender: listener, code, advertising.
    ///
    /// Only one session may be active at a time.
    pub async fn start_sender(&self) -> Result<ConnectionInfo, EngineError> {
        self.ensure_running()?;
        let mut slots = self.slots.lock().await;
        if slots.sender.is_some() || slots.remote.is_some() {
            return Err(EngineError::SessionActive);
        }

        let hostname = local_hostname();
        let address = lan_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".into());

        let session = SenderSession::start(
            self.config.clone(),
            address,
            hostname.clone(),
            self.events_tx.clone(),
        )
        .await?;

        let info = session.connection_info();
        slots.advertise_task = Some(tokio::spawn(advertise_while_listening(
            session.watch_state(),
            hostname,
            info.port,
        )));
        slots.sender = Some(session);
        Ok(info)
    }

    /// Stops the sender session, its advertising and its listener.
    /// Idempotent.
    pub async fn stop_sender(&self) {
        let mut slots = self.slots.lock().await;
        if let Some(session) = slots.sender.take() {
            session.stop().await;
        }
        // The gate task exits on its own once it sees Terminated; dropping
        // the handle just detaches it.
        slots.advertise_task.take();
    }

    /// Browses the local link for senders over the configured window.
    pub async fn discover(&self) -> Vec<DiscoveredService> {
        browse(self.config.discovery_window()).await
    }

    /// Connects to a discovered sender and starts receiving into
    /// `save_dir`.
    pub async fn connect_to_sender(
        &self,
        address: &str,
        port: u16,
        code: &str,
        save_dir: &Path,
    ) -> Result<(), EngineError> {
        self.ensure_running()?;
        let mut slots = self.slots.lock().await;
        if slots.receiver.as_ref().is_some_and(|r| !r.is_finished()) {
            return Err(EngineError::SessionActive);
        }

        let connection =
            connect_to_sender(address, port, code, save_dir, self.events_tx.clone()).await?;
        slots.receiver = Some(connection);
        Ok(())
    }

    /// Destroys the receiver socket. Idempotent.
    pub async fn disconnect_receiver(&self) {
        let slots = self.slots.lock().await;
        if let Some(connection) = slots.receiver.as_ref() {
            connection.disconnect();
        }
    }

    /// Adopts a channel the rendezvous collaborator connected and opens a
    /// remote session on it.
    pub async fn open_remote(
        &self,
        channel: PeerChannel,
        peer_id: &str,
        save_dir: &Path,
        mode: TransferMode,
    ) -> Result<ConnectionInfo, EngineError> {
        self.ensure_running()?;
        let mut slots = self.slots.lock().await;
        if slots.sender.is_some() || slots.remote.as_ref().is_some_and(|r| !r.is_closed()) {
            return Err(EngineError::SessionActive);
        }

        let session = RemoteSession::new(
            channel,
            save_dir,
            mode,
            self.config.clone(),
            self.events_tx.clone(),
        );
        slots.remote = Some(session);
        info!(peer_id, "remote session open");
        Ok(ConnectionInfo::remote(peer_id, local_hostname()))
    }

    /// Announces a disconnect to the remote peer and closes the channel.
    pub async fn close_remote(&self, reason: &str) {
        let session = self.slots.lock().await.remote.take();
        if let Some(session) = session {
            session.disconnect(reason).await;
        }
    }

    /// Streams files over whichever session is active.
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<(), EngineError> {
        self.ensure_running()?;
        let (sender, remote) = {
            let slots = self.slots.lock().await;
            (slots.sender.clone(), slots.remote.clone())
        };

        if let Some(remote) = remote.filter(|r| !r.is_closed()) {
            remote.send_files(paths).await?;
            return Ok(());
        }
        if let Some(sender) = sender {
            sender.send_files(paths).await?;
            return Ok(());
        }
        Err(EngineError::NoSession)
    }

    /// Releases everything: advertising, listener, sockets, channel,
    /// per-transfer state. Concurrent calls collapse into one.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already ran");
            return;
        }
        info!("engine shutting down");

        let mut slots = self.slots.lock().await;
        if let Some(session) = slots.sender.take() {
            session.stop().await;
        }
        slots.advertise_task.take();
        if let Some(connection) = slots.receiver.take() {
            connection.disconnect();
        }
        if let Some(session) = slots.remote.take() {
            session.shutdown();
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::NoSession);
        }
        Ok(())
    }
}
