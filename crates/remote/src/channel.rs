//! The semantic contract of the brokered peer channel.
//!
//! The rendezvous broker itself is an external collaborator; the engine
//! only requires a reliable, ordered, message-framed, bidirectional pipe.
//! Hosts bridge whatever transport the broker hands them into a
//! [`PeerChannel`] via the mpsc pair in [`PeerChannel::from_parts`].

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamdrop_protocol::RemoteFrame;

use crate::RemoteError;

/// In-flight records buffered per direction before `send` applies
/// backpressure.
const CHANNEL_CAPACITY: usize = 64;

/// One end of a reliable ordered record channel between two peers.
pub struct PeerChannel {
    outbound: mpsc::Sender<RemoteFrame>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<RemoteFrame>>,
    closed: CancellationToken,
}

impl PeerChannel {
    /// Wraps a transport the host has already connected.
    ///
    /// The host pushes records it receives from the broker into `inbound`'s
    /// sender and drains `outbound`'s receiver onto the wire. Dropping
    /// either side reads as a channel close here.
    pub fn from_parts(
        outbound: mpsc::Sender<RemoteFrame>,
        inbound: mpsc::Receiver<RemoteFrame>,
    ) -> Self {
        Self {
            outbound,
            inbound: tokio::sync::Mutex::new(inbound),
            closed: CancellationToken::new(),
        }
    }

    /// A connected pair of channel ends for loopback use and tests.
    pub fn memory_pair() -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            PeerChannel::from_parts(a_tx, b_rx),
            PeerChannel::from_parts(b_tx, a_rx),
        )
    }

    /// Sends one record, suspending while the transport is saturated.
    pub async fn send(&self, frame: RemoteFrame) -> Result<(), RemoteError> {
        if self.closed.is_cancelled() {
            return Err(RemoteError::ChannelClosed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RemoteError::ChannelClosed)
    }

    /// Receives the next record, or `None` once the channel is closed.
    pub async fn recv(&self) -> Option<RemoteFrame> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = inbound.recv() => frame,
        }
    }

    /// Closes this end. Further sends fail and `recv` returns `None`.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
