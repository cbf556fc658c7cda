//! Gates mDNS advertising on the sender lifecycle.

use tokio::sync::watch;
use tracing::{debug, warn};

use beamdrop_discovery::Publisher;
use beamdrop_local::SenderState;

/// Runs until the sender terminates, keeping the advertisement published
/// exactly while the session is listening and unauthenticated.
///
/// Publish failures are logged, not fatal; the next transition back to
/// `Listening` retries. Socket loss mid-transfer first tears the peer
/// state down (the sender only then reports `Listening`), so the record
/// never reappears over a half-dead session.
pub(crate) async fn advertise_while_listening(
    mut state_rx: watch::Receiver<SenderState>,
    instance_name: String,
    port: u16,
) {
    let mut publisher = Publisher::new();

    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            SenderState::Listening => {
                if let Err(e) = publisher.publish(&instance_name, port) {
                    warn!("advertising publish failed: {e}");
                }
            }
            SenderState::Authed | SenderState::Sending => publisher.unpublish(),
            SenderState::Terminated => break,
        }

        if state_rx.changed().await.is_err() {
            break;
        }
    }

    publisher.unpublish();
    debug!("advertising gate closed");
}
