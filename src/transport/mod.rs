//! The `transport` module owns the logical connection to a broker endpoint.
//!
//! It tracks the connection lifecycle as an explicit state machine,
//! publishes every transition on a watch channel, and runs a supervisor
//! task that re-dials with exponential backoff whenever the link drops
//! unexpectedly. The physical link itself is behind the [`Connector`] seam.

pub mod backoff;
pub mod link;

pub use backoff::{Backoff, BackoffPolicy};
pub use link::{Connector, LoopbackConnector};


use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::utils::error::Result;

/// Lifecycle of the logical broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// An abstract bidirectional connection to a broker endpoint.
///
/// Owns the reconnect/backoff state. Channels observe the state via
/// [`Transport::subscribe`] and pause dispatch while the link is away.
/// A dropped link implicitly invalidates every open delivery that was
/// riding on it; those messages become re-deliverable, so duplicates after
/// a reconnect are expected. That is the at-least-once contract.
pub struct Transport {
    endpoint: String,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<ConnectionState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Dials `endpoint` and, on success, starts the reconnect supervisor.
    /// An unreachable endpoint surfaces `Error::Connection` right away.
    pub async fn connect(
        endpoint: &str,
        connector: Arc<dyn Connector>,
        policy: BackoffPolicy,
    ) -> Result<Arc<Self>> {
        connector.dial(endpoint)?;

        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let transport = Arc::new(Self {
            endpoint: endpoint.to_string(),
            connector,
            state_tx,
            supervisor: Mutex::new(None),
        });

        // Subscribe before spawning so a drop reported right after connect
        // returns is never missed.
        let state_rx = transport.state_tx.subscribe();
        let handle = tokio::spawn(Self::supervise(Arc::clone(&transport), policy, state_rx));
        *transport.supervisor.lock().unwrap() = Some(handle);

        info!(endpoint, "transport connected");
        Ok(transport)
    }

    /// Re-dials forever (with backoff) whenever the state goes to
    /// `Disconnected`, until the transport is closed.
    async fn supervise(
        transport: Arc<Transport>,
        policy: BackoffPolicy,
        mut rx: watch::Receiver<ConnectionState>,
    ) {
        let mut backoff = Backoff::new(policy);
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Disconnected => {
                    transport.state_tx.send_replace(ConnectionState::Connecting);
                    loop {
                        let delay = backoff.next_delay();
                        debug!(
                            endpoint = %transport.endpoint,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "reconnecting"
                        );
                        tokio::time::sleep(delay).await;
                        if matches!(
                            *transport.state_tx.borrow(),
                            ConnectionState::Closing | ConnectionState::Closed
                        ) {
                            return;
                        }
                        match transport.connector.dial(&transport.endpoint) {
                            Ok(()) => {
                                backoff.reset();
                                transport.state_tx.send_replace(ConnectionState::Connected);
                                info!(endpoint = %transport.endpoint, "transport reconnected");
                                break;
                            }
                            Err(e) => {
                                warn!(endpoint = %transport.endpoint, error = %e, "reconnect attempt failed");
                            }
                        }
                    }
                }
                ConnectionState::Closing | ConnectionState::Closed => break,
                _ => {}
            }
        }
    }

    /// Report unexpected loss of the underlying link. The supervisor picks
    /// this up and starts re-dialing; open deliveries on this transport
    /// become re-deliverable.
    pub fn drop_link(&self, reason: &str) {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return;
        }
        warn!(endpoint = %self.endpoint, reason, "link dropped");
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Closes the transport. Idempotent.
    pub fn close(&self) {
        if matches!(
            *self.state_tx.borrow(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        self.state_tx.send_replace(ConnectionState::Closing);
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            handle.abort();
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        info!(endpoint = %self.endpoint, "transport closed");
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch every state transition. Receivers see the current state first.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
