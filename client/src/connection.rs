//! Connection manager – owns the duplex link to the analysis service.
//!
//! A single background task connects, forwards inbound frames in order,
//! and after any close waits a fixed delay before exactly one new attempt.
//! This repeats until [`ConnectionManager::shutdown`]; there is no backoff
//! growth and no retry cap.
//!
//! State changes are published on a `watch` channel; frames and open/close
//! events go to the owner over an ordered `mpsc` channel.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{Connector, LinkEvent};

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no attempt running (also while the reconnect timer runs).
    Disconnected,
    /// First connection attempt.
    Connecting,
    Connected,
    /// Attempt following a close or a failed attempt.
    Reconnecting,
}

/// Observable connection health.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Human-readable description of the most recent transport failure.
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Delivered to the owner in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Opened,
    Frame(String),
    /// A previously opened link went away.
    Closed,
}

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

pub struct ConnectionManager {
    status_rx: watch::Receiver<ConnectionStatus>,
    outbound: Outbound,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn the connection task and start connecting right away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        connector: Arc<dyn Connector>,
        endpoint: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let endpoint = endpoint.into();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            last_error: None,
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outbound: Outbound = Arc::new(Mutex::new(None));

        let task = tokio::spawn(run(
            connector,
            endpoint,
            reconnect_delay,
            status_tx,
            events_tx,
            outbound.clone(),
            shutdown_rx,
        ));

        let manager = ConnectionManager {
            status_rx,
            outbound,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        };
        (manager, events_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().connected()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Queue one text frame on the live link.  Never waits.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        let guard = lock(&self.outbound);
        let tx = guard
            .as_ref()
            .ok_or_else(|| TransportError::Link("no live link".to_string()))?;
        tx.send(text)
            .map_err(|_| TransportError::Link("link is closing".to_string()))
    }

    /// Close the link, cancel any pending reconnect and wait for the
    /// connection task to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Connection task ended abnormally: {e}");
            }
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(
    connector: Arc<dyn Connector>,
    endpoint: String,
    reconnect_delay: Duration,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: Outbound,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt_state = ConnectionState::Connecting;

    'outer: loop {
        status_tx.send_modify(|s| s.state = attempt_state);
        debug!("Connecting to {endpoint}");

        let attempt = tokio::select! {
            result = connector.connect(&endpoint) => result,
            _ = shutdown.changed() => break 'outer,
        };

        match attempt {
            Ok(mut link) => {
                *lock(&outbound) = Some(link.outbound.clone());
                status_tx.send_modify(|s| {
                    s.state = ConnectionState::Connected;
                    s.last_error = None;
                });
                info!("Connected to analysis service at {endpoint}");
                let _ = events_tx.send(ConnectionEvent::Opened);

                let stopping = loop {
                    tokio::select! {
                        event = link.inbound.recv() => match event {
                            Some(LinkEvent::Frame(text)) => {
                                let _ = events_tx.send(ConnectionEvent::Frame(text));
                            }
                            // Recorded only; the close that follows drives the state.
                            Some(LinkEvent::Error(e)) => {
                                warn!("Link error on {endpoint}: {e}");
                                status_tx.send_modify(|s| s.last_error = Some(e));
                            }
                            None => break false,
                        },
                        _ = shutdown.changed() => break true,
                    }
                };

                *lock(&outbound) = None;
                drop(link);
                status_tx.send_modify(|s| s.state = ConnectionState::Disconnected);
                let _ = events_tx.send(ConnectionEvent::Closed);

                if stopping {
                    break 'outer;
                }
                info!("Link to {endpoint} closed");
            }
            Err(e) => {
                warn!("{e}");
                status_tx.send_modify(|s| {
                    s.state = ConnectionState::Disconnected;
                    s.last_error = Some(e.to_string());
                });
            }
        }

        info!("Reconnecting in {}s", reconnect_delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => break 'outer,
        }
        attempt_state = ConnectionState::Reconnecting;
    }

    *lock(&outbound) = None;
    status_tx.send_modify(|s| s.state = ConnectionState::Disconnected);
    info!("Connection to {endpoint} shut down");
}
