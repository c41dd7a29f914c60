//! Duplex transport to the analysis service.
//!
//! A [`Connector`] turns an endpoint into a [`Link`]: a pair of channels
//! whose far ends are pumped by a background task that owns the socket.
//! Dropping the link closes the socket; the socket closing ends the
//! inbound channel.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::TransportError;

/// What the far side of a link delivered.  The channel ending is the close.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One text frame, verbatim.
    Frame(String),
    /// A transport error.  The close follows.
    Error(String),
}

/// An open duplex link.
#[derive(Debug)]
pub struct Link {
    /// Fire-and-forget outbound text frames.
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links.  Implemented over WebSockets in production and over plain
/// channels in tests.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<Link, TransportError>;
}

/// `tokio-tungstenite` connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link, TransportError> {
        let connect_error = |reason: String| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason,
        };

        let (ws_stream, response) = timeout(self.connect_timeout, connect_async(endpoint))
            .await
            .map_err(|_| connect_error("timed out".to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;
        debug!("WebSocket handshake with {endpoint}: {}", response.status());

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();
        let endpoint = endpoint.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                let _ = in_tx.send(LinkEvent::Error(format!("send failed: {e}")));
                                break;
                            }
                        }
                        None => {
                            // Link dropped by its owner.
                            if let Err(e) = sink.close().await {
                                debug!("Close handshake with {endpoint} failed: {e}");
                            }
                            break;
                        }
                    },
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(LinkEvent::Frame(text.as_str().to_owned())).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("{endpoint} closed the link: {frame:?}");
                            break;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Ignoring {}-byte binary frame from {endpoint}", data.len());
                        }
                        // Pings are answered by tungstenite itself.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = in_tx.send(LinkEvent::Error(e.to_string()));
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("Link pump for {endpoint} finished");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
