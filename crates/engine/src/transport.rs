//! Transport abstraction and the WebSocket implementation.
//!
//! The connection manager only sees a [`Link`]: a sender for outbound text
//! frames and a receiver of inbound events. Dropping the outbound sender
//! closes the underlying socket.

use crate::error::EngineError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Event produced by an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text frame from the remote side.
    Frame(String),
    /// The remote side closed the link.
    Closed { reason: Option<String> },
    /// The link failed.
    Error(String),
}

/// One open transport.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new link to `endpoint`.
    async fn open(&self, endpoint: &str) -> Result<Link, EngineError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &str) -> Result<Link, EngineError> {
        debug!("Opening WebSocket to {}", endpoint);
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| EngineError::Transport(format!("Connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer: forwards frames until the sender side is dropped, then closes.
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!("WebSocket write failed: {}", e);
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        // Reader: forwards text frames; stops on close, error, or when nobody listens.
        tokio::spawn(async move {
            loop {
                let event = match read.next().await {
                    Some(Ok(Message::Text(text))) => TransportEvent::Frame(text),
                    Some(Ok(Message::Close(frame))) => TransportEvent::Closed {
                        reason: frame.map(|f| f.reason.to_string()),
                    },
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => TransportEvent::Error(e.to_string()),
                    None => TransportEvent::Closed { reason: None },
                };
                let terminal = !matches!(event, TransportEvent::Frame(_));
                if inbound_tx.send(event).is_err() || terminal {
                    break;
                }
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
