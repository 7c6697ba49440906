//! Registered connections and the task that drives each WebSocket.
//!
//! ```text
//!            Hub control loop
//!                  │ try_send(frame)
//!                  ▼
//!   ConnectionHandle ──► bounded queue ──► pump() ──► WebSocket sink
//!                                           ▲
//!                         on_message() ◄────┘ WebSocket stream
//! ```
//!
//! The hub only ever holds a [`ConnectionHandle`]. Dropping the handle closes
//! the queue, which makes the pump send a close frame and stop reading.

use std::future::Future;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::Hub;
use crate::protocol::Message;

/// Encoded frame shared by every connection a broadcast reaches.
pub type Frame = Arc<str>;

/// Receiving end of a connection's outbound queue.
pub type OutboundQueue = mpsc::Receiver<Frame>;

/// Stable id of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fan-out eligibility of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Peer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Peer => f.write_str("peer"),
        }
    }
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Outbound queue is at capacity; the reader is too slow.
    Full,
    /// The connection task is gone.
    Closed,
}

/// Hub-side handle of one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Create a handle and the queue its connection task drains.
    ///
    /// `capacity` bounds how many frames may wait for the socket before the
    /// hub gives up on the connection.
    pub fn new(capacity: usize) -> (Self, OutboundQueue) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: ConnectionId::new(),
                outbound,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Drive a WebSocket until either side closes it.
///
/// Registers the connection under `role`, forwards queued frames to the
/// socket, hands every decodable text frame to `on_message`, and unregisters
/// on exit. Undecodable frames are logged and skipped.
pub(crate) async fn pump<S, F, Fut>(
    ws: WebSocketStream<S>,
    hub: &Hub,
    role: Role,
    label: &str,
    mut on_message: F,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(Message) -> Fut,
    Fut: Future<Output = ()>,
{
    let (handle, mut outbound) = ConnectionHandle::new(hub.outbound_capacity());
    let id = handle.id();
    hub.register(handle, role).await;
    log::info!("{role} connection {id} established ({label})");

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => match Message::decode(text.as_str()) {
                        Ok(msg) => on_message(msg).await,
                        Err(e) => log::debug!("Ignoring malformed frame on {role} {id}: {e}"),
                    },
                    Some(Ok(WsMessage::Close(_))) => {
                        // Flushes the queued close reply.
                        let _ = sink.close().await;
                        log::info!("{role} connection {id} closed by remote ({label})");
                        break;
                    }
                    None => {
                        log::info!("{role} connection {id} ended ({label})");
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        log::debug!("Ignoring binary frame on {role} {id}");
                    }
                    Some(Err(e)) => {
                        log::warn!("{role} connection {id} read error ({label}): {e}");
                        break;
                    }
                    _ => {}
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(WsMessage::text(frame.to_string())).await {
                            log::warn!("{role} connection {id} write error ({label}): {e}");
                            break;
                        }
                    }
                    None => {
                        // Handle dropped by the hub.
                        let _ = sink.close().await;
                        log::info!("{role} connection {id} closed by hub ({label})");
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(id, role).await;
}
