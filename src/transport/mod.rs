//! Message bus client
//!
//! A [`BusConnector`] creates one [`BusSession`] per connect attempt. The
//! session's receive path runs on its own task and reports everything it sees
//! as [`TransportEvent`]s tagged with the session id, so events from a torn
//! down session can be told apart from the current one.
//!
//! Outbound calls are fire-and-forget: they queue the request and return
//! without waiting for the broker.

#[cfg(feature = "mqtt")]
mod mqtt;
mod memory;

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConnector, MqttSettings};
pub use memory::{MemoryBroker, MemoryConnector};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::node::NodeInput;

/// Identifies one connect attempt. Increases monotonically per node.
pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Outcome of the connect handshake
    Connected {
        session: SessionId,
        ok: bool,
        reason: Option<String>,
    },
    Message {
        session: SessionId,
        topic: String,
        payload: Vec<u8>,
    },
    /// An established session dropped
    ConnectionLost { session: SessionId, reason: String },
}

impl TransportEvent {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Connected { session, .. }
            | Self::Message { session, .. }
            | Self::ConnectionLost { session, .. } => *session,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,

    #[error("client request queue is full or closed: {0}")]
    Client(String),

    #[error("invalid connection settings: {0}")]
    Settings(String),
}

/// Delivers transport events into the node's inbox
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<NodeInput>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<NodeInput>) -> Self {
        Self { tx }
    }

    /// Wait for inbox space. Returns `false` once the node has gone away.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(NodeInput::Transport(event)).await.is_ok()
    }

    /// Deliver without waiting. Returns `false` if the inbox is full or closed.
    pub fn try_emit(&self, event: TransportEvent) -> bool {
        self.tx.try_send(NodeInput::Transport(event)).is_ok()
    }
}

/// One live bus client. Dropped only through [`BusSession::shutdown`].
#[async_trait]
pub trait BusSession: Send {
    fn id(&self) -> SessionId;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Disconnect and release the receive task. Returns once it has exited.
    async fn shutdown(self: Box<Self>);
}

#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Start connecting. Completion is reported later as
    /// [`TransportEvent::Connected`]; an `Err` here means the attempt could
    /// not even be initiated.
    async fn connect(
        &self,
        session: SessionId,
        sink: EventSink,
    ) -> Result<Box<dyn BusSession>, TransportError>;
}
