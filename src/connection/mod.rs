//! Connection / reconnection manager
//!
//! Owns the node's single bus session. Connecting is split in two: `connect`
//! initiates, the session's `Connected` event completes. Before a replacement
//! session is created the old one is torn down completely, so two clients
//! never deliver the same message to one node.

mod policy;

pub use policy::{ReconnectMode, ReconnectPolicy, RetryDecision};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::transport::{BusConnector, BusSession, EventSink, SessionId, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of [`ConnectionManager::connect`]
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectAttempt {
    /// A new session is connecting; completion arrives as an event
    Initiated(SessionId),
    /// A connect is already in flight or established
    AlreadyActive,
    /// The attempt could not be started
    Failed,
}

pub struct ConnectionManager {
    connector: Arc<dyn BusConnector>,
    sink: EventSink,
    session: Option<Box<dyn BusSession>>,
    state: ConnectionState,
    generation: SessionId,
    subscriptions: BTreeSet<String>,
    failures: u32,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BusConnector>, sink: EventSink) -> Self {
        Self {
            connector,
            sink,
            session: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            subscriptions: BTreeSet::new(),
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// Whether `session` is the live one. Events from older sessions are stale.
    pub fn is_current(&self, session: SessionId) -> bool {
        self.session.as_ref().map(|s| s.id()) == Some(session)
    }

    /// Start a connect attempt, tearing down any previous session first.
    pub async fn connect(&mut self) -> ConnectAttempt {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("Connect requested while {}", self.state);
            return ConnectAttempt::AlreadyActive;
        }
        self.release_session().await;

        self.generation += 1;
        let id = self.generation;
        self.state = ConnectionState::Connecting;
        info!("Connecting (session {}, attempt {})", id, self.failures + 1);

        match self.connector.connect(id, self.sink.clone()).await {
            Ok(session) => {
                self.session = Some(session);
                ConnectAttempt::Initiated(id)
            }
            Err(e) => {
                warn!("Connect attempt {} could not start: {}", id, e);
                self.state = ConnectionState::Failed;
                self.failures += 1;
                ConnectAttempt::Failed
            }
        }
    }

    /// Completion of the connect handshake. Returns the new state, or `None`
    /// when the event belongs to a stale session.
    pub fn on_connected(&mut self, session: SessionId, ok: bool) -> Option<ConnectionState> {
        if !self.is_current(session) || self.state != ConnectionState::Connecting {
            debug!("Ignoring connect result of stale session {}", session);
            return None;
        }
        if ok {
            info!("Connected (session {})", session);
            self.state = ConnectionState::Connected;
            self.failures = 0;
        } else {
            warn!("Connect refused (session {})", session);
            self.state = ConnectionState::Failed;
            self.failures += 1;
        }
        Some(self.state)
    }

    /// An established session dropped
    pub fn on_connection_lost(&mut self, session: SessionId) -> Option<ConnectionState> {
        if !self.is_current(session) || self.state != ConnectionState::Connected {
            return None;
        }
        warn!("Connection lost (session {})", session);
        self.state = ConnectionState::Failed;
        self.failures += 1;
        self.subscriptions.clear();
        Some(self.state)
    }

    /// Subscribe on the live session. Repeated subscriptions are no-ops.
    pub fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if self.subscriptions.contains(topic) {
            return Ok(());
        }
        let session = self.live_session()?;
        session.subscribe(topic)?;
        debug!("Subscribed to {}", topic);
        self.subscriptions.insert(topic.to_string());
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if !self.subscriptions.remove(topic) {
            return Ok(());
        }
        let session = self.live_session()?;
        session.unsubscribe(topic)?;
        debug!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Fire-and-forget publish. Failures are the caller's to log; nothing is
    /// retried.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.live_session()?.publish(topic, payload)
    }

    /// Unsubscribe everything, close the session and wait for its worker.
    pub async fn teardown(&mut self) {
        self.release_session().await;
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn live_session(&self) -> Result<&dyn BusSession, TransportError> {
        match (&self.session, self.state) {
            (Some(session), ConnectionState::Connected) => Ok(session.as_ref()),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn release_session(&mut self) {
        let topics = std::mem::take(&mut self.subscriptions);
        let Some(session) = self.session.take() else {
            return;
        };
        if self.state == ConnectionState::Connected {
            for topic in &topics {
                if let Err(e) = session.unsubscribe(topic) {
                    debug!("Unsubscribe {} during teardown failed: {}", topic, e);
                }
            }
        }
        debug!("Tearing down session {}", session.id());
        session.shutdown().await;
    }
}
