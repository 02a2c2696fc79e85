//! In-process broker
//!
//! Loopback implementation of the bus for running several nodes inside one
//! process. Topics match exactly (no wildcards). A publisher subscribed to
//! its own topic receives its own message, as with a real broker.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BusConnector, BusSession, EventSink, SessionId, TransportError, TransportEvent};

const TAP_CAPACITY: usize = 256;

struct Client {
    client_id: String,
    session: SessionId,
    sink: EventSink,
    topics: HashSet<String>,
    connected: bool,
}

struct Tap {
    topics: HashSet<String>,
    tx: mpsc::Sender<(String, Vec<u8>)>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<u64, Client>,
    next_key: u64,
    refuse_next: usize,
    taps: Vec<Tap>,
}

/// Shared handle; clones refer to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connector for a node identified as `client_id`
    pub fn connector(&self, client_id: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
            client_id: client_id.into(),
        }
    }

    /// Refuse the next `count` connect handshakes
    pub fn refuse_next(&self, count: usize) {
        self.lock().refuse_next = count;
    }

    /// Drop every live session of `client_id` as if the network failed.
    /// Returns how many sessions were severed.
    pub fn sever(&self, client_id: &str) -> usize {
        let mut state = self.lock();
        let mut severed = 0;
        for client in state.clients.values_mut() {
            if client.client_id != client_id || !client.connected {
                continue;
            }
            client.connected = false;
            client.topics.clear();
            severed += 1;

            let sink = client.sink.clone();
            let session = client.session;
            tokio::spawn(async move {
                sink.emit(TransportEvent::ConnectionLost {
                    session,
                    reason: "connection severed".into(),
                })
                .await;
            });
        }
        severed
    }

    /// Passive observer of `topics`, outside any node
    pub fn tap<I, S>(&self, topics: I) -> mpsc::Receiver<(String, Vec<u8>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::channel(TAP_CAPACITY);
        self.lock().taps.push(Tap {
            topics: topics.into_iter().map(Into::into).collect(),
            tx,
        });
        rx
    }

    /// Publish from outside any node
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.lock().route(topic, payload.into());
    }

    /// Live, connected sessions
    pub fn session_count(&self) -> usize {
        self.lock().clients.values().filter(|c| c.connected).count()
    }

    /// Connected sessions currently subscribed to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .clients
            .values()
            .filter(|c| c.connected && c.topics.contains(topic))
            .count()
    }
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: Vec<u8>) {
        for client in self.clients.values() {
            if !client.connected || !client.topics.contains(topic) {
                continue;
            }
            let delivered = client.sink.try_emit(TransportEvent::Message {
                session: client.session,
                topic: topic.to_string(),
                payload: payload.clone(),
            });
            if !delivered {
                warn!(
                    "Memory broker: inbox of {} full or closed, dropped message on {}",
                    client.client_id, topic
                );
            }
        }
        self.taps.retain(|tap| !tap.tx.is_closed());
        for tap in &self.taps {
            if tap.topics.contains(topic) {
                if tap.tx.try_send((topic.to_string(), payload.clone())).is_err() {
                    warn!("Memory broker: tap full, dropped message on {}", topic);
                }
            }
        }
    }
}

pub struct MemoryConnector {
    broker: MemoryBroker,
    client_id: String,
}

#[async_trait]
impl BusConnector for MemoryConnector {
    async fn connect(
        &self,
        session: SessionId,
        sink: EventSink,
    ) -> Result<Box<dyn BusSession>, TransportError> {
        let (key, ok) = {
            let mut state = self.broker.lock();
            let ok = if state.refuse_next > 0 {
                state.refuse_next -= 1;
                false
            } else {
                true
            };
            let key = state.next_key;
            state.next_key += 1;
            state.clients.insert(
                key,
                Client {
                    client_id: self.client_id.clone(),
                    session,
                    sink: sink.clone(),
                    topics: HashSet::new(),
                    connected: ok,
                },
            );
            (key, ok)
        };
        debug!(
            "Memory broker: {} session {} {}",
            self.client_id,
            session,
            if ok { "accepted" } else { "refused" }
        );

        tokio::spawn(async move {
            sink.emit(TransportEvent::Connected {
                session,
                ok,
                reason: (!ok).then(|| "connection refused".to_string()),
            })
            .await;
        });

        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            key,
            session,
        }))
    }
}

struct MemorySession {
    broker: MemoryBroker,
    key: u64,
    session: SessionId,
}

impl MemorySession {
    fn with_client<T>(
        &self,
        f: impl FnOnce(&mut Client) -> T,
    ) -> Result<T, TransportError> {
        let mut state = self.broker.lock();
        match state.clients.get_mut(&self.key) {
            Some(client) if client.connected => Ok(f(client)),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl BusSession for MemorySession {
    fn id(&self) -> SessionId {
        self.session
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.with_client(|_| ())?;
        self.broker.lock().route(topic, payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.with_client(|client| {
            client.topics.insert(topic.to_string());
        })
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.with_client(|client| {
            client.topics.remove(topic);
        })
    }

    async fn shutdown(self: Box<Self>) {
        self.broker.lock().clients.remove(&self.key);
        debug!("Memory broker: session {} closed", self.session);
    }
}
