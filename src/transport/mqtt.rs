//! rumqttc-backed bus client

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusConnector, BusSession, EventSink, SessionId, TransportError, TransportEvent};

/// How long a clean disconnect may take before the worker is cancelled
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub qos: QoS,
    /// Request queue size between client handle and event loop
    pub capacity: usize,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            qos: QoS::AtLeastOnce,
            capacity: 100,
        }
    }

    /// Map a numeric QoS level; anything above 2 is clamped
    pub fn qos_from_level(level: u8) -> QoS {
        match level {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn options(&self) -> Result<MqttOptions, TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::Settings("broker host is empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(TransportError::Settings("client id is empty".into()));
        }
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user, pass);
        }
        Ok(options)
    }
}

pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BusConnector for MqttConnector {
    async fn connect(
        &self,
        session: SessionId,
        sink: EventSink,
    ) -> Result<Box<dyn BusSession>, TransportError> {
        let options = self.settings.options()?;
        let (client, eventloop) = AsyncClient::new(options, self.settings.capacity);
        let cancel = CancellationToken::new();

        info!(
            "MQTT connecting to {}:{} as {} (session {})",
            self.settings.host, self.settings.port, self.settings.client_id, session
        );
        let worker = tokio::spawn(run_event_loop(eventloop, session, sink, cancel.clone()));

        Ok(Box::new(MqttSession {
            id: session,
            client,
            qos: self.settings.qos,
            cancel,
            worker,
        }))
    }
}

struct MqttSession {
    id: SessionId,
    client: AsyncClient,
    qos: QoS,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

#[async_trait]
impl BusSession for MqttSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, self.qos, false, payload)
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_subscribe(topic, self.qos)
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn shutdown(self: Box<Self>) {
        let MqttSession {
            id,
            client,
            cancel,
            mut worker,
            ..
        } = *self;

        if let Err(e) = client.try_disconnect() {
            debug!("MQTT session {}: disconnect not queued: {}", id, e);
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut worker).await.is_err() {
            debug!("MQTT session {}: worker still busy, cancelling", id);
            cancel.cancel();
            let _ = worker.await;
        }
        info!("MQTT session {} closed", id);
    }
}

/// Receive path. Exits on disconnect, error or cancellation; reconnecting is
/// the connection manager's decision, never the event loop's.
async fn run_event_loop(
    mut eventloop: EventLoop,
    session: SessionId,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let (event, done) = match polled {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                let ok = ack.code == ConnectReturnCode::Success;
                connected = ok;
                let reason = (!ok).then(|| format!("{:?}", ack.code));
                (Some(TransportEvent::Connected { session, ok, reason }), !ok)
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => (
                Some(TransportEvent::Message {
                    session,
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                }),
                false,
            ),
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("MQTT session {}: broker sent disconnect", session);
                (
                    Some(TransportEvent::ConnectionLost {
                        session,
                        reason: "broker disconnected".into(),
                    }),
                    true,
                )
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT session {}: disconnect sent", session);
                (None, true)
            }
            Ok(_) => (None, false),
            Err(e) => {
                warn!("MQTT session {}: {}", session, e);
                let event = if connected {
                    TransportEvent::ConnectionLost {
                        session,
                        reason: e.to_string(),
                    }
                } else {
                    TransportEvent::Connected {
                        session,
                        ok: false,
                        reason: Some(e.to_string()),
                    }
                };
                (Some(event), true)
            }
        };

        if let Some(event) = event {
            let delivered = tokio::select! {
                _ = cancel.cancelled() => false,
                delivered = sink.emit(event) => delivered,
            };
            if !delivered {
                break;
            }
        }
        if done {
            break;
        }
    }
    debug!("MQTT session {}: event loop exited", session);
}
