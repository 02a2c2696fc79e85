//! The node actor
//!
//! One task owns all of a node's mutable state: connection, router,
//! lifecycle machine or counterpart tracker, and playlist. Transport
//! callbacks, collaborator callbacks and local commands all arrive through a
//! single bounded inbox and are handled one at a time, so an `add` that
//! arrives after an `add_all` is always applied after it.

mod input;

pub use input::{LocalCommand, NodeHandle, NodeInput};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{NodeEvent, SharedBus};
use crate::connection::{
    ConnectAttempt, ConnectionManager, ConnectionState, ReconnectPolicy, RetryDecision,
};
use crate::content::{ContentHost, ContentUrls, LoggingContentHost};
use crate::lifecycle::{
    AppStore, CounterpartEffect, CounterpartTracker, LifecycleEffect, LifecycleMachine,
};
use crate::playlist::{
    LoggingPlayer, Player, PlayerEvent, PlaylistEffect, PlaylistEngine, SyncRole,
};
use crate::protocol::{decode, encode, Action, Envelope};
use crate::router::{
    playlist_session_topic, RouteClass, TopicRouter, TOPIC_PLAYLIST, TOPIC_SENSOR, TOPIC_SYSTEM,
    TOPIC_WEBAPP,
};
use crate::transport::{BusConnector, EventSink, TransportEvent};

/// Default inbox size
pub const INBOX_CAPACITY: usize = 256;

/// How long a host waits for a started app's page before failing the start
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Head unit: installs and shows hosted apps
    Host,
    /// Media device: owns the playlist and the player
    #[default]
    Controller,
    /// Playlist editor
    Remote,
    /// Read-only dashboard
    Status,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Host => "host",
            Self::Controller => "controller",
            Self::Remote => "remote",
            Self::Status => "status",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub role: Role,
    /// Hosted app negotiated over `/system`
    pub app: String,
    pub slot: u32,
    /// Controller: install and start the app without being asked
    pub auto_provision: bool,
    /// Controller: zip archive sent on install
    pub bundle: Option<PathBuf>,
    /// Host: where apps are unpacked
    pub apps_dir: PathBuf,
    pub content: ContentUrls,
    pub start_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Remote: topic the full-sync answer is requested on
    pub sync_reply_topic: String,
    pub inbox_capacity: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            role: Role::default(),
            app: "playlist".to_string(),
            slot: 1,
            auto_provision: false,
            bundle: None,
            apps_dir: PathBuf::from("www"),
            content: ContentUrls::default(),
            start_timeout: DEFAULT_START_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            sync_reply_topic: TOPIC_PLAYLIST.to_string(),
            inbox_capacity: INBOX_CAPACITY,
        }
    }
}

pub struct Node {
    settings: NodeSettings,
    inbox: mpsc::Receiver<NodeInput>,
    tx: mpsc::Sender<NodeInput>,
    bus: SharedBus,
    connection: ConnectionManager,
    router: TopicRouter,
    lifecycle: Option<LifecycleMachine>,
    counterpart: Option<CounterpartTracker>,
    playlist: Option<PlaylistEngine>,
    content: Box<dyn ContentHost>,
    player: Box<dyn Player>,
    retry_timer: Option<JoinHandle<()>>,
    start_screen_shown: bool,
}

impl Node {
    pub fn new(
        settings: NodeSettings,
        connector: Arc<dyn BusConnector>,
        bus: SharedBus,
    ) -> (Self, NodeHandle) {
        let (tx, inbox) = mpsc::channel(settings.inbox_capacity.max(1));
        let connection = ConnectionManager::new(connector, EventSink::new(tx.clone()));

        let lifecycle = (settings.role == Role::Host).then(|| {
            LifecycleMachine::new(
                AppStore::new(&settings.apps_dir),
                settings.content.clone(),
                settings.slot,
            )
        });
        let counterpart = (settings.role == Role::Controller).then(|| {
            CounterpartTracker::new(&settings.app, settings.slot, settings.auto_provision)
        });
        let playlist = match settings.role {
            Role::Host => None,
            Role::Controller => Some(PlaylistEngine::new(SyncRole::Writer)),
            Role::Remote | Role::Status => Some(PlaylistEngine::new(SyncRole::Mirror)),
        };

        let node = Self {
            settings,
            inbox,
            tx: tx.clone(),
            bus,
            connection,
            router: TopicRouter::new(),
            lifecycle,
            counterpart,
            playlist,
            content: Box::new(LoggingContentHost::new()),
            player: Box::new(LoggingPlayer),
            retry_timer: None,
            start_screen_shown: false,
        };
        (node, NodeHandle::new(tx))
    }

    pub fn with_content_host(mut self, content: impl ContentHost) -> Self {
        self.content = Box::new(content);
        self
    }

    pub fn with_player(mut self, player: impl Player) -> Self {
        self.player = Box::new(player);
        self
    }

    /// Connect and process inputs until shutdown
    pub async fn run(mut self) {
        info!("Node starting as {}", self.settings.role);
        self.connect().await;

        while let Some(input) = self.inbox.recv().await {
            if matches!(input, NodeInput::Shutdown) {
                break;
            }
            self.handle(input).await;
        }

        info!("Node shutting down");
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        self.connection.teardown().await;
        self.publish_connection_state();
        self.bus.publish(NodeEvent::ShuttingDown);
    }

    async fn handle(&mut self, input: NodeInput) {
        match input {
            NodeInput::Transport(event) => self.on_transport(event).await,
            NodeInput::UnpackComplete { app, topic, result } => {
                if let Some(machine) = self.lifecycle.as_mut() {
                    let effects = machine.on_unpack_complete(&app, &topic, result);
                    self.apply_lifecycle(effects);
                }
            }
            NodeInput::PageLoaded { url } => {
                if let Some(machine) = self.lifecycle.as_mut() {
                    let effects = machine.on_page_loaded(&url);
                    self.apply_lifecycle(effects);
                }
            }
            NodeInput::StartTimedOut { app, seq } => {
                if let Some(machine) = self.lifecycle.as_mut() {
                    let effects = machine.on_start_timeout(&app, seq);
                    self.apply_lifecycle(effects);
                }
            }
            NodeInput::Player(event) => self.on_player(event),
            NodeInput::RetryAnswer(retry) => {
                self.retry_timer = None;
                if !retry {
                    info!("Reconnect declined; staying {}", self.connection.state());
                } else if self.connection.state() == ConnectionState::Failed {
                    self.connect().await;
                }
            }
            NodeInput::Command(command) => self.on_command(command).await,
            NodeInput::Shutdown => {}
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    async fn connect(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
        match self.connection.connect().await {
            ConnectAttempt::Initiated(_) => self.publish_connection_state(),
            ConnectAttempt::AlreadyActive => {}
            ConnectAttempt::Failed => {
                self.publish_connection_state();
                self.schedule_retry();
            }
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                session,
                ok,
                reason,
            } => match self.connection.on_connected(session, ok) {
                Some(ConnectionState::Connected) => {
                    self.on_session_established().await;
                    self.publish_connection_state();
                }
                Some(_) => {
                    warn!(
                        "Connect failed: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    self.publish_connection_state();
                    self.schedule_retry();
                }
                None => {}
            },
            TransportEvent::Message {
                session,
                topic,
                payload,
            } => {
                if self.connection.is_current(session) {
                    self.route(&topic, payload).await;
                } else {
                    debug!("Dropping message on {} from stale session {}", topic, session);
                }
            }
            TransportEvent::ConnectionLost { session, reason } => {
                if self.connection.on_connection_lost(session).is_some() {
                    warn!("Connection lost: {}", reason);
                    self.publish_connection_state();
                    self.schedule_retry();
                }
            }
        }
    }

    fn schedule_retry(&mut self) {
        let failures = self.connection.failures();
        match self.settings.reconnect.decide(failures) {
            RetryDecision::RetryAfter(delay) => {
                if self.retry_timer.is_some() {
                    return;
                }
                info!("Reconnecting in {:?} (failure {})", delay, failures);
                let tx = self.tx.clone();
                self.retry_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(NodeInput::RetryAnswer(true)).await.is_err() {
                        debug!("Retry timer fired after node stopped");
                    }
                }));
            }
            RetryDecision::AskUser => {
                self.bus.publish(NodeEvent::ReconnectRequested { failures });
            }
            RetryDecision::GiveUp => {
                warn!("Giving up reconnecting after {} failures", failures);
            }
        }
    }

    /// Per-role subscriptions and announcements on a fresh session
    async fn on_session_established(&mut self) {
        let mut topics: Vec<String> = Vec::new();
        match self.settings.role {
            Role::Host => {
                topics.push(TOPIC_SYSTEM.to_string());
                if let Some(private) = self.router.active_private() {
                    topics.push(private.to_string());
                }
            }
            Role::Controller => {
                topics.push(TOPIC_PLAYLIST.to_string());
                topics.push(playlist_session_topic(self.settings.slot));
                topics.push(TOPIC_SENSOR.to_string());
                if let Some(tracker) = &self.counterpart {
                    let private = tracker.topic().to_string();
                    if let Err(e) = self.router.register_private(&private) {
                        warn!("{}", e);
                    }
                    topics.push(private);
                }
            }
            Role::Remote => {
                topics.push(TOPIC_PLAYLIST.to_string());
                topics.push(self.settings.sync_reply_topic.clone());
            }
            Role::Status => {
                topics.push(TOPIC_SYSTEM.to_string());
                topics.push(TOPIC_WEBAPP.to_string());
                topics.push(TOPIC_PLAYLIST.to_string());
            }
        }
        for topic in &topics {
            if let Err(e) = self.connection.subscribe(topic) {
                warn!("Subscribe to {} failed: {}", topic, e);
            }
        }

        match self.settings.role {
            Role::Host if !self.start_screen_shown => {
                self.start_screen_shown = true;
                let url = self.settings.content.start_screen.clone();
                self.content.load_url(&url);
            }
            Role::Controller => {
                if let Some(query) = self.counterpart.as_ref().map(|t| t.query()) {
                    self.publish_envelope(TOPIC_SYSTEM, &query);
                }
            }
            Role::Remote => {
                let request = Envelope::get_all(self.settings.sync_reply_topic.as_str());
                self.publish_envelope(TOPIC_PLAYLIST, &request);
            }
            _ => {}
        }
    }

    // =========================================================================
    // Inbound routing
    // =========================================================================

    async fn route(&mut self, topic: &str, payload: Vec<u8>) {
        match self.router.classify(topic) {
            RouteClass::Opaque => self.forward_opaque(topic, payload),
            RouteClass::System => {
                let Some(envelope) = self.decode_or_drop(topic, &payload) else {
                    return;
                };
                self.observe(topic, &envelope);
                if let Some(machine) = self.lifecycle.as_mut() {
                    let effects = machine.handle_request(&envelope);
                    self.apply_lifecycle(effects);
                }
            }
            RouteClass::PrivateResponse => self.route_private(topic, payload).await,
            RouteClass::Playlist => {
                let Some(envelope) = self.decode_or_drop(topic, &payload) else {
                    return;
                };
                self.apply_playlist_envelope(&envelope);
            }
        }
    }

    async fn route_private(&mut self, topic: &str, payload: Vec<u8>) {
        if self.settings.role == Role::Host {
            // Our own responses come back on this topic; everything else is
            // app traffic for the hosted content
            if matches!(decode(&payload), Ok(envelope) if envelope.is_response()) {
                return;
            }
            self.forward_opaque(topic, payload);
            return;
        }

        let Some(envelope) = self.decode_or_drop(topic, &payload) else {
            return;
        };
        if envelope.is_response() && envelope.action.is_lifecycle() {
            self.observe(topic, &envelope);
            if let Some(tracker) = self.counterpart.as_mut() {
                let effects = tracker.on_response(&envelope);
                self.apply_counterpart(effects).await;
            }
        } else {
            self.apply_playlist_envelope(&envelope);
        }
    }

    fn decode_or_drop(&self, topic: &str, payload: &[u8]) -> Option<Envelope> {
        match decode(payload) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("Dropping message on {}: {}", topic, e);
                None
            }
        }
    }

    fn forward_opaque(&mut self, topic: &str, payload: Vec<u8>) {
        debug!("Opaque message on {} ({} bytes)", topic, payload.len());
        if self.settings.role == Role::Host {
            self.content.deliver(topic, &payload);
        }
        self.bus.publish(NodeEvent::Opaque {
            topic: topic.to_string(),
            payload,
        });
    }

    fn observe(&self, topic: &str, envelope: &Envelope) {
        self.bus.publish(NodeEvent::SystemObserved {
            topic: topic.to_string(),
            envelope: envelope.clone(),
            at: chrono::Utc::now(),
        });
    }

    // =========================================================================
    // Effects
    // =========================================================================

    fn apply_playlist_envelope(&mut self, envelope: &Envelope) {
        let Some(engine) = self.playlist.as_mut() else {
            return;
        };
        let effects = engine.apply(envelope);
        self.apply_playlist(effects);
    }

    fn apply_playlist(&mut self, effects: Vec<PlaylistEffect>) {
        for effect in effects {
            match effect {
                PlaylistEffect::Publish { topic, envelope } => {
                    self.publish_envelope(&topic, &envelope)
                }
                PlaylistEffect::Player(command) => self.player.execute(command),
                PlaylistEffect::Changed => {
                    if let Some(engine) = &self.playlist {
                        let playlist = engine.playlist();
                        self.bus.publish(NodeEvent::PlaylistChanged {
                            tracks: playlist.tracks().to_vec(),
                            current_index: playlist.wire_index(),
                        });
                    }
                }
                PlaylistEffect::Position(position) => {
                    self.bus.publish(NodeEvent::PositionChanged { position })
                }
                PlaylistEffect::Transport(action) => {
                    self.bus.publish(NodeEvent::TransportObserved { action })
                }
            }
        }
    }

    fn apply_lifecycle(&mut self, effects: Vec<LifecycleEffect>) {
        for effect in effects {
            match effect {
                LifecycleEffect::Respond { topic, envelope } => {
                    self.publish_envelope(&topic, &envelope)
                }
                LifecycleEffect::SubscribePrivate { topic, .. } => self.switch_private(&topic),
                LifecycleEffect::LoadUrl(url) => self.content.load_url(&url),
                LifecycleEffect::Unpack {
                    app,
                    topic,
                    payload,
                } => self.spawn_unpack(app, topic, payload),
                LifecycleEffect::StateChanged { app, state } => {
                    self.bus.publish(NodeEvent::AppStateChanged { app, state })
                }
                LifecycleEffect::StartTimer { app, seq } => self.spawn_start_timer(app, seq),
            }
        }
    }

    fn spawn_start_timer(&self, app: String, seq: u64) {
        let tx = self.tx.clone();
        let timeout = self.settings.start_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if tx.send(NodeInput::StartTimedOut { app, seq }).await.is_err() {
                debug!("Start timer fired after node stopped");
            }
        });
    }

    fn switch_private(&mut self, topic: &str) {
        match self.router.register_private(topic) {
            Ok(previous) => {
                if let Some(previous) = previous {
                    if let Err(e) = self.connection.unsubscribe(&previous) {
                        debug!("Unsubscribe from {} failed: {}", previous, e);
                    }
                }
                if let Err(e) = self.connection.subscribe(topic) {
                    warn!("Subscribe to {} failed: {}", topic, e);
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Extraction is blocking filesystem work; run it off the actor and
    /// report back through the inbox.
    fn spawn_unpack(&self, app: String, topic: String, payload: String) {
        let Some(store) = self.lifecycle.as_ref().map(|m| m.store().clone()) else {
            return;
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let target = app.clone();
            let result = tokio::task::spawn_blocking(move || {
                store
                    .install_base64(&target, &payload)
                    .map_err(|e| e.to_string())
            })
            .await
            .unwrap_or_else(|e| Err(format!("unpack task failed: {}", e)));

            if tx
                .send(NodeInput::UnpackComplete { app, topic, result })
                .await
                .is_err()
            {
                debug!("Unpack finished after node stopped");
            }
        });
    }

    async fn apply_counterpart(&mut self, effects: Vec<CounterpartEffect>) {
        for effect in effects {
            match effect {
                CounterpartEffect::Request(envelope) => {
                    self.publish_envelope(TOPIC_SYSTEM, &envelope)
                }
                CounterpartEffect::InstallFromBundle => self.send_bundle().await,
                CounterpartEffect::BroadcastPlaylist => {
                    if let Some(engine) = self.playlist.as_mut() {
                        let effect = engine.broadcast(TOPIC_PLAYLIST);
                        self.apply_playlist(vec![effect]);
                    }
                }
                CounterpartEffect::StopPlayback => {
                    if let Some(engine) = self.playlist.as_mut() {
                        let mut effects = engine.reset();
                        effects.push(engine.broadcast(TOPIC_PLAYLIST));
                        self.apply_playlist(effects);
                    }
                }
                CounterpartEffect::StateChanged(state) => {
                    let app = self.settings.app.clone();
                    self.bus.publish(NodeEvent::AppStateChanged { app, state });
                }
            }
        }
    }

    /// Read the configured bundle and publish it as an `install`
    async fn send_bundle(&mut self) {
        let Some(path) = self.settings.bundle.clone() else {
            warn!(
                "Cannot install {}: no app bundle configured",
                self.settings.app
            );
            return;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                info!("Sending {} ({} bytes) for install", path.display(), bytes.len());
                if let Some(request) = self
                    .counterpart
                    .as_ref()
                    .map(|t| t.install(STANDARD.encode(&bytes)))
                {
                    self.publish_envelope(TOPIC_SYSTEM, &request);
                }
            }
            Err(e) => error!("Failed to read app bundle {}: {}", path.display(), e),
        }
    }

    fn on_player(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::EndOfTrack => {
                // Applied when the echo arrives, like any other next
                if self.settings.role == Role::Controller {
                    self.publish_envelope(TOPIC_PLAYLIST, &Envelope::new(Action::Next));
                }
            }
            PlayerEvent::Started { success } => self.bus.publish(NodeEvent::PlayerStatus {
                playing: success,
                success,
            }),
            PlayerEvent::Paused { success } => self.bus.publish(NodeEvent::PlayerStatus {
                playing: !success,
                success,
            }),
            PlayerEvent::Position(position) => {
                self.bus.publish(NodeEvent::PositionChanged { position })
            }
        }
    }

    async fn on_command(&mut self, command: LocalCommand) {
        match command {
            LocalCommand::Connect => self.connect().await,
            LocalCommand::AddTrack(track) => {
                self.publish_envelope(TOPIC_PLAYLIST, &Envelope::add(track))
            }
            LocalCommand::Transport(action) if action.is_transport() && action != Action::Seek => {
                self.publish_envelope(TOPIC_PLAYLIST, &Envelope::new(action))
            }
            LocalCommand::Transport(action) => {
                warn!("{} is not a transport control", action)
            }
            LocalCommand::Seek(position) => {
                self.publish_envelope(TOPIC_PLAYLIST, &Envelope::seek(position))
            }
            LocalCommand::RequestSync => {
                let request = Envelope::get_all(self.settings.sync_reply_topic.as_str());
                self.publish_envelope(TOPIC_PLAYLIST, &request);
            }
            LocalCommand::System(action) => self.system_request(action).await,
            LocalCommand::Publish { topic, payload } => {
                if let Err(e) = self.connection.publish(&topic, payload) {
                    warn!("Publish to {} failed: {}", topic, e);
                }
            }
        }
    }

    async fn system_request(&mut self, action: Action) {
        if action == Action::Install {
            self.send_bundle().await;
            return;
        }
        let Some(tracker) = &self.counterpart else {
            warn!("Lifecycle requests are only sent by the controller");
            return;
        };
        let request = match action {
            Action::Exist => tracker.query(),
            Action::Start | Action::Stop | Action::Uninstall => tracker.request(action),
            other => {
                warn!("{} is not a lifecycle action", other);
                return;
            }
        };
        self.publish_envelope(TOPIC_SYSTEM, &request);
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Best effort: failures are logged, never retried
    fn publish_envelope(&self, topic: &str, envelope: &Envelope) {
        let bytes = match encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("{} on {}: {}", envelope.action, topic, e);
                return;
            }
        };
        debug!("-> {} {}", topic, envelope.action);
        if let Err(e) = self.connection.publish(topic, bytes) {
            warn!("Publish of {} to {} failed: {}", envelope.action, topic, e);
        }
    }

    fn publish_connection_state(&self) {
        self.bus.publish(NodeEvent::ConnectionChanged {
            state: self.connection.state(),
            failures: self.connection.failures(),
        });
    }
}
