//! Inbound events for the node actor, and the handle that sends them.

use tokio::sync::mpsc;
use tracing::debug;

use crate::playlist::{PlayerEvent, Track};
use crate::protocol::Action;
use crate::transport::TransportEvent;

/// Everything a node reacts to arrives as one of these, through one queue.
#[derive(Debug)]
pub enum NodeInput {
    Transport(TransportEvent),
    /// An install archive finished extracting
    UnpackComplete {
        app: String,
        topic: String,
        result: Result<(), String>,
    },
    /// The content host finished loading a page
    PageLoaded { url: String },
    /// A start's page-load deadline passed
    StartTimedOut { app: String, seq: u64 },
    Player(PlayerEvent),
    /// Answer to a reconnect prompt, or a backoff timer firing
    RetryAnswer(bool),
    Command(LocalCommand),
    Shutdown,
}

/// Requests from the local UI
#[derive(Debug, Clone, PartialEq)]
pub enum LocalCommand {
    /// Connect now, regardless of the reconnect policy
    Connect,
    AddTrack(Track),
    /// `play`, `pause`, `next` or `prev`
    Transport(Action),
    Seek(f64),
    /// Lifecycle request for the configured app (controller)
    System(Action),
    /// Ask the writer for a full snapshot
    RequestSync,
    /// Raw publish on an app-defined topic
    Publish { topic: String, payload: Vec<u8> },
}

/// Cloneable sender side of a node's inbox
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeInput>,
}

impl NodeHandle {
    pub(crate) fn new(tx: mpsc::Sender<NodeInput>) -> Self {
        Self { tx }
    }

    /// Queue an input. Returns `false` once the node has stopped.
    pub async fn send(&self, input: NodeInput) -> bool {
        self.tx.send(input).await.is_ok()
    }

    pub async fn command(&self, command: LocalCommand) -> bool {
        self.send(NodeInput::Command(command)).await
    }

    pub async fn connect(&self) -> bool {
        self.command(LocalCommand::Connect).await
    }

    pub async fn add_track(&self, track: Track) -> bool {
        self.command(LocalCommand::AddTrack(track)).await
    }

    pub async fn transport(&self, action: Action) -> bool {
        self.command(LocalCommand::Transport(action)).await
    }

    pub async fn seek(&self, position: f64) -> bool {
        self.command(LocalCommand::Seek(position)).await
    }

    pub async fn request_sync(&self) -> bool {
        self.command(LocalCommand::RequestSync).await
    }

    pub async fn system(&self, action: Action) -> bool {
        self.command(LocalCommand::System(action)).await
    }

    pub async fn answer_retry(&self, retry: bool) -> bool {
        self.send(NodeInput::RetryAnswer(retry)).await
    }

    pub async fn player_event(&self, event: PlayerEvent) -> bool {
        self.send(NodeInput::Player(event)).await
    }

    /// Report a finished page load. Safe to call from inside the node's own
    /// processing: delivery happens on a separate task.
    pub fn page_loaded(&self, url: &str) {
        let tx = self.tx.clone();
        let input = NodeInput::PageLoaded {
            url: url.to_string(),
        };
        tokio::spawn(async move {
            if tx.send(input).await.is_err() {
                debug!("Page load reported after node stopped");
            }
        });
    }

    /// Ask the node to tear down its session and stop
    pub async fn shutdown(&self) -> bool {
        self.send(NodeInput::Shutdown).await
    }
}
