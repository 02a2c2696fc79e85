//! Notifications a node publishes to its local observers.
//!
//! These never go on the wire. A UI, dashboard or test subscribes to the
//! node's [`EventBus`](super::EventBus) and reacts to what the node saw and
//! did: connection changes, playlist updates, lifecycle transitions, and the
//! raw traffic a status view displays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionState;
use crate::lifecycle::AppLifecycleState;
use crate::playlist::Track;
use crate::protocol::{Action, Envelope};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum NodeEvent {
    // =========================================================================
    // Connection
    // =========================================================================
    /// Connection state changed
    ConnectionChanged {
        state: ConnectionState,
        /// Consecutive failed attempts
        failures: u32,
    },

    /// The reconnect policy wants a yes/no answer; reply with
    /// `NodeHandle::answer_retry`
    ReconnectRequested { failures: u32 },

    // =========================================================================
    // Playlist
    // =========================================================================
    /// Local playlist copy changed shape or selection
    PlaylistChanged {
        tracks: Vec<Track>,
        /// -1 when nothing is selected
        current_index: i64,
    },

    /// Seek position within the current track
    PositionChanged { position: f64 },

    /// A transport control was applied
    TransportObserved { action: Action },

    /// Media engine callback (controller only)
    PlayerStatus { playing: bool, success: bool },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// A hosted app changed lifecycle state (host: local slot; controller:
    /// its view of the head unit's app)
    AppStateChanged {
        app: String,
        state: AppLifecycleState,
    },

    /// A decoded envelope seen on a system or private topic
    SystemObserved {
        topic: String,
        envelope: Envelope,
        at: DateTime<Utc>,
    },

    /// Undecoded traffic on an app-defined topic
    Opaque { topic: String, payload: Vec<u8> },

    // =========================================================================
    // System
    // =========================================================================
    ShuttingDown,
}

impl NodeEvent {
    /// Event type as a string (for logging/filtering)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectionChanged { .. } => "connection_changed",
            Self::ReconnectRequested { .. } => "reconnect_requested",
            Self::PlaylistChanged { .. } => "playlist_changed",
            Self::PositionChanged { .. } => "position_changed",
            Self::TransportObserved { .. } => "transport_observed",
            Self::PlayerStatus { .. } => "player_status",
            Self::AppStateChanged { .. } => "app_state_changed",
            Self::SystemObserved { .. } => "system_observed",
            Self::Opaque { .. } => "opaque",
            Self::ShuttingDown => "shutting_down",
        }
    }

    pub fn is_playlist_event(&self) -> bool {
        matches!(
            self,
            Self::PlaylistChanged { .. }
                | Self::PositionChanged { .. }
                | Self::TransportObserved { .. }
                | Self::PlayerStatus { .. }
        )
    }
}
