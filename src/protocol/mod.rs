//! Wire protocol for the shared bus
//!
//! Every decoded topic carries JSON objects of the shape
//! `{"action": "<enum>", "data": <string|JSON>, "index": <int>, "error": "<string>", "type": "response"}`.
//! Only `action` is required. `add` messages additionally carry one track's
//! fields (`track`, `artist`, `uri`, `tracklength`) inline at the top level.

mod codec;

pub use codec::{decode, encode, DecodeError, EncodeError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::playlist::Track;

/// `data` value of a response that completed
pub const DATA_SUCCESS: &str = "success";
/// `data` value of a response that failed; `error` carries the reason
pub const DATA_ERROR: &str = "error";
/// `data` value of a response whose outcome will follow in a later response
pub const DATA_PENDING: &str = "pending";

/// The closed action vocabulary. Values are case-sensitive literal tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Add,
    AddAll,
    Play,
    Pause,
    Next,
    Prev,
    Install,
    Uninstall,
    Start,
    Stop,
    Exist,
    GetAll,
    Seek,
}

impl Action {
    pub const ALL: [Action; 13] = [
        Action::Add,
        Action::AddAll,
        Action::Play,
        Action::Pause,
        Action::Next,
        Action::Prev,
        Action::Install,
        Action::Uninstall,
        Action::Start,
        Action::Stop,
        Action::Exist,
        Action::GetAll,
        Action::Seek,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::AddAll => "add_all",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Next => "next",
            Self::Prev => "prev",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Exist => "exist",
            Self::GetAll => "get_all",
            Self::Seek => "seek",
        }
    }

    /// Exact, case-sensitive lookup of a wire token.
    pub fn parse(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == token)
    }

    /// Actions negotiated on `/system` and answered on a private topic
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Install | Self::Uninstall | Self::Start | Self::Stop | Self::Exist
        )
    }

    /// Playback controls that never change the playlist's shape
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Play | Self::Pause | Self::Next | Self::Prev | Self::Seek
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of the optional `type` key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Response,
}

/// A key that is present yields `Some`, even when its value is `null`
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// One protocol message. Constructed, encoded, published and discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,

    /// Action-specific payload: an app name, a reply topic, a base64 archive,
    /// a seek position, an outcome token, or a JSON array of tracks.
    /// An explicit `"data": null` is kept as `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,

    /// Currently playing index on `add_all` (-1 = nothing selected)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,

    /// Inline track fields of an `add`
    #[serde(flatten)]
    pub track: Option<Track>,
}

impl Envelope {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            data: None,
            index: None,
            error: None,
            kind: None,
            track: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(Value::String(data.into()));
        self
    }

    pub fn with_index(mut self, index: i64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Mark as a response (`"type": "response"`)
    pub fn as_response(mut self) -> Self {
        self.kind = Some(MessageKind::Response);
        self
    }

    /// Response echoing `action` with an outcome token in `data`
    pub fn response(action: Action, outcome: &str) -> Self {
        Self::new(action).with_data(outcome).as_response()
    }

    /// Error response echoing `action`
    pub fn error_response(action: Action, message: impl Into<String>) -> Self {
        Self::response(action, DATA_ERROR).with_error(message)
    }

    /// Incremental add: the track's fields ride at the top level
    pub fn add(track: Track) -> Self {
        let mut envelope = Self::new(Action::Add);
        envelope.track = Some(track);
        envelope
    }

    /// Full snapshot: `data` is the ordered track array, `index` the current position
    pub fn add_all(tracks: &[Track], current: Option<usize>) -> Self {
        let mut envelope = Self::new(Action::AddAll);
        envelope.data = Some(Value::Array(
            tracks
                .iter()
                .filter_map(|t| serde_json::to_value(t).ok())
                .collect(),
        ));
        envelope.index = Some(current.map_or(-1, |i| i as i64));
        envelope
    }

    /// Full-sync request; the writer answers with `add_all` on `reply_topic`
    pub fn get_all(reply_topic: impl Into<String>) -> Self {
        Self::new(Action::GetAll).with_data(reply_topic)
    }

    pub fn seek(position: f64) -> Self {
        Self::new(Action::Seek).with_data(position.to_string())
    }

    pub fn is_response(&self) -> bool {
        self.kind == Some(MessageKind::Response)
    }

    /// `data` when it is a plain string
    pub fn data_str(&self) -> Option<&str> {
        match &self.data {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Decode the track array carried in `data`.
    ///
    /// Writers put the array directly in `data`; some peers send it as a
    /// string holding JSON. Both are accepted. A missing `data` is an empty
    /// snapshot.
    pub fn tracks(&self) -> Result<Vec<Track>, DecodeError> {
        match &self.data {
            None => Ok(Vec::new()),
            Some(value @ Value::Array(_)) => Vec::<Track>::deserialize(value)
                .map_err(|e| DecodeError::Malformed(format!("invalid track list: {}", e))),
            Some(Value::String(text)) => serde_json::from_str(text)
                .map_err(|e| DecodeError::Malformed(format!("invalid track list: {}", e))),
            Some(other) => Err(DecodeError::Malformed(format!(
                "track list must be an array, got {}",
                other
            ))),
        }
    }

    /// Seek position in seconds, from a string or numeric `data`
    pub fn position(&self) -> Option<f64> {
        let position: Option<f64> = match &self.data {
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(Value::Number(n)) => n.as_f64(),
            _ => None,
        };
        position.filter(|p| p.is_finite())
    }
}
