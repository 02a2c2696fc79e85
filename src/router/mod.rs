//! Topic routing
//!
//! Maps an inbound topic to the component responsible for it. Routing is a
//! pure function of the topic string and the router's active private topic,
//! which only changes when an `exist` transaction registers a new one.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Lifecycle requests, shared by every role
pub const TOPIC_SYSTEM: &str = "/system";
/// Shared playlist and transport commands
pub const TOPIC_PLAYLIST: &str = "/playlist";
/// Opaque sensor passthrough
pub const TOPIC_SENSOR: &str = "/sensor/infotainment";
/// Opaque passthrough to hosted content
pub const TOPIC_WEBAPP: &str = "/app/webapp";

static PLAYLIST_TOPIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/playlist(?:/\d+)?$").expect("valid regex"));

static PRIVATE_TOPIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[^/]+/\d+$").expect("valid regex"));

/// Per-install lifecycle response topic (`/<app>/<slot>`)
pub fn private_topic(app: &str, slot: u32) -> String {
    format!("/{}/{}", app, slot)
}

/// Per-session playlist topic (`/playlist/<slot>`)
pub fn playlist_session_topic(slot: u32) -> String {
    format!("{}/{}", TOPIC_PLAYLIST, slot)
}

/// Which component owns a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    System,
    Playlist,
    PrivateResponse,
    /// App-defined schema; forwarded without decoding
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid private topic '{0}': expected /<app>/<slot>")]
pub struct InvalidTopic(pub String);

/// Classifies topics. The active private topic takes precedence over the
/// playlist pattern: an app named `playlist` answers on `/playlist/1`, which
/// is also the controller's per-session playlist topic.
#[derive(Debug, Default)]
pub struct TopicRouter {
    active_private: Option<String>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, topic: &str) -> RouteClass {
        if topic == TOPIC_SYSTEM {
            return RouteClass::System;
        }
        if self.active_private.as_deref() == Some(topic) {
            return RouteClass::PrivateResponse;
        }
        if PLAYLIST_TOPIC.is_match(topic) {
            return RouteClass::Playlist;
        }
        RouteClass::Opaque
    }

    /// Make `topic` the active private topic.
    ///
    /// Returns the topic it replaced, if different, so the caller can
    /// unsubscribe from it.
    pub fn register_private(&mut self, topic: &str) -> Result<Option<String>, InvalidTopic> {
        if !PRIVATE_TOPIC.is_match(topic) {
            return Err(InvalidTopic(topic.to_string()));
        }
        if self.active_private.as_deref() == Some(topic) {
            return Ok(None);
        }
        Ok(self.active_private.replace(topic.to_string()))
    }

    pub fn active_private(&self) -> Option<&str> {
        self.active_private.as_deref()
    }

    pub fn clear_private(&mut self) -> Option<String> {
        self.active_private.take()
    }
}
