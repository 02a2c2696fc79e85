//! Hosted content collaborator
//!
//! The head unit shows hosted web apps in a view it does not own here. The
//! node tells it which page to load and forwards opaque app traffic to it;
//! page-load completion comes back as [`NodeInput::PageLoaded`].
//!
//! [`NodeInput::PageLoaded`]: crate::node::NodeInput::PageLoaded

use tracing::info;

use crate::node::NodeHandle;

/// Where hosted apps and the default screen are served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUrls {
    /// Prefix under which `<app>/index.html` is served
    pub base: String,
    pub start_screen: String,
}

impl ContentUrls {
    pub fn new(base: impl Into<String>, start_screen: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            start_screen: start_screen.into(),
        }
    }

    /// Entry point of a hosted app
    pub fn entry_url(&self, app: &str) -> String {
        format!("{}/{}/index.html", self.base.trim_end_matches('/'), app)
    }

    pub fn is_start_screen(&self, url: &str) -> bool {
        url == self.start_screen
    }
}

impl Default for ContentUrls {
    fn default() -> Self {
        Self::new("http://localhost:8080/", "about:blank")
    }
}

/// The view hosting web content. Calls must not block.
pub trait ContentHost: Send + 'static {
    fn load_url(&mut self, url: &str);

    /// Forward an undecoded message from an app-defined topic
    fn deliver(&mut self, topic: &str, payload: &[u8]);
}

/// Content host that only logs, and reports every load as complete.
pub struct LoggingContentHost {
    handle: Option<NodeHandle>,
}

impl LoggingContentHost {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Report page loads back to `handle`
    pub fn reporting_to(handle: NodeHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl Default for LoggingContentHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHost for LoggingContentHost {
    fn load_url(&mut self, url: &str) {
        info!("Content: load {}", url);
        if let Some(handle) = &self.handle {
            handle.page_loaded(url);
        }
    }

    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        info!("Content: {} <- {} bytes", topic, payload.len());
    }
}
