//! Track value type shared by the playlist engine and the wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single playable item.
///
/// Tracks are immutable once constructed; an edit replaces the track rather
/// than mutating it. Equality is structural over every field, so two
/// identical tracks can legitimately appear in the same playlist.
///
/// The serde field names are the wire names (`track`, `artist`, `uri`,
/// `tracklength`) used both in `add_all` arrays and inline in `add` messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Track {
    #[serde(rename = "track")]
    name: String,
    artist: String,
    /// Opaque playback reference, may be empty
    #[serde(default)]
    uri: String,
    /// Length in whole seconds
    #[serde(rename = "tracklength", default)]
    length: u32,
}

impl Track {
    pub fn new(
        name: impl Into<String>,
        artist: impl Into<String>,
        uri: impl Into<String>,
        length: u32,
    ) -> Self {
        Self {
            name: name.into(),
            artist: artist.into(),
            uri: uri.into(),
            length,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn length(&self) -> u32 {
        self.length
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.name)
    }
}
