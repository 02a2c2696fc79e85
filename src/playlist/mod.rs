//! Playlist state and synchronization
//!
//! The controller owns the canonical [`Playlist`]; every other role keeps a
//! mirror rebuilt on `add_all` and appended to on `add`. See [`PlaylistEngine`].

mod engine;
mod player;
mod track;

pub use engine::{PlaylistEffect, PlaylistEngine, SyncRole};
pub use player::{LoggingPlayer, Player, PlayerCommand, PlayerEvent};
pub use track::Track;

use tracing::warn;

/// Ordered tracks plus the currently selected index.
///
/// Invariant: `current`, when set, is a valid index into `tracks`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Playlist {
    tracks: Vec<Track>,
    current: Option<usize>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current.and_then(|i| self.tracks.get(i))
    }

    /// Wire form of the current index (-1 = nothing selected)
    pub fn wire_index(&self) -> i64 {
        self.current.map_or(-1, |i| i as i64)
    }

    /// Append without deduplication
    pub fn push(&mut self, track: Track) {
        self.tracks.push(track);
    }

    /// Discard everything and rebuild from a snapshot.
    ///
    /// An index outside the new list leaves nothing selected.
    pub fn replace(&mut self, tracks: Vec<Track>, index: i64) {
        self.current = match usize::try_from(index) {
            Ok(i) if i < tracks.len() => Some(i),
            Ok(i) => {
                warn!("Snapshot index {} out of range for {} tracks", i, tracks.len());
                None
            }
            Err(_) if index == -1 => None,
            Err(_) => {
                warn!("Snapshot index {} is not a valid position", index);
                None
            }
        };
        self.tracks = tracks;
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.current = None;
    }

    /// Select the first track when nothing is selected. Returns whether the
    /// selection changed.
    pub fn select_first_if_unset(&mut self) -> bool {
        if self.current.is_none() && !self.tracks.is_empty() {
            self.current = Some(0);
            return true;
        }
        false
    }

    /// Move forward one track, stopping at the last. Returns whether the
    /// selection changed.
    pub fn select_next(&mut self) -> bool {
        let next = match self.current {
            None if !self.tracks.is_empty() => 0,
            Some(i) if i + 1 < self.tracks.len() => i + 1,
            _ => return false,
        };
        self.current = Some(next);
        true
    }

    /// Move back one track, stopping at the first.
    pub fn select_prev(&mut self) -> bool {
        match self.current {
            Some(i) if i > 0 => {
                self.current = Some(i - 1);
                true
            }
            _ => false,
        }
    }
}
