//! Playlist synchronization engine
//!
//! Applies playlist-class envelopes strictly in arrival order. The writer
//! (controller) additionally answers `get_all` and drives the player; mirrors
//! only track shape and selection.
//!
//! The writer is subscribed to the topics it answers on, so each snapshot it
//! publishes comes back to it. Those echoes are recognised and skipped: by the
//! time one arrives the writer may already have applied later edits, and
//! replacing its list with the older snapshot would drop them.

use std::collections::VecDeque;
use tracing::{debug, warn};

use super::{Playlist, PlayerCommand, Track};
use crate::protocol::{Action, Envelope};
use crate::router::TOPIC_PLAYLIST;

/// Own snapshots remembered while waiting for their echo. Answers sent to
/// topics the writer does not listen on never come back and age out.
const SNAPSHOT_ECHO_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// Single writer of truth; owns the player
    Writer,
    Mirror,
}

/// Side effect requested by [`PlaylistEngine::apply`]
#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistEffect {
    Publish { topic: String, envelope: Envelope },
    Player(PlayerCommand),
    /// Tracks or selection changed
    Changed,
    Position(f64),
    /// A transport control was observed
    Transport(Action),
}

#[derive(Debug)]
pub struct PlaylistEngine {
    role: SyncRole,
    playlist: Playlist,
    playing: bool,
    /// Snapshots published by this writer whose echo has not arrived yet
    sent_snapshots: VecDeque<Envelope>,
}

impl PlaylistEngine {
    pub fn new(role: SyncRole) -> Self {
        Self {
            role,
            playlist: Playlist::new(),
            playing: false,
            sent_snapshots: VecDeque::new(),
        }
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Full snapshot of the local copy
    pub fn snapshot(&self) -> Envelope {
        Envelope::add_all(self.playlist.tracks(), self.playlist.current())
    }

    /// Drop everything and stop the player
    /// Publish the current snapshot on `topic`. The writer remembers it so
    /// the echo is not applied on top of newer edits.
    pub fn broadcast(&mut self, topic: &str) -> PlaylistEffect {
        let envelope = self.snapshot();
        if self.role == SyncRole::Writer {
            if self.sent_snapshots.len() == SNAPSHOT_ECHO_WINDOW {
                self.sent_snapshots.pop_front();
            }
            self.sent_snapshots.push_back(envelope.clone());
        }
        PlaylistEffect::Publish {
            topic: topic.to_string(),
            envelope,
        }
    }

    /// Drop the playlist and stop the player
    pub fn reset(&mut self) -> Vec<PlaylistEffect> {
        let mut effects = Vec::new();
        if self.role == SyncRole::Writer && self.playing {
            effects.push(PlaylistEffect::Player(PlayerCommand::Stop));
        }
        self.playing = false;
        if !self.playlist.is_empty() || self.playlist.current().is_some() {
            self.playlist.clear();
            effects.push(PlaylistEffect::Changed);
        }
        effects
    }

    pub fn apply(&mut self, envelope: &Envelope) -> Vec<PlaylistEffect> {
        match envelope.action {
            Action::Add => self.apply_add(envelope),
            Action::AddAll => self.apply_add_all(envelope),
            Action::GetAll => self.answer_get_all(envelope),
            Action::Play => self.apply_play(),
            Action::Pause => self.apply_pause(),
            Action::Next | Action::Prev => self.apply_step(envelope.action),
            Action::Seek => self.apply_seek(envelope),
            other => {
                debug!("Ignoring lifecycle action {} on playlist topic", other);
                Vec::new()
            }
        }
    }

    fn apply_add(&mut self, envelope: &Envelope) -> Vec<PlaylistEffect> {
        match &envelope.track {
            Some(track) => {
                debug!("Appending {}", track);
                self.playlist.push(track.clone());
                vec![PlaylistEffect::Changed]
            }
            None => {
                warn!("Dropping add without track fields");
                Vec::new()
            }
        }
    }

    fn apply_add_all(&mut self, envelope: &Envelope) -> Vec<PlaylistEffect> {
        if let Some(pos) = self.sent_snapshots.iter().position(|s| s == envelope) {
            // Echo of our own snapshot; anything older is lost in transit
            self.sent_snapshots.drain(..=pos);
            if self.snapshot() == *envelope {
                return Vec::new();
            }
            // Edits overtook the snapshot; mirrors that applied it need the
            // current list
            debug!("Snapshot echo is stale, rebroadcasting");
            return vec![self.broadcast(TOPIC_PLAYLIST)];
        }
        let tracks: Vec<Track> = match envelope.tracks() {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("Dropping add_all: {}", e);
                return Vec::new();
            }
        };
        debug!(
            "Rebuilding playlist from snapshot ({} tracks, index {:?})",
            tracks.len(),
            envelope.index
        );
        self.playlist.replace(tracks, envelope.index.unwrap_or(-1));
        vec![PlaylistEffect::Changed]
    }

    fn answer_get_all(&mut self, envelope: &Envelope) -> Vec<PlaylistEffect> {
        if self.role != SyncRole::Writer {
            return Vec::new();
        }
        let topic = envelope
            .data_str()
            .filter(|t| !t.is_empty())
            .unwrap_or(TOPIC_PLAYLIST)
            .to_string();
        vec![self.broadcast(&topic)]
    }

    fn apply_play(&mut self) -> Vec<PlaylistEffect> {
        let mut effects = vec![PlaylistEffect::Transport(Action::Play)];
        if self.playlist.select_first_if_unset() {
            effects.push(PlaylistEffect::Changed);
        }
        if let Some(track) = self.playlist.current_track() {
            self.playing = true;
            if self.role == SyncRole::Writer {
                effects.push(PlaylistEffect::Player(PlayerCommand::Play(track.clone())));
            }
        }
        effects
    }

    fn apply_pause(&mut self) -> Vec<PlaylistEffect> {
        let mut effects = vec![PlaylistEffect::Transport(Action::Pause)];
        if self.role == SyncRole::Writer {
            effects.push(PlaylistEffect::Player(PlayerCommand::Pause));
        }
        self.playing = false;
        effects
    }

    fn apply_step(&mut self, action: Action) -> Vec<PlaylistEffect> {
        let mut effects = vec![PlaylistEffect::Transport(action)];
        let moved = if action == Action::Next {
            self.playlist.select_next()
        } else {
            self.playlist.select_prev()
        };
        if !moved {
            debug!("{} at playlist boundary", action);
            return effects;
        }
        effects.push(PlaylistEffect::Changed);
        if self.playing && self.role == SyncRole::Writer {
            if let Some(track) = self.playlist.current_track() {
                effects.push(PlaylistEffect::Player(PlayerCommand::Play(track.clone())));
            }
        }
        effects
    }

    fn apply_seek(&mut self, envelope: &Envelope) -> Vec<PlaylistEffect> {
        let Some(position) = envelope.position() else {
            warn!("Dropping seek with invalid position {:?}", envelope.data);
            return Vec::new();
        };
        let mut effects = vec![
            PlaylistEffect::Transport(Action::Seek),
            PlaylistEffect::Position(position),
        ];
        if self.role == SyncRole::Writer {
            effects.push(PlaylistEffect::Player(PlayerCommand::Seek(position)));
        }
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(name: &str) -> Track {
        Track::new(name, "artist", format!("uri:{}", name), 100)
    }

    fn has_play(effects: &[PlaylistEffect], name: &str) -> bool {
        effects.iter().any(|e| {
            matches!(e, PlaylistEffect::Player(PlayerCommand::Play(t)) if t.name() == name)
        })
    }

    #[test]
    fn test_add_all_then_add_converges() {
        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        mirror.apply(&Envelope::add_all(&[track("A"), track("B")], Some(0)));
        mirror.apply(&Envelope::add(track("C")));
        assert_eq!(
            mirror.playlist().tracks(),
            &[track("A"), track("B"), track("C")]
        );
        assert_eq!(mirror.playlist().current(), Some(0));
    }

    #[test]
    fn test_add_all_discards_previous_mirror() {
        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        mirror.apply(&Envelope::add(track("stale")));
        mirror.apply(&Envelope::add_all(&[track("A")], None));
        assert_eq!(mirror.playlist().tracks(), &[track("A")]);
        assert_eq!(mirror.playlist().wire_index(), -1);
    }

    #[test]
    fn test_add_duplicates_are_kept() {
        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        mirror.apply(&Envelope::add(track("A")));
        mirror.apply(&Envelope::add(track("A")));
        assert_eq!(mirror.playlist().len(), 2);
    }

    #[test]
    fn test_writer_answers_get_all_on_reply_topic() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add_all(&[track("A"), track("B")], Some(1)));

        let effects = writer.apply(&Envelope::get_all("/playlist/remote"));
        match effects.as_slice() {
            [PlaylistEffect::Publish { topic, envelope }] => {
                assert_eq!(topic, "/playlist/remote");
                assert_eq!(envelope.action, Action::AddAll);
                assert_eq!(envelope.index, Some(1));
                assert_eq!(envelope.tracks().unwrap(), vec![track("A"), track("B")]);
            }
            other => panic!("unexpected effects: {:?}", other),
        }
    }

    #[test]
    fn test_get_all_without_reply_topic_uses_shared_topic() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        let effects = writer.apply(&Envelope::new(Action::GetAll));
        assert!(matches!(
            effects.as_slice(),
            [PlaylistEffect::Publish { topic, .. }] if topic == TOPIC_PLAYLIST
        ));
    }

    #[test]
    fn test_mirror_ignores_get_all() {
        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        assert!(mirror.apply(&Envelope::get_all("/playlist")).is_empty());
    }

    #[test]
    fn test_writer_play_selects_first_and_drives_player() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add_all(&[track("A"), track("B")], None));
        let effects = writer.apply(&Envelope::new(Action::Play));
        assert!(has_play(&effects, "A"));
        assert!(writer.is_playing());
        assert_eq!(writer.playlist().current(), Some(0));
    }

    #[test]
    fn test_mirror_never_drives_player() {
        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        mirror.apply(&Envelope::add_all(&[track("A"), track("B")], Some(0)));
        for action in [Action::Play, Action::Next, Action::Pause] {
            let effects = mirror.apply(&Envelope::new(action));
            assert!(!effects
                .iter()
                .any(|e| matches!(e, PlaylistEffect::Player(_))));
        }
        assert_eq!(mirror.playlist().current(), Some(1));
    }

    #[test]
    fn test_next_clamps_at_end() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add_all(&[track("A"), track("B")], Some(0)));
        writer.apply(&Envelope::new(Action::Play));

        let effects = writer.apply(&Envelope::new(Action::Next));
        assert!(has_play(&effects, "B"));

        let effects = writer.apply(&Envelope::new(Action::Next));
        assert_eq!(effects, vec![PlaylistEffect::Transport(Action::Next)]);
        assert_eq!(writer.playlist().current(), Some(1));
    }

    #[test]
    fn test_prev_clamps_at_start() {
        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        mirror.apply(&Envelope::add_all(&[track("A")], Some(0)));
        mirror.apply(&Envelope::new(Action::Prev));
        assert_eq!(mirror.playlist().current(), Some(0));
    }

    #[test]
    fn test_seek_does_not_move_selection() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add_all(&[track("A"), track("B")], Some(1)));
        let effects = writer.apply(&Envelope::seek(33.0));
        assert!(effects.contains(&PlaylistEffect::Position(33.0)));
        assert!(effects.contains(&PlaylistEffect::Player(PlayerCommand::Seek(33.0))));
        assert_eq!(writer.playlist().current(), Some(1));

        assert!(writer.apply(&Envelope::new(Action::Seek).with_data("x")).is_empty());
    }

    #[test]
    fn test_invalid_add_all_leaves_mirror_untouched() {
        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        mirror.apply(&Envelope::add(track("A")));
        let bad = Envelope::new(Action::AddAll).with_data("not a list");
        assert!(mirror.apply(&bad).is_empty());
        assert_eq!(mirror.playlist().tracks(), &[track("A")]);
    }

    #[test]
    fn test_reset_stops_writer() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add_all(&[track("A")], None));
        writer.apply(&Envelope::new(Action::Play));
        let effects = writer.reset();
        assert!(effects.contains(&PlaylistEffect::Player(PlayerCommand::Stop)));
        assert!(effects.contains(&PlaylistEffect::Changed));
        assert!(writer.playlist().is_empty());
        assert!(!writer.is_playing());
    }

    fn published(effects: &[PlaylistEffect]) -> Envelope {
        match effects {
            [PlaylistEffect::Publish { envelope, .. }] => envelope.clone(),
            other => panic!("expected one publish, got {:?}", other),
        }
    }

    #[test]
    fn test_writer_keeps_edits_made_before_snapshot_echo() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add_all(&[track("A"), track("B")], None));
        let snapshot = published(&writer.apply(&Envelope::get_all("/playlist")));

        writer.apply(&Envelope::add(track("C")));
        let effects = writer.apply(&snapshot);

        let expected = [track("A"), track("B"), track("C")];
        assert_eq!(writer.playlist().tracks(), &expected);
        let correction = published(&effects);
        assert_eq!(correction.tracks().unwrap(), expected.to_vec());
    }

    #[test]
    fn test_writer_skips_current_snapshot_echo() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add(track("A")));
        let snapshot = published(&writer.apply(&Envelope::get_all("")));
        assert!(writer.apply(&snapshot).is_empty());

        // The same list from another peer is applied normally
        assert_eq!(writer.apply(&snapshot), vec![PlaylistEffect::Changed]);
    }

    #[test]
    fn test_writer_applies_foreign_add_all() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        writer.apply(&Envelope::add(track("A")));
        writer.apply(&Envelope::get_all("/playlist"));
        writer.apply(&Envelope::add_all(&[track("X")], Some(0)));
        assert_eq!(writer.playlist().tracks(), &[track("X")]);
    }

    #[test]
    fn test_snapshot_memory_is_bounded() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        for _ in 0..(SNAPSHOT_ECHO_WINDOW + 4) {
            writer.broadcast("/elsewhere");
        }
        assert_eq!(writer.sent_snapshots.len(), SNAPSHOT_ECHO_WINDOW);

        let mut mirror = PlaylistEngine::new(SyncRole::Mirror);
        mirror.broadcast(TOPIC_PLAYLIST);
        assert!(mirror.sent_snapshots.is_empty());
    }

    #[test]
    fn test_lifecycle_actions_ignored() {
        let mut writer = PlaylistEngine::new(SyncRole::Writer);
        assert!(writer.apply(&Envelope::new(Action::Install)).is_empty());
    }
}
