//! Media engine collaborator
//!
//! Playback and decoding are out of scope; the node only issues commands
//! and consumes the engine's completion callbacks as [`PlayerEvent`]s.

use tracing::info;

use super::Track;

/// Command the controller's playlist engine wants executed
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Play(Track),
    Pause,
    /// Position in seconds within the current track
    Seek(f64),
    Stop,
}

/// Callback from the media engine, fed back through the node's inbox
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Started { success: bool },
    Paused { success: bool },
    Position(f64),
    EndOfTrack,
}

/// The media engine. Calls must not block; results arrive later as
/// [`PlayerEvent`]s.
pub trait Player: Send + 'static {
    fn play(&mut self, track: &Track);
    fn pause(&mut self);
    fn seek(&mut self, position: f64);
    fn stop(&mut self);

    fn execute(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Play(track) => self.play(&track),
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Seek(position) => self.seek(position),
            PlayerCommand::Stop => self.stop(),
        }
    }
}

/// Player that only logs. Used by roles without a media engine and by the
/// standalone binary.
#[derive(Debug, Default)]
pub struct LoggingPlayer;

impl Player for LoggingPlayer {
    fn play(&mut self, track: &Track) {
        info!("Player: play {} ({})", track, track.uri());
    }

    fn pause(&mut self) {
        info!("Player: pause");
    }

    fn seek(&mut self, position: f64) {
        info!("Player: seek to {:.1}s", position);
    }

    fn stop(&mut self) {
        info!("Player: stop");
    }
}
