//! Controller-side view of the hosted app on the head unit
//!
//! Interprets `type=response` envelopes from the private topic. With
//! auto-provisioning enabled it drives exist -> install -> start on its own.

use tracing::{debug, info, warn};

use super::AppLifecycleState;
use crate::protocol::{Action, Envelope, DATA_ERROR, DATA_PENDING, DATA_SUCCESS};
use crate::router::private_topic;

#[derive(Debug, Clone, PartialEq)]
pub enum CounterpartEffect {
    /// Publish a lifecycle request on `/system`
    Request(Envelope),
    /// Read the local app bundle and send it as an `install`
    InstallFromBundle,
    /// The app is up; share the full playlist with it
    BroadcastPlaylist,
    /// The app went away; stop playback and drop the playlist
    StopPlayback,
    StateChanged(AppLifecycleState),
}

#[derive(Debug)]
pub struct CounterpartTracker {
    app: String,
    topic: String,
    state: AppLifecycleState,
    auto_provision: bool,
}

impl CounterpartTracker {
    pub fn new(app: impl Into<String>, slot: u32, auto_provision: bool) -> Self {
        let app = app.into();
        let topic = private_topic(&app, slot);
        Self {
            app,
            topic,
            state: AppLifecycleState::Unknown,
            auto_provision,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// Private topic the head unit answers on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> AppLifecycleState {
        self.state
    }

    /// The `exist` query published on connect
    pub fn query(&self) -> Envelope {
        Envelope::new(Action::Exist).with_data(self.app.as_str())
    }

    /// A start/stop/uninstall request for this app
    pub fn request(&self, action: Action) -> Envelope {
        Envelope::new(action).with_data(self.app.as_str())
    }

    /// An install request carrying a base64 archive
    pub fn install(&self, payload: String) -> Envelope {
        Envelope::new(Action::Install).with_data(payload)
    }

    pub fn on_response(&mut self, response: &Envelope) -> Vec<CounterpartEffect> {
        if !response.is_response() || !response.action.is_lifecycle() {
            return Vec::new();
        }
        let outcome = response.data_str().unwrap_or_default();
        let error = response.error.as_deref().unwrap_or("no reason given");
        let mut effects = Vec::new();

        match (response.action, outcome) {
            (Action::Exist, DATA_SUCCESS) => {
                self.transition(AppLifecycleState::Installed, &mut effects);
                if self.auto_provision {
                    effects.push(CounterpartEffect::Request(self.request(Action::Start)));
                }
            }
            (Action::Exist, DATA_ERROR) => {
                info!("{} is not installed on the head unit: {}", self.app, error);
                self.transition(AppLifecycleState::NotInstalled, &mut effects);
                if self.auto_provision {
                    effects.push(CounterpartEffect::InstallFromBundle);
                }
            }
            (Action::Install, DATA_PENDING) => {
                self.transition(AppLifecycleState::InstallPending, &mut effects);
            }
            (Action::Install, DATA_SUCCESS) => {
                self.transition(AppLifecycleState::Installed, &mut effects);
                if self.auto_provision {
                    effects.push(CounterpartEffect::Request(self.request(Action::Start)));
                }
            }
            (Action::Start, DATA_PENDING) => {
                self.transition(AppLifecycleState::StartPending, &mut effects);
            }
            (Action::Start, DATA_SUCCESS) => {
                info!("{} is running on the head unit", self.app);
                self.transition(AppLifecycleState::Running, &mut effects);
                effects.push(CounterpartEffect::BroadcastPlaylist);
            }
            (Action::Stop, DATA_SUCCESS) => {
                info!("{} stopped on the head unit", self.app);
                self.transition(AppLifecycleState::Stopped, &mut effects);
                effects.push(CounterpartEffect::StopPlayback);
            }
            (Action::Uninstall, DATA_SUCCESS) => {
                self.transition(AppLifecycleState::NotInstalled, &mut effects);
                effects.push(CounterpartEffect::StopPlayback);
            }
            (action, DATA_ERROR) => {
                warn!("{} of {} failed: {}", action, self.app, error);
                let fallback = match self.state {
                    AppLifecycleState::InstallPending => Some(AppLifecycleState::NotInstalled),
                    AppLifecycleState::StartPending => Some(AppLifecycleState::Installed),
                    _ => None,
                };
                // busy rejections leave the in-flight transaction's state alone
                if let Some(state) = fallback.filter(|_| !error.starts_with("busy")) {
                    self.transition(state, &mut effects);
                }
            }
            (action, other) => {
                debug!("Ignoring {} response with outcome '{}'", action, other);
            }
        }
        effects
    }

    fn transition(&mut self, state: AppLifecycleState, effects: &mut Vec<CounterpartEffect>) {
        if self.state != state {
            debug!("Counterpart {}: {} -> {}", self.app, self.state, state);
            self.state = state;
            effects.push(CounterpartEffect::StateChanged(state));
        }
    }
}
