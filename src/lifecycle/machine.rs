//! Head-unit lifecycle state machine
//!
//! Pure transition logic: every request or completion callback returns the
//! effects the node must carry out (publish a response, load a page, unpack
//! an archive). Responses go to the app's private topic with `type=response`
//! and the request's action echoed.
//!
//! One transaction per app is in flight at a time. A request that would
//! overlap a pending install or start is rejected with a `busy` error, except
//! that `stop` and `uninstall` cancel a pending start. A start that never sees
//! its page load is failed by [`LifecycleMachine::on_start_timeout`]. `exist`
//! is always answered but only moves an app between installed and not
//! installed.
//!
//! Only one app is on screen. Starting another one demotes the running app to
//! installed, and the start screen is loaded only when the app being stopped
//! or removed is the one displayed.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{AppLifecycleState, AppStore};
use crate::content::ContentUrls;
use crate::protocol::{Action, Envelope, DATA_PENDING, DATA_SUCCESS};
use crate::router::private_topic;

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEffect {
    Respond {
        topic: String,
        envelope: Envelope,
    },
    /// Make `topic` the active private topic, dropping `previous`
    SubscribePrivate {
        topic: String,
        previous: Option<String>,
    },
    LoadUrl(String),
    /// Decode and extract `payload`, then report back through
    /// [`LifecycleMachine::on_unpack_complete`]
    Unpack {
        app: String,
        topic: String,
        payload: String,
    },
    StateChanged {
        app: String,
        state: AppLifecycleState,
    },
    /// Arm the start timeout; report back through
    /// [`LifecycleMachine::on_start_timeout`] with the same `seq`
    StartTimer { app: String, seq: u64 },
}

/// App negotiated by the most recent `exist`
#[derive(Debug, Clone)]
struct ActiveApp {
    name: String,
    topic: String,
}

pub struct LifecycleMachine {
    store: AppStore,
    urls: ContentUrls,
    slot: u32,
    active: Option<ActiveApp>,
    states: HashMap<String, AppLifecycleState>,
    /// App whose start is waiting on a page load
    starting: Option<String>,
    /// App whose entry page is loaded or loading
    displayed: Option<String>,
    start_seq: u64,
}

impl LifecycleMachine {
    pub fn new(store: AppStore, urls: ContentUrls, slot: u32) -> Self {
        Self {
            store,
            urls,
            slot,
            active: None,
            states: HashMap::new(),
            starting: None,
            displayed: None,
            start_seq: 0,
        }
    }

    pub fn store(&self) -> &AppStore {
        &self.store
    }

    pub fn urls(&self) -> &ContentUrls {
        &self.urls
    }

    pub fn state(&self, app: &str) -> AppLifecycleState {
        self.states.get(app).copied().unwrap_or_default()
    }

    /// App whose entry page is on screen, or being loaded
    pub fn displayed(&self) -> Option<&str> {
        self.displayed.as_deref()
    }

    /// Name and private topic of the app negotiated by the last `exist`
    pub fn active_app(&self) -> Option<(&str, &str)> {
        self.active
            .as_ref()
            .map(|a| (a.name.as_str(), a.topic.as_str()))
    }

    /// Handle a request from `/system`
    pub fn handle_request(&mut self, request: &Envelope) -> Vec<LifecycleEffect> {
        if request.is_response() {
            debug!("Ignoring {} response on system topic", request.action);
            return Vec::new();
        }
        match request.action {
            Action::Exist => self.exist(request),
            Action::Install => self.install(request),
            Action::Start => self.start(request),
            Action::Stop => self.stop(request),
            Action::Uninstall => self.uninstall(request),
            other => {
                debug!("Ignoring non-lifecycle action {} on system topic", other);
                Vec::new()
            }
        }
    }

    /// Completion of an [`LifecycleEffect::Unpack`]
    pub fn on_unpack_complete(
        &mut self,
        app: &str,
        topic: &str,
        result: Result<(), String>,
    ) -> Vec<LifecycleEffect> {
        if self.state(app) != AppLifecycleState::InstallPending {
            warn!("Unpack of {} completed without a pending install", app);
            return Vec::new();
        }
        let mut effects = Vec::new();
        match result {
            Ok(()) => {
                info!("Install of {} complete", app);
                self.set_state(app, AppLifecycleState::Installed, &mut effects);
                effects.push(respond(topic, Envelope::response(Action::Install, DATA_SUCCESS)));
            }
            Err(reason) => {
                warn!("Install of {} failed: {}", app, reason);
                self.set_state(app, AppLifecycleState::NotInstalled, &mut effects);
                effects.push(respond(
                    topic,
                    Envelope::error_response(
                        Action::Install,
                        format!("installation of {} failed: {}", app, reason),
                    ),
                ));
            }
        }
        effects
    }

    /// Page-load callback from the content host
    pub fn on_page_loaded(&mut self, url: &str) -> Vec<LifecycleEffect> {
        if self.urls.is_start_screen(url) {
            debug!("Start screen loaded");
            return Vec::new();
        }
        let Some(app) = self.starting.take() else {
            debug!("Page {} loaded with no start pending", url);
            return Vec::new();
        };
        if self.state(&app) != AppLifecycleState::StartPending {
            return Vec::new();
        }
        info!("Application {} running ({})", app, url);
        let mut effects = Vec::new();
        self.displayed = Some(app.clone());
        self.set_state(&app, AppLifecycleState::Running, &mut effects);
        effects.push(respond(
            &private_topic(&app, self.slot),
            Envelope::response(Action::Start, DATA_SUCCESS),
        ));
        effects
    }

    /// The start timer armed by [`LifecycleEffect::StartTimer`] expired
    pub fn on_start_timeout(&mut self, app: &str, seq: u64) -> Vec<LifecycleEffect> {
        if seq != self.start_seq || self.starting.as_deref() != Some(app) {
            return Vec::new();
        }
        warn!("Start of {} timed out waiting for its page", app);
        let mut effects = Vec::new();
        self.release(app, &mut effects);
        let state = if self.store.exists(app) {
            AppLifecycleState::Installed
        } else {
            AppLifecycleState::NotInstalled
        };
        self.set_state(app, state, &mut effects);
        effects.push(respond(
            &private_topic(app, self.slot),
            Envelope::error_response(Action::Start, format!("start of {} timed out", app)),
        ));
        effects
    }

    fn exist(&mut self, request: &Envelope) -> Vec<LifecycleEffect> {
        let Some(app) = request.data_str().filter(|a| self.store.app_dir(a).is_ok()) else {
            warn!("Dropping exist with invalid app name {:?}", request.data);
            return Vec::new();
        };
        let topic = private_topic(app, self.slot);
        let mut effects = Vec::new();

        let previous = self.active.replace(ActiveApp {
            name: app.to_string(),
            topic: topic.clone(),
        });
        let previous_topic = previous.map(|p| p.topic);
        if previous_topic.as_deref() != Some(topic.as_str()) {
            effects.push(LifecycleEffect::SubscribePrivate {
                topic: topic.clone(),
                previous: previous_topic,
            });
        }

        let present = self.store.exists(app);
        let state = self.state(app);
        if present && !state.is_pending() && state != AppLifecycleState::Running {
            self.set_state(app, AppLifecycleState::Installed, &mut effects);
        } else if !present && state != AppLifecycleState::InstallPending {
            // Removed behind our back; nothing left to show
            self.release(app, &mut effects);
            self.set_state(app, AppLifecycleState::NotInstalled, &mut effects);
        }

        let response = if present {
            Envelope::response(Action::Exist, DATA_SUCCESS)
        } else {
            Envelope::error_response(Action::Exist, format!("application {} does not exist", app))
        };
        effects.push(respond(&topic, response));
        effects
    }

    fn install(&mut self, request: &Envelope) -> Vec<LifecycleEffect> {
        // The archive rides in `data`, so the target is the app from the last exist
        let Some(ActiveApp { name: app, topic }) = self.active.clone() else {
            warn!("Dropping install: no application negotiated via exist");
            return Vec::new();
        };
        let state = self.state(&app);
        if let Some(busy) = self.busy(&app, Action::Install) {
            return vec![respond(&topic, busy)];
        }
        if state == AppLifecycleState::Running {
            return vec![respond(
                &topic,
                Envelope::error_response(
                    Action::Install,
                    format!("application {} is running; stop it first", app),
                ),
            )];
        }
        let payload = match request.data_str() {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => {
                return vec![respond(
                    &topic,
                    Envelope::error_response(Action::Install, "install payload missing"),
                )]
            }
        };

        info!("Installing {} ({} bytes of payload)", app, payload.len());
        let mut effects = Vec::new();
        self.set_state(&app, AppLifecycleState::InstallPending, &mut effects);
        effects.push(respond(&topic, Envelope::response(Action::Install, DATA_PENDING)));
        effects.push(LifecycleEffect::Unpack {
            app,
            topic,
            payload,
        });
        effects
    }

    fn start(&mut self, request: &Envelope) -> Vec<LifecycleEffect> {
        let Some(app) = self.target(request) else {
            warn!("Dropping start: no target application");
            return Vec::new();
        };
        let topic = private_topic(&app, self.slot);
        if let Some(busy) = self.busy(&app, Action::Start) {
            return vec![respond(&topic, busy)];
        }
        if let Some(other) = self.starting.as_ref().filter(|s| **s != app) {
            return vec![respond(
                &topic,
                Envelope::error_response(
                    Action::Start,
                    format!("busy: start of {} in progress", other),
                ),
            )];
        }

        let mut effects = Vec::new();
        if !self.store.exists(&app) {
            self.set_state(&app, AppLifecycleState::NotInstalled, &mut effects);
            effects.push(respond(
                &topic,
                Envelope::error_response(
                    Action::Start,
                    format!("application {} is not installed", app),
                ),
            ));
            return effects;
        }

        info!("Starting {}", app);
        let replaced: Vec<String> = self
            .states
            .iter()
            .filter(|(name, state)| **state == AppLifecycleState::Running && **name != app)
            .map(|(name, _)| name.clone())
            .collect();
        for other in replaced {
            info!("{} replaced on screen by {}", other, app);
            self.set_state(&other, AppLifecycleState::Installed, &mut effects);
        }

        self.start_seq += 1;
        self.starting = Some(app.clone());
        self.displayed = Some(app.clone());
        self.set_state(&app, AppLifecycleState::StartPending, &mut effects);
        effects.push(LifecycleEffect::LoadUrl(self.urls.entry_url(&app)));
        effects.push(LifecycleEffect::StartTimer {
            app: app.clone(),
            seq: self.start_seq,
        });
        effects.push(respond(&topic, Envelope::response(Action::Start, DATA_PENDING)));
        effects
    }

    fn stop(&mut self, request: &Envelope) -> Vec<LifecycleEffect> {
        let Some(app) = self.target(request) else {
            warn!("Dropping stop: no target application");
            return Vec::new();
        };
        let topic = private_topic(&app, self.slot);
        if let Some(busy) = self.busy(&app, Action::Stop) {
            return vec![respond(&topic, busy)];
        }

        let mut effects = Vec::new();
        self.release(&app, &mut effects);
        if !self.store.exists(&app) {
            self.set_state(&app, AppLifecycleState::NotInstalled, &mut effects);
            effects.push(respond(
                &topic,
                Envelope::error_response(
                    Action::Stop,
                    format!("application {} is not installed", app),
                ),
            ));
            return effects;
        }

        info!("Stopping {}", app);
        self.set_state(&app, AppLifecycleState::Installed, &mut effects);
        effects.push(respond(&topic, Envelope::response(Action::Stop, DATA_SUCCESS)));
        effects
    }

    fn uninstall(&mut self, request: &Envelope) -> Vec<LifecycleEffect> {
        let Some(app) = self.target(request) else {
            warn!("Dropping uninstall: no target application");
            return Vec::new();
        };
        let topic = private_topic(&app, self.slot);
        if let Some(busy) = self.busy(&app, Action::Uninstall) {
            return vec![respond(&topic, busy)];
        }

        let mut effects = Vec::new();
        self.release(&app, &mut effects);
        match self.store.remove(&app) {
            Ok(removed) => {
                info!("Uninstalled {} (tree present: {})", app, removed);
                self.set_state(&app, AppLifecycleState::NotInstalled, &mut effects);
                effects.push(respond(
                    &topic,
                    Envelope::response(Action::Uninstall, DATA_SUCCESS),
                ));
            }
            Err(e) => {
                warn!("Uninstall of {} failed: {}", app, e);
                let state = if self.store.exists(&app) {
                    AppLifecycleState::Installed
                } else {
                    AppLifecycleState::NotInstalled
                };
                self.set_state(&app, state, &mut effects);
                effects.push(respond(
                    &topic,
                    Envelope::error_response(
                        Action::Uninstall,
                        format!("uninstall of {} failed: {}", app, e),
                    ),
                ));
            }
        }
        effects
    }

    /// App named in `data`, else the one from the last exist
    fn target(&self, request: &Envelope) -> Option<String> {
        match request.data_str().filter(|d| !d.is_empty()) {
            Some(app) if self.store.app_dir(app).is_ok() => Some(app.to_string()),
            Some(app) => {
                warn!("Invalid application name '{}'", app);
                None
            }
            None => self.active.as_ref().map(|a| a.name.clone()),
        }
    }

    /// Cancel a pending start of `app` and take it off screen
    fn release(&mut self, app: &str, effects: &mut Vec<LifecycleEffect>) {
        if self.starting.as_deref() == Some(app) {
            info!("Cancelling start of {}", app);
            self.starting = None;
        }
        if self.displayed.as_deref() == Some(app) {
            self.displayed = None;
            effects.push(LifecycleEffect::LoadUrl(self.urls.start_screen.clone()));
        }
    }

    fn busy(&self, app: &str, action: Action) -> Option<Envelope> {
        let state = self.state(app);
        let cancels_start = state == AppLifecycleState::StartPending
            && matches!(action, Action::Stop | Action::Uninstall);
        if !state.is_pending() || cancels_start {
            return None;
        }
        warn!("Rejecting {} of {}: {}", action, app, state);
        Some(Envelope::error_response(
            action,
            format!("busy: {} is {}", app, state),
        ))
    }

    fn set_state(
        &mut self,
        app: &str,
        state: AppLifecycleState,
        effects: &mut Vec<LifecycleEffect>,
    ) {
        let previous = self.states.insert(app.to_string(), state);
        if previous != Some(state) {
            debug!("{}: {:?} -> {}", app, previous, state);
            effects.push(LifecycleEffect::StateChanged {
                app: app.to_string(),
                state,
            });
        }
    }
}

fn respond(topic: &str, envelope: Envelope) -> LifecycleEffect {
    LifecycleEffect::Respond {
        topic: topic.to_string(),
        envelope,
    }
}
