//! Hosted application lifecycle
//!
//! The head unit runs a [`LifecycleMachine`] that answers install, start,
//! stop, uninstall and exist requests from `/system`. The controller tracks
//! the far side of the same negotiation with a [`CounterpartTracker`].

mod counterpart;
mod machine;
mod store;

pub use counterpart::{CounterpartEffect, CounterpartTracker};
pub use machine::{LifecycleEffect, LifecycleMachine};
pub use store::{AppStore, StoreError, MAX_TREE_DEPTH};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one hosted-application slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppLifecycleState {
    /// Not queried yet
    #[default]
    Unknown,
    NotInstalled,
    InstallPending,
    Installed,
    StartPending,
    Running,
    Stopped,
}

impl AppLifecycleState {
    /// A transaction is in flight; further install/start/stop/uninstall are rejected
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::InstallPending | Self::StartPending)
    }

    pub fn is_installed(&self) -> bool {
        matches!(
            self,
            Self::Installed | Self::StartPending | Self::Running | Self::Stopped
        )
    }
}

impl fmt::Display for AppLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::NotInstalled => "not installed",
            Self::InstallPending => "install pending",
            Self::Installed => "installed",
            Self::StartPending => "start pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
