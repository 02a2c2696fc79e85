//! Infotainment Link
//!
//! Coordinates a vehicle head unit, a media device, playlist remotes and
//! status dashboards over a shared MQTT broker.
//!
//! This library provides:
//! - JSON envelope codec and topic classification
//! - Hosted app lifecycle (install, start, stop, uninstall) on the head unit
//! - Playlist replication between the media device and its remotes
//! - Connection management with configurable reconnect policy

pub mod bus;
pub mod config;
pub mod connection;
pub mod content;
pub mod lifecycle;
pub mod node;
pub mod playlist;
pub mod protocol;
pub mod router;
pub mod transport;
