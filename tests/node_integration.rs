//! Node-level integration tests
//!
//! Runs real node actors against the in-process broker. These tests verify:
//! - Lifecycle request/response traffic on `/system` and private topics
//! - What the head unit shows across start, stop, uninstall and app switches
//! - Playlist convergence between the controller and its mirrors
//! - Reconnect behavior (backoff, ask, no duplicate delivery)
//! - Host and controller provisioning an app end to end

use std::io::{Cursor, Write};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use infotainment_link::bus::{create_bus, NodeEvent};
use infotainment_link::connection::{ConnectionState, ReconnectMode, ReconnectPolicy};
use infotainment_link::content::{ContentHost, LoggingContentHost};
use infotainment_link::lifecycle::AppLifecycleState;
use infotainment_link::node::{Node, NodeHandle, NodeSettings, Role};
use infotainment_link::playlist::Track;
use infotainment_link::protocol::{
    decode, encode, Action, Envelope, DATA_ERROR, DATA_PENDING, DATA_SUCCESS,
};
use infotainment_link::transport::MemoryBroker;

// =============================================================================
// Test utilities
// =============================================================================

const WAIT_MS: u64 = 2_000;

struct TestNode {
    handle: NodeHandle,
    events: broadcast::Receiver<NodeEvent>,
    task: JoinHandle<()>,
}

impl TestNode {
    async fn stop(self) {
        self.handle.shutdown().await;
        let _ = timeout(Duration::from_millis(WAIT_MS), self.task).await;
    }
}

fn settings(role: Role) -> NodeSettings {
    NodeSettings {
        role,
        reconnect: ReconnectPolicy::backoff(Duration::from_millis(10), Duration::from_millis(40)),
        ..NodeSettings::default()
    }
}

fn spawn_node(broker: &MemoryBroker, client_id: &str, settings: NodeSettings) -> TestNode {
    let bus = create_bus();
    let events = bus.subscribe();
    let (node, handle) = Node::new(settings, std::sync::Arc::new(broker.connector(client_id)), bus);
    let node = node.with_content_host(LoggingContentHost::reporting_to(handle.clone()));
    let task = tokio::spawn(node.run());
    TestNode {
        handle,
        events,
        task,
    }
}

/// Wait for a specific event with timeout
async fn expect_event<F>(
    rx: &mut broadcast::Receiver<NodeEvent>,
    predicate: F,
    timeout_ms: u64,
) -> Option<NodeEvent>
where
    F: Fn(&NodeEvent) -> bool,
{
    let deadline = Duration::from_millis(timeout_ms);
    match timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    {
        Ok(event) => event,
        Err(_) => None,
    }
}

async fn expect_connected(node: &mut TestNode) {
    let event = expect_event(
        &mut node.events,
        |e| {
            matches!(
                e,
                NodeEvent::ConnectionChanged {
                    state: ConnectionState::Connected,
                    ..
                }
            )
        },
        WAIT_MS,
    )
    .await;
    assert!(event.is_some(), "node never connected");
}

async fn expect_playlist(node: &mut TestNode, len: usize) -> Vec<Track> {
    match expect_event(
        &mut node.events,
        |e| matches!(e, NodeEvent::PlaylistChanged { tracks, .. } if tracks.len() == len),
        WAIT_MS,
    )
    .await
    {
        Some(NodeEvent::PlaylistChanged { tracks, .. }) => tracks,
        other => panic!("expected playlist of {} tracks, got {:?}", len, other),
    }
}

async fn expect_app_state(node: &mut TestNode, wanted: AppLifecycleState) {
    let event = expect_event(
        &mut node.events,
        |e| matches!(e, NodeEvent::AppStateChanged { state, .. } if *state == wanted),
        WAIT_MS,
    )
    .await;
    assert!(event.is_some(), "app never reached {}", wanted);
}

/// Next decodable envelope seen by a broker tap
async fn next_envelope(tap: &mut mpsc::Receiver<(String, Vec<u8>)>) -> (String, Envelope) {
    let (topic, payload) = timeout(Duration::from_millis(WAIT_MS), tap.recv())
        .await
        .expect("timed out waiting for broker traffic")
        .expect("tap closed");
    let envelope = decode(&payload).expect("envelope should decode");
    (topic, envelope)
}

fn publish(broker: &MemoryBroker, topic: &str, envelope: &Envelope) {
    broker.publish(topic, encode(envelope).unwrap());
}

fn bundle(app: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer.add_directory(format!("{}/", app), options).unwrap();
    writer
        .start_file(format!("{}/index.html", app), options)
        .unwrap();
    writer.write_all(b"<html><body>playlist</body></html>").unwrap();
    writer.finish().unwrap().into_inner()
}

/// Content host that records every page it is asked to load
struct RecordingContentHost {
    handle: NodeHandle,
    loads: mpsc::Sender<String>,
    /// Report loads as finished; off simulates a page that never loads
    complete_loads: bool,
}

impl ContentHost for RecordingContentHost {
    fn load_url(&mut self, url: &str) {
        self.loads.try_send(url.to_string()).unwrap();
        if self.complete_loads {
            self.handle.page_loaded(url);
        }
    }

    fn deliver(&mut self, _topic: &str, _payload: &[u8]) {}
}

/// Host whose page loads can be observed
fn spawn_screen_host(
    broker: &MemoryBroker,
    settings: NodeSettings,
    complete_loads: bool,
) -> (TestNode, mpsc::Receiver<String>) {
    let bus = create_bus();
    let events = bus.subscribe();
    let (node, handle) = Node::new(settings, std::sync::Arc::new(broker.connector("host")), bus);
    let (tx, loads) = mpsc::channel(64);
    let node = node.with_content_host(RecordingContentHost {
        handle: handle.clone(),
        loads: tx,
        complete_loads,
    });
    let task = tokio::spawn(node.run());
    (
        TestNode {
            handle,
            events,
            task,
        },
        loads,
    )
}

async fn next_load(loads: &mut mpsc::Receiver<String>) -> String {
    timeout(Duration::from_millis(WAIT_MS), loads.recv())
        .await
        .expect("timed out waiting for a page load")
        .expect("content host dropped")
}

fn track(name: &str) -> Track {
    Track::new(name, "Artist", format!("file:///music/{}.mp3", name), 180)
}

// =============================================================================
// Host lifecycle
// =============================================================================

mod host_lifecycle {
    use super::*;

    async fn host(broker: &MemoryBroker, apps: &TempDir) -> TestNode {
        let mut node = spawn_node(
            broker,
            "host",
            NodeSettings {
                apps_dir: apps.path().to_path_buf(),
                ..settings(Role::Host)
            },
        );
        expect_connected(&mut node).await;
        node
    }

    #[tokio::test]
    async fn exist_of_absent_app_is_an_error() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let host = host(&broker, &apps).await;
        let mut tap = broker.tap(["/playlist/1"]);

        publish(&broker, "/system", &Envelope::new(Action::Exist).with_data("playlist"));

        let (topic, response) = next_envelope(&mut tap).await;
        assert_eq!(topic, "/playlist/1");
        assert!(response.is_response());
        assert_eq!(response.action, Action::Exist);
        assert_eq!(response.data_str(), Some(DATA_ERROR));
        assert!(response.error.as_deref().unwrap_or("").contains("does not exist"));

        host.stop().await;
    }

    #[tokio::test]
    async fn install_happy_path() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let mut host = host(&broker, &apps).await;
        let mut tap = broker.tap(["/playlist/1"]);

        publish(&broker, "/system", &Envelope::new(Action::Exist).with_data("playlist"));
        let (_, exist) = next_envelope(&mut tap).await;
        assert_eq!(exist.data_str(), Some(DATA_ERROR));

        let payload = STANDARD.encode(bundle("playlist"));
        publish(&broker, "/system", &Envelope::new(Action::Install).with_data(payload));

        let (_, pending) = next_envelope(&mut tap).await;
        assert_eq!(pending.action, Action::Install);
        assert_eq!(pending.data_str(), Some(DATA_PENDING));

        let (_, done) = next_envelope(&mut tap).await;
        assert_eq!(done.action, Action::Install);
        assert_eq!(done.data_str(), Some(DATA_SUCCESS));

        expect_app_state(&mut host, AppLifecycleState::Installed).await;
        assert!(apps.path().join("playlist/index.html").is_file());

        host.stop().await;
    }

    #[tokio::test]
    async fn unknown_action_gets_no_response() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let host = host(&broker, &apps).await;
        let mut tap = broker.tap(["/playlist/1"]);

        broker.publish("/system", r#"{"action":"frobnicate","data":"playlist"}"#);
        broker.publish("/system", "not json at all");
        publish(&broker, "/system", &Envelope::new(Action::Exist).with_data("playlist"));

        // The inbox is ordered, so the first response answers the exist
        let (_, response) = next_envelope(&mut tap).await;
        assert_eq!(response.action, Action::Exist);

        host.stop().await;
    }

    #[tokio::test]
    async fn start_then_stop() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let mut host = host(&broker, &apps).await;
        let mut tap = broker.tap(["/playlist/1"]);

        publish(&broker, "/system", &Envelope::new(Action::Exist).with_data("playlist"));
        next_envelope(&mut tap).await;
        let payload = STANDARD.encode(bundle("playlist"));
        publish(&broker, "/system", &Envelope::new(Action::Install).with_data(payload));
        next_envelope(&mut tap).await;
        next_envelope(&mut tap).await;

        publish(&broker, "/system", &Envelope::new(Action::Start).with_data("playlist"));
        let (_, pending) = next_envelope(&mut tap).await;
        assert_eq!(pending.data_str(), Some(DATA_PENDING));
        let (_, started) = next_envelope(&mut tap).await;
        assert_eq!(started.action, Action::Start);
        assert_eq!(started.data_str(), Some(DATA_SUCCESS));
        expect_app_state(&mut host, AppLifecycleState::Running).await;

        publish(&broker, "/system", &Envelope::new(Action::Stop).with_data("playlist"));
        let (_, stopped) = next_envelope(&mut tap).await;
        assert_eq!(stopped.action, Action::Stop);
        assert_eq!(stopped.data_str(), Some(DATA_SUCCESS));
        expect_app_state(&mut host, AppLifecycleState::Installed).await;

        host.stop().await;
    }

    #[tokio::test]
    async fn uninstall_removes_app() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let mut host = host(&broker, &apps).await;
        let mut tap = broker.tap(["/playlist/1"]);
        install(&broker, &mut tap, "playlist").await;
        assert!(apps.path().join("playlist").is_dir());

        publish(&broker, "/system", &Envelope::new(Action::Uninstall).with_data("playlist"));
        let (_, response) = next_envelope(&mut tap).await;
        assert_eq!(response.action, Action::Uninstall);
        assert_eq!(response.data_str(), Some(DATA_SUCCESS));
        expect_app_state(&mut host, AppLifecycleState::NotInstalled).await;
        assert!(!apps.path().join("playlist").exists());

        host.stop().await;
    }

    #[tokio::test]
    async fn uninstall_of_unknown_app_succeeds() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let host = host(&broker, &apps).await;
        let mut tap = broker.tap(["/ghost/1"]);

        publish(&broker, "/system", &Envelope::new(Action::Exist).with_data("ghost"));
        let (_, exist) = next_envelope(&mut tap).await;
        assert_eq!(exist.data_str(), Some(DATA_ERROR));

        publish(&broker, "/system", &Envelope::new(Action::Uninstall).with_data("ghost"));
        let (topic, response) = next_envelope(&mut tap).await;
        assert_eq!(topic, "/ghost/1");
        assert_eq!(response.action, Action::Uninstall);
        assert_eq!(response.data_str(), Some(DATA_SUCCESS));

        host.stop().await;
    }
}

/// Negotiate `app` with an exist and install a bundle for it
async fn install(broker: &MemoryBroker, tap: &mut mpsc::Receiver<(String, Vec<u8>)>, app: &str) {
    publish(broker, "/system", &Envelope::new(Action::Exist).with_data(app));
    next_envelope(tap).await;
    let payload = STANDARD.encode(bundle(app));
    publish(broker, "/system", &Envelope::new(Action::Install).with_data(payload));
    let (_, pending) = next_envelope(tap).await;
    assert_eq!(pending.data_str(), Some(DATA_PENDING));
    let (_, done) = next_envelope(tap).await;
    assert_eq!(done.data_str(), Some(DATA_SUCCESS), "{:?}", done.error);
}

/// Request a start and wait for both responses
async fn start(broker: &MemoryBroker, tap: &mut mpsc::Receiver<(String, Vec<u8>)>, app: &str) {
    publish(broker, "/system", &Envelope::new(Action::Start).with_data(app));
    let (_, pending) = next_envelope(tap).await;
    assert_eq!(pending.data_str(), Some(DATA_PENDING));
    let (topic, started) = next_envelope(tap).await;
    assert_eq!(topic, format!("/{}/1", app));
    assert_eq!(started.action, Action::Start);
    assert_eq!(started.data_str(), Some(DATA_SUCCESS));
}

// =============================================================================
// Head-unit screen
// =============================================================================

mod host_screen {
    use super::*;

    const START_SCREEN: &str = "about:blank";

    fn host_settings(apps: &TempDir) -> NodeSettings {
        NodeSettings {
            apps_dir: apps.path().to_path_buf(),
            ..settings(Role::Host)
        }
    }

    async fn screen_host(
        broker: &MemoryBroker,
        settings: NodeSettings,
        complete_loads: bool,
    ) -> (TestNode, mpsc::Receiver<String>) {
        let (mut host, mut loads) = spawn_screen_host(broker, settings, complete_loads);
        expect_connected(&mut host).await;
        assert_eq!(next_load(&mut loads).await, START_SCREEN);
        (host, loads)
    }

    #[tokio::test]
    async fn uninstall_of_running_app_restores_start_screen() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let (mut host, mut loads) = screen_host(&broker, host_settings(&apps), true).await;
        let mut tap = broker.tap(["/playlist/1"]);
        install(&broker, &mut tap, "playlist").await;
        start(&broker, &mut tap, "playlist").await;
        assert_eq!(
            next_load(&mut loads).await,
            "http://localhost:8080/playlist/index.html"
        );

        publish(&broker, "/system", &Envelope::new(Action::Uninstall).with_data("playlist"));
        let (_, response) = next_envelope(&mut tap).await;
        assert_eq!(response.data_str(), Some(DATA_SUCCESS));
        assert_eq!(next_load(&mut loads).await, START_SCREEN);
        expect_app_state(&mut host, AppLifecycleState::NotInstalled).await;

        host.stop().await;
    }

    #[tokio::test]
    async fn stop_after_controller_reconnect_restores_start_screen() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let bundle_path = staging.path().join("playlist.zip");
        std::fs::write(&bundle_path, bundle("playlist")).unwrap();

        let (mut host, mut loads) = screen_host(&broker, host_settings(&apps), true).await;
        let mut tap = broker.tap(["/playlist/1"]);

        let mut controller = spawn_node(
            &broker,
            "controller",
            NodeSettings {
                bundle: Some(bundle_path),
                ..settings(Role::Controller)
            },
        );
        expect_app_state(&mut controller, AppLifecycleState::NotInstalled).await;
        controller.handle.system(Action::Install).await;
        expect_app_state(&mut controller, AppLifecycleState::Installed).await;
        controller.handle.system(Action::Start).await;
        expect_app_state(&mut controller, AppLifecycleState::Running).await;
        expect_app_state(&mut host, AppLifecycleState::Running).await;
        assert_eq!(
            next_load(&mut loads).await,
            "http://localhost:8080/playlist/index.html"
        );

        // The reconnecting controller asks exist again
        while tap.try_recv().is_ok() {}
        assert_eq!(broker.sever("controller"), 1);
        loop {
            let (_, envelope) = next_envelope(&mut tap).await;
            if envelope.action == Action::Exist && envelope.is_response() {
                assert_eq!(envelope.data_str(), Some(DATA_SUCCESS));
                break;
            }
        }

        controller.handle.system(Action::Stop).await;
        expect_app_state(&mut controller, AppLifecycleState::Stopped).await;
        assert_eq!(next_load(&mut loads).await, START_SCREEN);
        expect_app_state(&mut host, AppLifecycleState::Installed).await;

        controller.stop().await;
        host.stop().await;
    }

    #[tokio::test]
    async fn switching_apps_keeps_new_app_on_screen() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let (mut host, mut loads) = screen_host(&broker, host_settings(&apps), true).await;
        let mut tap = broker.tap(["/a/1", "/b/1"]);
        install(&broker, &mut tap, "a").await;
        install(&broker, &mut tap, "b").await;

        start(&broker, &mut tap, "a").await;
        assert_eq!(next_load(&mut loads).await, "http://localhost:8080/a/index.html");
        start(&broker, &mut tap, "b").await;
        assert_eq!(next_load(&mut loads).await, "http://localhost:8080/b/index.html");

        publish(&broker, "/system", &Envelope::new(Action::Stop).with_data("a"));
        let (topic, stopped) = next_envelope(&mut tap).await;
        assert_eq!(topic, "/a/1");
        assert_eq!(stopped.data_str(), Some(DATA_SUCCESS));
        assert!(loads.try_recv().is_err(), "stopping a replaced app changed the screen");

        // b is still the running app
        publish(&broker, "/system", &Envelope::new(Action::Install).with_data("UEsFBg=="));
        let (topic, refused) = next_envelope(&mut tap).await;
        assert_eq!(topic, "/b/1");
        assert!(refused.error.as_deref().unwrap().contains("running"));

        publish(&broker, "/system", &Envelope::new(Action::Stop).with_data("b"));
        next_envelope(&mut tap).await;
        assert_eq!(next_load(&mut loads).await, START_SCREEN);

        host.stop().await;
    }

    #[tokio::test]
    async fn start_without_page_load_times_out() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let settings = NodeSettings {
            start_timeout: Duration::from_millis(100),
            ..host_settings(&apps)
        };
        let (mut host, mut loads) = screen_host(&broker, settings, false).await;
        let mut tap = broker.tap(["/playlist/1"]);
        install(&broker, &mut tap, "playlist").await;

        publish(&broker, "/system", &Envelope::new(Action::Start).with_data("playlist"));
        let (_, pending) = next_envelope(&mut tap).await;
        assert_eq!(pending.data_str(), Some(DATA_PENDING));
        let (_, failed) = next_envelope(&mut tap).await;
        assert_eq!(failed.action, Action::Start);
        assert_eq!(failed.data_str(), Some(DATA_ERROR));
        assert!(failed.error.as_deref().unwrap().contains("timed out"));

        assert_eq!(
            next_load(&mut loads).await,
            "http://localhost:8080/playlist/index.html"
        );
        assert_eq!(next_load(&mut loads).await, START_SCREEN);
        expect_app_state(&mut host, AppLifecycleState::Installed).await;

        host.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_start_waiting_for_page() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let (mut host, mut loads) = screen_host(&broker, host_settings(&apps), false).await;
        let mut tap = broker.tap(["/playlist/1"]);
        install(&broker, &mut tap, "playlist").await;

        publish(&broker, "/system", &Envelope::new(Action::Start).with_data("playlist"));
        next_envelope(&mut tap).await;
        expect_app_state(&mut host, AppLifecycleState::StartPending).await;

        publish(&broker, "/system", &Envelope::new(Action::Stop).with_data("playlist"));
        let (_, stopped) = next_envelope(&mut tap).await;
        assert_eq!(stopped.action, Action::Stop);
        assert_eq!(stopped.data_str(), Some(DATA_SUCCESS));
        expect_app_state(&mut host, AppLifecycleState::Installed).await;

        next_load(&mut loads).await;
        assert_eq!(next_load(&mut loads).await, START_SCREEN);

        host.stop().await;
    }
}

// =============================================================================
// Playlist sync
// =============================================================================

mod playlist_sync {
    use super::*;

    /// Controller first, then a remote that has finished its initial sync
    async fn controller_and_remote(broker: &MemoryBroker) -> (TestNode, TestNode) {
        let mut controller = spawn_node(broker, "controller", settings(Role::Controller));
        expect_connected(&mut controller).await;

        let mut remote = spawn_node(broker, "remote", settings(Role::Remote));
        expect_connected(&mut remote).await;
        expect_playlist(&mut remote, 0).await;

        (controller, remote)
    }

    #[tokio::test]
    async fn add_after_add_all_converges() {
        let broker = MemoryBroker::new();
        let (mut controller, mut remote) = controller_and_remote(&broker).await;

        publish(
            &broker,
            "/playlist",
            &Envelope::add_all(&[track("A"), track("B")], None),
        );
        publish(&broker, "/playlist", &Envelope::add(track("C")));

        let expected = vec![track("A"), track("B"), track("C")];
        assert_eq!(expect_playlist(&mut controller, 3).await, expected);
        assert_eq!(expect_playlist(&mut remote, 3).await, expected);

        controller.stop().await;
        remote.stop().await;
    }

    #[tokio::test]
    async fn remote_add_reaches_controller() {
        let broker = MemoryBroker::new();
        let (mut controller, remote) = controller_and_remote(&broker).await;

        remote.handle.add_track(track("Intro")).await;

        let tracks = expect_playlist(&mut controller, 1).await;
        assert_eq!(tracks[0].name(), "Intro");

        controller.stop().await;
        remote.stop().await;
    }

    #[tokio::test]
    async fn late_remote_receives_snapshot() {
        let broker = MemoryBroker::new();
        let mut controller = spawn_node(&broker, "controller", settings(Role::Controller));
        expect_connected(&mut controller).await;

        publish(
            &broker,
            "/playlist",
            &Envelope::add_all(&[track("A"), track("B")], Some(1)),
        );
        expect_playlist(&mut controller, 2).await;

        let mut remote = spawn_node(&broker, "remote", settings(Role::Remote));
        match expect_event(
            &mut remote.events,
            |e| matches!(e, NodeEvent::PlaylistChanged { tracks, .. } if tracks.len() == 2),
            WAIT_MS,
        )
        .await
        {
            Some(NodeEvent::PlaylistChanged { current_index, .. }) => assert_eq!(current_index, 1),
            other => panic!("remote never synced: {:?}", other),
        }

        controller.stop().await;
        remote.stop().await;
    }
}

// =============================================================================
// Reconnection
// =============================================================================

mod reconnection {
    use super::*;

    #[tokio::test]
    async fn backoff_reconnects_without_duplicates() {
        let broker = MemoryBroker::new();
        let mut controller = spawn_node(&broker, "controller", settings(Role::Controller));
        expect_connected(&mut controller).await;

        assert_eq!(broker.sever("controller"), 1);
        let lost = expect_event(
            &mut controller.events,
            |e| {
                matches!(
                    e,
                    NodeEvent::ConnectionChanged {
                        state: ConnectionState::Failed,
                        failures: 1
                    }
                )
            },
            WAIT_MS,
        )
        .await;
        assert!(lost.is_some(), "connection loss not reported");
        expect_connected(&mut controller).await;

        assert_eq!(broker.session_count(), 1);
        assert_eq!(broker.subscriber_count("/playlist"), 1);

        publish(&broker, "/playlist", &Envelope::add(track("A")));
        expect_playlist(&mut controller, 1).await;
        let duplicate = expect_event(
            &mut controller.events,
            |e| matches!(e, NodeEvent::PlaylistChanged { .. }),
            200,
        )
        .await;
        assert!(duplicate.is_none(), "message delivered twice: {:?}", duplicate);

        controller.stop().await;
    }

    #[tokio::test]
    async fn refused_connects_are_retried() {
        let broker = MemoryBroker::new();
        broker.refuse_next(2);
        let mut remote = spawn_node(&broker, "remote", settings(Role::Remote));

        let second = expect_event(
            &mut remote.events,
            |e| matches!(e, NodeEvent::ConnectionChanged { failures: 2, .. }),
            WAIT_MS,
        )
        .await;
        assert!(second.is_some(), "second failure not reported");
        expect_connected(&mut remote).await;
        assert_eq!(broker.session_count(), 1);

        remote.stop().await;
    }

    #[tokio::test]
    async fn ask_policy_waits_for_answer() {
        let broker = MemoryBroker::new();
        broker.refuse_next(1);
        let mut status = spawn_node(
            &broker,
            "status",
            NodeSettings {
                reconnect: ReconnectPolicy {
                    mode: ReconnectMode::Ask,
                    ..ReconnectPolicy::default()
                },
                ..settings(Role::Status)
            },
        );

        let asked = expect_event(
            &mut status.events,
            |e| matches!(e, NodeEvent::ReconnectRequested { failures: 1 }),
            WAIT_MS,
        )
        .await;
        assert!(asked.is_some(), "reconnect prompt not raised");
        assert_eq!(broker.session_count(), 0);

        status.handle.answer_retry(true).await;
        expect_connected(&mut status).await;

        status.stop().await;
    }

    #[tokio::test]
    async fn shutdown_releases_session() {
        let broker = MemoryBroker::new();
        let mut status = spawn_node(&broker, "status", settings(Role::Status));
        expect_connected(&mut status).await;
        assert_eq!(broker.subscriber_count("/system"), 1);

        let TestNode {
            handle,
            mut events,
            task,
        } = status;
        handle.shutdown().await;
        let stopping = expect_event(&mut events, |e| matches!(e, NodeEvent::ShuttingDown), WAIT_MS).await;
        assert!(stopping.is_some());
        timeout(Duration::from_millis(WAIT_MS), task)
            .await
            .expect("node did not stop")
            .unwrap();
        assert_eq!(broker.session_count(), 0);
    }
}

// =============================================================================
// End to end
// =============================================================================

mod provisioning {
    use super::*;

    #[tokio::test]
    async fn controller_installs_and_starts_app_on_host() {
        let broker = MemoryBroker::new();
        let apps = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let bundle_path = staging.path().join("playlist.zip");
        std::fs::write(&bundle_path, bundle("playlist")).unwrap();

        let mut host = spawn_node(
            &broker,
            "host",
            NodeSettings {
                apps_dir: apps.path().to_path_buf(),
                ..settings(Role::Host)
            },
        );
        expect_connected(&mut host).await;

        let mut controller = spawn_node(
            &broker,
            "controller",
            NodeSettings {
                auto_provision: true,
                bundle: Some(bundle_path),
                ..settings(Role::Controller)
            },
        );

        expect_app_state(&mut controller, AppLifecycleState::Running).await;
        expect_app_state(&mut host, AppLifecycleState::Running).await;
        assert!(apps.path().join("playlist/index.html").is_file());

        // Stop from the controller side takes the host back to installed
        controller.handle.system(Action::Stop).await;
        expect_app_state(&mut controller, AppLifecycleState::Stopped).await;
        expect_app_state(&mut host, AppLifecycleState::Installed).await;

        controller.stop().await;
        host.stop().await;
    }
}
