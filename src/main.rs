//! Infotainment Link node
//!
//! Runs one role (host, controller, remote or status) against an MQTT broker.

use infotainment_link::bus::{self, NodeEvent};
use infotainment_link::config;
use infotainment_link::connection::ReconnectMode;
use infotainment_link::content::LoggingContentHost;
use infotainment_link::node::{Node, NodeHandle};
use infotainment_link::playlist::LoggingPlayer;
use infotainment_link::transport::MqttConnector;

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infotainment_link=debug,rumqttc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Infotainment Link v{} ({})",
        env!("INFOTAINMENT_VERSION"),
        env!("INFOTAINMENT_GIT_SHA")
    );

    let config = config::load_config()?;
    let mqtt = config.mqtt_settings();
    tracing::info!(
        "Configuration loaded: role {}, broker {}:{}, client id {}",
        config.role,
        mqtt.host,
        mqtt.port,
        mqtt.client_id
    );

    let bus = bus::create_bus();
    let connector = Arc::new(MqttConnector::new(mqtt));

    let (node, handle) = Node::new(config.node_settings(), connector, bus.clone());
    let node = node
        .with_content_host(LoggingContentHost::reporting_to(handle.clone()))
        .with_player(LoggingPlayer);

    let events = tokio::spawn(log_events(
        bus.subscribe(),
        handle.clone(),
        config.reconnect.policy == ReconnectMode::Ask,
    ));
    let node_task = tokio::spawn(node.run());

    shutdown_signal().await;

    handle.shutdown().await;
    if let Err(e) = node_task.await {
        tracing::error!("Node task failed: {}", e);
    }
    events.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Log node events; in ask mode, prompt on stdin when a reconnect is wanted
async fn log_events(mut rx: broadcast::Receiver<NodeEvent>, handle: NodeHandle, ask: bool) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Event log lagged, missed {} events", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            NodeEvent::ConnectionChanged { state, failures } => {
                tracing::info!("Connection {} (failures: {})", state, failures)
            }
            NodeEvent::ReconnectRequested { failures } if ask => {
                let mut stdout = tokio::io::stdout();
                let prompt = format!("Connection failed {} time(s). Reconnect? [y/N] ", failures);
                let _ = stdout.write_all(prompt.as_bytes()).await;
                let _ = stdout.flush().await;
                let retry = match stdin.next_line().await {
                    Ok(Some(line)) => matches!(line.trim(), "y" | "Y" | "yes"),
                    _ => false,
                };
                handle.answer_retry(retry).await;
            }
            NodeEvent::AppStateChanged { app, state } => tracing::info!("App {} is {}", app, state),
            NodeEvent::ShuttingDown => break,
            other => tracing::debug!("Event: {}", other.event_type()),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
