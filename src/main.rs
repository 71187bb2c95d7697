//! livecall - Kommandozeilen-Client
//!
//! Wählt einen Anruf gegen den konfigurierten Sprachdienst und legt bei
//! Ctrl-C wieder auf. Konfiguration über Umgebungsvariablen
//! (`LIVECALL_SERVER_URL`, `LIVECALL_PERSONA`, `LIVECALL_VOICE`,
//! `LIVECALL_RING_MS`).

use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use livecall::{
    CallConfig, CallEngine, CallEvent, CpalBackend, LogRinger, WsSessionChannel,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("livecall=debug")),
        )
        .init();

    let config = CallConfig::from_env();
    url::Url::parse(&config.server_url)
        .with_context(|| format!("Invalid server URL: {}", config.server_url))?;

    let engine = CallEngine::new(
        config.clone(),
        Arc::new(WsSessionChannel::new(config.server_url.clone())),
        Arc::new(CpalBackend::new()),
        Arc::new(LogRinger),
    );

    // Events mitloggen; Pegel nur auf Trace-Level
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CallEvent::StateChanged(state) => tracing::info!("Call state: {:?}", state),
                CallEvent::VolumeLevel(level) => tracing::trace!("Mic level: {:.3}", level),
                CallEvent::Error(message) => tracing::error!("Call error: {}", message),
            }
        }
    });

    engine.dial().await.context("Call setup failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Hanging up");
    engine.hangup().await;

    Ok(())
}
