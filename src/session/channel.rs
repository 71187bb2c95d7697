//! Session-Kanal zum Sprachdienst
//!
//! `SessionChannel` ist die Naht, von der die Engine abhängt: zweiphasiges
//! Öffnen (Handle erst nach bestätigtem Setup), nicht-blockierendes Senden
//! und ein Event-Strom für eingehende Segmente, Barge-in, Close und Fehler.
//!
//! `WsSessionChannel` implementiert die Naht über eine WebSocket-Verbindung
//! mit getrennten Read-/Write-Tasks.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use super::messages::*;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Session setup rejected: {0}")]
    SetupRejected(String),

    #[error("No open session")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SESSION TYPES
// ============================================================================

/// Opakes Handle einer offenen Session; höchstens eines ist gleichzeitig live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Session-Konfiguration: opake Persona und Stimme plus Audio-Raten
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub persona: String,
    pub voice: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
}

/// Events aus dem Kanal; feuern auf Hintergrund-Timing
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Ein eingehender Audio-Chunk (dekodierte Wire-Bytes, PCM16)
    Segment {
        session: SessionHandle,
        data: Vec<u8>,
    },

    /// Barge-in-Signal des Dienstes
    Interrupted { session: SessionHandle },

    /// Session wurde von der Gegenseite beendet
    Closed { session: SessionHandle },

    /// Laufzeitfehler nach dem Verbinden
    Error {
        session: SessionHandle,
        message: String,
    },
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Duplex-Kanal zum Sprachdienst.
///
/// Die Engine behandelt den Kanal rein als Event-Quelle/-Senke: fehlge-
/// schlagene Sends und Opens werden nicht wiederholt.
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// Öffnet eine Session. Das Handle existiert erst, wenn das Setup
    /// bestätigt wurde; ein Send davor wird abgewiesen, nie gepuffert.
    async fn open(&self, config: &SessionConfig) -> Result<SessionHandle, ChannelError>;

    /// Sendet einen kodierten Audio-Chunk, fire-and-forget
    fn send(&self, handle: &SessionHandle, chunk: Vec<u8>) -> Result<(), ChannelError>;

    /// Schließt die Session und gibt die Verbindung frei
    async fn close(&self, handle: &SessionHandle);

    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

// ============================================================================
// WEBSOCKET IMPLEMENTATION
// ============================================================================

#[derive(Debug, Default)]
struct ChannelState {
    session: Option<SessionHandle>,
    tx: Option<mpsc::Sender<String>>,
}

/// WebSocket-Kanal mit getrennten Read-/Write-Tasks
pub struct WsSessionChannel {
    server_url: String,
    state: Arc<RwLock<ChannelState>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl WsSessionChannel {
    pub fn new(server_url: String) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            state: Arc::new(RwLock::new(ChannelState::default())),
            event_tx,
        }
    }

    /// Verarbeitet eine eingehende Server-Nachricht
    fn handle_server_message(
        msg: ServerMessage,
        session: &SessionHandle,
        event_tx: &broadcast::Sender<SessionEvent>,
        ready_tx: &mpsc::Sender<Result<(), ChannelError>>,
    ) {
        match msg {
            ServerMessage::Ready => {
                tracing::info!("Session setup acknowledged");
                let _ = ready_tx.try_send(Ok(()));
            }

            ServerMessage::Audio { data } => match BASE64.decode(&data) {
                Ok(bytes) => {
                    let _ = event_tx.send(SessionEvent::Segment {
                        session: session.clone(),
                        data: bytes,
                    });
                }
                Err(e) => {
                    tracing::warn!("Dropping audio message with invalid base64: {}", e);
                }
            },

            ServerMessage::Interrupted => {
                let _ = event_tx.send(SessionEvent::Interrupted {
                    session: session.clone(),
                });
            }

            ServerMessage::Closed => {
                let _ = event_tx.send(SessionEvent::Closed {
                    session: session.clone(),
                });
            }

            ServerMessage::Error { message } => {
                tracing::error!("Session error from service: {}", message);
                let _ = ready_tx.try_send(Err(ChannelError::SetupRejected(message.clone())));
                let _ = event_tx.send(SessionEvent::Error {
                    session: session.clone(),
                    message,
                });
            }
        }
    }
}

#[async_trait]
impl SessionChannel for WsSessionChannel {
    async fn open(&self, config: &SessionConfig) -> Result<SessionHandle, ChannelError> {
        tracing::info!("Connecting to voice service: {}", self.server_url);

        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let session = SessionHandle::new();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);

        // Kanal für die Setup-Bestätigung
        let (ready_tx, mut ready_rx) = mpsc::channel::<Result<(), ChannelError>>(1);

        // Read-Task starten
        let event_tx = self.event_tx.clone();
        let session_for_read = session.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(server_msg) => {
                                WsSessionChannel::handle_server_message(
                                    server_msg,
                                    &session_for_read,
                                    &event_tx,
                                    &ready_tx,
                                );
                            }
                            Err(e) => {
                                tracing::warn!("Ignoring unparseable message from service: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        let _ = event_tx.send(SessionEvent::Closed {
                            session: session_for_read.clone(),
                        });
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        let _ = ready_tx.try_send(Err(ChannelError::ConnectionFailed(
                            e.to_string(),
                        )));
                        let _ = event_tx.send(SessionEvent::Error {
                            session: session_for_read.clone(),
                            message: e.to_string(),
                        });
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Setup senden
        let setup = SetupPayload::new(
            config.persona.clone(),
            config.voice.clone(),
            config.input_sample_rate,
            config.output_sample_rate,
        );
        let setup_json = serde_json::to_string(&setup)
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        tx.send(setup_json)
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        // Auf Setup-Bestätigung warten (kanal-interne Frist)
        tokio::select! {
            result = ready_rx.recv() => {
                match result {
                    Some(Ok(())) => {}
                    Some(Err(e)) => return Err(e),
                    None => return Err(ChannelError::SetupRejected("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(10)) => {
                return Err(ChannelError::SetupRejected("Timeout".to_string()));
            }
        }

        // Erst jetzt existiert die Session nach außen
        {
            let mut state = self.state.write();
            state.session = Some(session.clone());
            state.tx = Some(tx);
        }

        Ok(session)
    }

    fn send(&self, handle: &SessionHandle, chunk: Vec<u8>) -> Result<(), ChannelError> {
        let state = self.state.read();
        if state.session.as_ref() != Some(handle) {
            return Err(ChannelError::NotConnected);
        }
        let tx = state.tx.as_ref().ok_or(ChannelError::NotConnected)?;

        let payload = AudioPayload::new(BASE64.encode(&chunk));
        let json = serde_json::to_string(&payload)
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking; volle Queue ist ein Send-Fehler,
        // kein Grund zu warten
        tx.try_send(json)
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn close(&self, handle: &SessionHandle) {
        let tx = {
            let mut state = self.state.write();
            if state.session.as_ref() != Some(handle) {
                return;
            }
            state.session = None;
            state.tx.take()
        };

        if let Some(tx) = tx {
            let close = ClosePayload::new();
            if let Ok(json) = serde_json::to_string(&close) {
                let _ = tx.try_send(json);
            }
            // Drop von tx beendet die Write-Task und schließt den Socket
        }

        tracing::info!("Session closed");
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for WsSessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSessionChannel")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_handles_sind_eindeutig() {
        let a = SessionHandle::new();
        let b = SessionHandle::new();
        assert_ne!(a, b);
    }

    #[test]
    fn send_ohne_offene_session_wird_abgewiesen() {
        let channel = WsSessionChannel::new("wss://example.test/live".to_string());
        let handle = SessionHandle::new();
        let result = channel.send(&handle, vec![0u8; 4]);
        assert!(matches!(result, Err(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn close_mit_fremdem_handle_ist_noop() {
        let channel = WsSessionChannel::new("wss://example.test/live".to_string());
        // Kein Panic, kein Zustandseffekt
        channel.close(&SessionHandle::new()).await;
        assert!(channel.state.read().session.is_none());
    }
}
