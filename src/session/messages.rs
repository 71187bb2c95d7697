//! Message Types für das Session-Protokoll
//!
//! Die Strukturen beschreiben nur die Nachrichten-Formen des Dienstes;
//! Audio-Nutzdaten reisen als base64-kodiertes PCM16.

use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Session-Setup: Persona und Stimme, unverändert durchgereicht
#[derive(Debug, Clone, Serialize)]
pub struct SetupPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub persona: String,
    pub voice: String,
    #[serde(rename = "inputSampleRate")]
    pub input_sample_rate: u32,
    #[serde(rename = "outputSampleRate")]
    pub output_sample_rate: u32,
}

impl SetupPayload {
    pub fn new(persona: String, voice: String, input_rate: u32, output_rate: u32) -> Self {
        Self {
            msg_type: "setup",
            persona,
            voice,
            input_sample_rate: input_rate,
            output_sample_rate: output_rate,
        }
    }
}

/// Ein kodierter Audio-Chunk in Capture-Reihenfolge
#[derive(Debug, Clone, Serialize)]
pub struct AudioPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    /// base64-kodiertes PCM16 little-endian
    pub data: String,
}

impl AudioPayload {
    pub fn new(data: String) -> Self {
        Self {
            msg_type: "audio",
            data,
        }
    }
}

/// Client beendet die Session
#[derive(Debug, Clone, Serialize)]
pub struct ClosePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
}

impl ClosePayload {
    pub fn new() -> Self {
        Self { msg_type: "close" }
    }
}

impl Default for ClosePayload {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Nachrichten vom Dienst
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Setup bestätigt, Session ist offen
    Ready,

    /// Ein synthetisiertes Sprach-Segment (base64 PCM16)
    Audio { data: String },

    /// Barge-in: der Benutzer spricht, wartendes Audio verwerfen
    Interrupted,

    /// Dienst beendet die Session regulär
    Closed,

    /// Laufzeitfehler des Dienstes
    Error { message: String },
}
