//! Konfiguration für den Call-Client
//!
//! Alle Tunables an einem Ort: Server-Endpunkt, Persona/Stimme,
//! Klingeldauer und Audio-Parameter. Defaults entsprechen dem
//! Referenz-Setup (16kHz Capture, 24kHz Playback, 4096er Frames).

use serde::Deserialize;
use std::time::Duration;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Capture Sample Rate (Mono-Sprache, 16kHz)
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Playback Sample Rate (synthetisierte Sprache kommt mit 24kHz)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Frame-Größe in Samples (4096 @ 16kHz ≈ 256ms).
/// Tunable, keine Korrektheitsanforderung.
pub const FRAME_SIZE: usize = 4096;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Klingeldauer bevor die Verbindung aufgebaut wird
pub const RING_DURATION: Duration = Duration::from_secs(9);

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Konfiguration für einen Anruf
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket-Endpunkt des Sprachdienstes
    pub server_url: String,

    /// Persona/Prompt-Text, unverändert an den Dienst durchgereicht
    pub persona: String,

    /// Stimmen-Bezeichner, unverändert an den Dienst durchgereicht
    pub voice: String,

    /// Klingeldauer bevor verbunden wird
    #[serde(with = "duration_millis")]
    pub ring_duration: Duration,

    /// Frame-Größe in Samples für die Capture-Pipeline
    pub frame_size: usize,

    /// Capture Sample Rate in Hz
    pub capture_sample_rate: u32,

    /// Playback Sample Rate in Hz
    pub playback_sample_rate: u32,

    /// Echo-Cancellation vom Capture-Backend anfordern (best-effort)
    pub echo_cancellation: bool,

    /// Noise-Suppression vom Capture-Backend anfordern (best-effort)
    pub noise_suppression: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://localhost:8443/live".to_string(),
            persona: String::new(),
            voice: "default".to_string(),
            ring_duration: RING_DURATION,
            frame_size: FRAME_SIZE,
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

impl CallConfig {
    /// Erstellt eine Konfiguration mit Overrides aus Umgebungsvariablen
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("LIVECALL_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(persona) = std::env::var("LIVECALL_PERSONA") {
            config.persona = persona;
        }
        if let Ok(voice) = std::env::var("LIVECALL_VOICE") {
            config.voice = voice;
        }
        if let Ok(ms) = std::env::var("LIVECALL_RING_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                config.ring_duration = Duration::from_millis(ms);
            }
        }

        config
    }
}

/// Serde-Helfer: Dauer als Millisekunden
mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.capture_sample_rate, 16_000);
        assert_eq!(config.playback_sample_rate, 24_000);
        assert_eq!(config.frame_size, 4096);
        assert_eq!(config.ring_duration, Duration::from_secs(9));
    }

    #[test]
    fn config_aus_json() {
        let json = r#"{ "server_url": "wss://example.test/live", "ring_duration": 3000 }"#;
        let config: CallConfig = serde_json::from_str(json).expect("Config sollte parsen");
        assert_eq!(config.server_url, "wss://example.test/live");
        assert_eq!(config.ring_duration, Duration::from_millis(3000));
        // Nicht gesetzte Felder behalten Defaults
        assert_eq!(config.frame_size, 4096);
    }
}
