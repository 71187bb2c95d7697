//! Klingel-Anzeige während der Ringing-Phase
//!
//! Die eigentliche Klingelton-Wiedergabe ist ein externer Kollaborateur.
//! Ein fehlgeschlagener Start (z.B. Autoplay-Beschränkungen) ist nicht
//! fatal: der Klingel-Timer treibt den Verbindungsaufbau unabhängig voran.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RingError {
    #[error("Ring indication unavailable: {0}")]
    Unavailable(String),
}

/// Naht zur Klingel-Anzeige (Ton, UI-Animation, ...)
pub trait RingIndicator: Send + Sync {
    /// Startet die Anzeige; Fehler werden geloggt und ignoriert
    fn start(&self) -> Result<(), RingError>;

    /// Stoppt die Anzeige; muss idempotent sein
    fn stop(&self);
}

/// Standard-Implementierung ohne hörbares Klingeln
#[derive(Debug, Default)]
pub struct LogRinger;

impl RingIndicator for LogRinger {
    fn start(&self) -> Result<(), RingError> {
        tracing::info!("Ringing...");
        Ok(())
    }

    fn stop(&self) {
        tracing::debug!("Ring indication stopped");
    }
}
