//! livecall - Echtzeit-Sprachanruf-Client
//!
//! Ein Full-Duplex Voice-Call-Client mit:
//! - Zustandsautomat Idle/Ringing/Connecting/Active/Ended
//! - Capture-Pipeline (Mikrofon → PCM16 → Session-Kanal)
//! - Lückenloser Playback-Queue mit virtueller Uhr und Barge-in
//! - WebSocket-Session zum Sprachdienst
//!
//! Einstiegspunkt ist die [`CallEngine`]; alle Geräte- und Netzwerk-
//! Abhängigkeiten laufen über Nähte (`AudioBackend`, `SessionChannel`,
//! `RingIndicator`) und sind austauschbar.

pub mod audio;
pub mod call;
pub mod config;
pub mod session;

pub use audio::{AudioBackend, CpalBackend, OutputSink};
pub use call::{CallEngine, CallError, CallEvent, CallSnapshot, CallState, LogRinger};
pub use config::CallConfig;
pub use session::{SessionChannel, WsSessionChannel};
