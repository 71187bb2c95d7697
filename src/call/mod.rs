//! Call Module - Anruf-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - `CallEngine` mit dem Zustandsautomaten Idle/Ringing/Connecting/Active/Ended
//! - Klingel-Anzeige über die `RingIndicator`-Naht

mod engine;
mod ring;

pub use engine::{CallEngine, CallError, CallEvent, CallSnapshot, CallState};
pub use ring::{LogRinger, RingError, RingIndicator};
