//! Session Module - Duplex-Kanal zum Sprachdienst
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Sprachdienst:
//! - `SessionChannel`-Naht mit zweiphasigem Öffnen
//! - WebSocket-Implementierung mit Read-/Write-Tasks
//! - Nachrichten-Formen des Wire-Protokolls

mod channel;
mod messages;

pub use channel::{
    ChannelError, SessionChannel, SessionConfig, SessionEvent, SessionHandle, WsSessionChannel,
};
pub use messages::*;
