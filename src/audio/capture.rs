//! Capture-Pipeline - Mikrofon-Frames zum Kanal
//!
//! Konsumiert den Frame-Strom des Capture-Geräts und verarbeitet jeden
//! Frame in Scheib-Reihenfolge: RMS-Lautheit für die Anzeige, PCM16-
//! Kodierung, fire-and-forget Versand auf dem Session-Kanal. Endet der
//! Geräte-Strom, meldet die Pipeline das als Geräteverlust; sie versucht
//! nie selbst, die Aufnahme neu zu starten.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::codec::{self, AudioFrame};
use super::volume::VolumeMeter;
use crate::session::{SessionChannel, SessionHandle};

/// Grund für das Ende der Capture-Pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    /// Auflegen bzw. Teardown
    Cancelled,
    /// Geräte-Strom ist beendet oder fehlgeschlagen
    DeviceLost,
}

/// Läuft für die Dauer eines aktiven Anrufs.
///
/// `on_level` wird pro Frame mit dem geglätteten Pegel aufgerufen.
pub async fn run_capture<F>(
    mut frames: mpsc::Receiver<AudioFrame>,
    channel: Arc<dyn SessionChannel>,
    session: SessionHandle,
    volume: Arc<Mutex<VolumeMeter>>,
    on_level: F,
    mut cancel: watch::Receiver<bool>,
) -> CaptureEnd
where
    F: Fn(f32) + Send + 'static,
{
    loop {
        if *cancel.borrow() {
            return CaptureEnd::Cancelled;
        }

        tokio::select! {
            _ = cancel.changed() => {
                return CaptureEnd::Cancelled;
            }
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        let rms = codec::rms(&frame.samples);
                        let level = volume.lock().update(rms);
                        on_level(level);

                        let chunk = codec::encode_pcm16(&frame.samples);
                        // Fire-and-forget: Backpressure und Reihenfolge auf
                        // der Leitung sind Sache des Kanals
                        if let Err(e) = channel.send(&session, chunk) {
                            tracing::debug!("Audio chunk send failed: {}", e);
                        }
                    }
                    None => {
                        tracing::warn!("Capture stream ended mid-call");
                        return CaptureEnd::DeviceLost;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ChannelError, SessionConfig, SessionEvent};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    /// Kanal-Attrappe, die gesendete Chunks aufzeichnet
    struct RecordingChannel {
        sent: Mutex<Vec<Vec<u8>>>,
        event_tx: broadcast::Sender<SessionEvent>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(16);
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                event_tx,
            })
        }
    }

    #[async_trait]
    impl SessionChannel for RecordingChannel {
        async fn open(&self, _config: &SessionConfig) -> Result<SessionHandle, ChannelError> {
            Ok(SessionHandle::new())
        }

        fn send(&self, _handle: &SessionHandle, chunk: Vec<u8>) -> Result<(), ChannelError> {
            self.sent.lock().push(chunk);
            Ok(())
        }

        async fn close(&self, _handle: &SessionHandle) {}

        fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
            self.event_tx.subscribe()
        }
    }

    #[tokio::test]
    async fn frames_werden_kodiert_und_in_reihenfolge_gesendet() {
        let channel = RecordingChannel::new();
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let volume = Arc::new(Mutex::new(VolumeMeter::new()));

        frame_tx
            .send(AudioFrame::new(vec![0.5; 4], 16_000))
            .await
            .unwrap();
        frame_tx
            .send(AudioFrame::new(vec![-0.5; 4], 16_000))
            .await
            .unwrap();
        drop(frame_tx);

        let end = run_capture(
            frame_rx,
            channel.clone() as Arc<dyn SessionChannel>,
            SessionHandle::new(),
            Arc::clone(&volume),
            |_| {},
            cancel_rx,
        )
        .await;

        assert_eq!(end, CaptureEnd::DeviceLost);

        let sent = channel.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], codec::encode_pcm16(&[0.5; 4]));
        assert_eq!(sent[1], codec::encode_pcm16(&[-0.5; 4]));

        // Volume wurde pro Frame aktualisiert
        assert!(volume.lock().level() > 0.0);
    }

    #[tokio::test]
    async fn cancel_beendet_pipeline_ohne_weitere_sends() {
        let channel = RecordingChannel::new();
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let volume = Arc::new(Mutex::new(VolumeMeter::new()));

        let task = tokio::spawn(run_capture(
            frame_rx,
            channel.clone() as Arc<dyn SessionChannel>,
            SessionHandle::new(),
            volume,
            |_| {},
            cancel_rx,
        ));

        cancel_tx.send(true).unwrap();
        let end = task.await.unwrap();
        assert_eq!(end, CaptureEnd::Cancelled);

        // Nach dem Ende erreicht kein Frame mehr den Kanal
        let _ = frame_tx.send(AudioFrame::new(vec![0.1; 4], 16_000)).await;
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn pegel_callback_erhaelt_geglaetteten_wert() {
        let channel = RecordingChannel::new();
        let (frame_tx, frame_rx) = mpsc::channel(8);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let volume = Arc::new(Mutex::new(VolumeMeter::new()));
        let levels: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
        let levels_cb = Arc::clone(&levels);

        frame_tx
            .send(AudioFrame::new(vec![0.1; 16], 16_000))
            .await
            .unwrap();
        drop(frame_tx);

        run_capture(
            frame_rx,
            channel as Arc<dyn SessionChannel>,
            SessionHandle::new(),
            volume,
            move |level| levels_cb.lock().push(level),
            cancel_rx,
        )
        .await;

        let levels = levels.lock();
        assert_eq!(levels.len(), 1);
        // rms(0.1-Konstante) = 0.1, geglättet: 0 * 0.8 + 0.1 * 2.0
        assert!((levels[0] - 0.2).abs() < 1e-5);
    }
}
