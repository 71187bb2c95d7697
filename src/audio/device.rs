//! Audio-Geräte-Schicht - Mikrofon Capture und Playback-Senke
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Die Capture-Seite
//! schneidet den Eingangsstrom in Frames fester Größe und reicht sie
//! über einen Kanal weiter; die Playback-Seite nimmt Samples entgegen
//! und spielt sie über einen Ring-Buffer aus.
//!
//! `AudioBackend` ist die Naht zur restlichen Engine, damit Tests ohne
//! echte Geräte laufen können.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::codec::AudioFrame;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Kapazität des Frame-Kanals zwischen Capture-Callback und Pipeline
const FRAME_CHANNEL_CAPACITY: usize = 16;

/// Ring-Buffer-Größe für Playback (2 Sekunden Headroom bei 24kHz)
const PLAYBACK_BUFFER_SECS: usize = 2;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// CONFIGS
// ============================================================================

/// Angeforderte Capture-Konfiguration.
///
/// Echo-Cancellation und Noise-Suppression sind Wünsche an die Plattform;
/// das Backend darf die nächstgelegene unterstützte Konfiguration liefern.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

/// Playback-Konfiguration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

// ============================================================================
// BOUNDARY TRAITS
// ============================================================================

/// Senke für dekodierte Playback-Samples.
///
/// `now()` ist die monotone Uhr der Ausgabeseite; der Scheduler plant
/// Segment-Starts in dieser Zeitdomäne. `flush()` verwirft alles, was
/// geschrieben aber noch nicht hörbar geworden ist.
pub trait OutputSink: Send + Sync {
    /// Monotone Zeit seit Öffnen der Senke
    fn now(&self) -> Duration;

    /// Hängt Samples an den Geräte-Puffer an
    fn write(&self, samples: &[f32]);

    /// Verwirft gepufferte, noch nicht abgespielte Samples
    fn flush(&self);
}

/// Naht zur Audio-Hardware
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Öffnet das Mikrofon und liefert einen Frame-Strom
    async fn open_capture(&self, config: &CaptureConfig) -> Result<CaptureHandle, AudioError>;

    /// Öffnet das Ausgabegerät
    async fn open_output(&self, config: &OutputConfig) -> Result<Arc<dyn OutputSink>, AudioError>;
}

// ============================================================================
// CAPTURE HANDLE
// ============================================================================

/// cpal-Streams sind !Send. Der Guard hält den Stream nach dem Start nur
/// noch am Leben; einzige Operation danach ist das Drop.
struct StreamGuard(#[allow(dead_code)] Stream);

unsafe impl Send for StreamGuard {}
unsafe impl Sync for StreamGuard {}

/// Hält die Geräte-Ressource am Leben; Drop stoppt den Capture-Stream
pub struct CaptureGuard(#[allow(dead_code)] Option<StreamGuard>);

/// Laufende Mikrofon-Aufnahme: Frame-Empfänger plus Geräte-Guard.
///
/// Der Kanal schließt, wenn der Geräte-Stream endet oder fehlschlägt.
pub struct CaptureHandle {
    frames: mpsc::Receiver<AudioFrame>,
    guard: Option<StreamGuard>,
}

impl CaptureHandle {
    /// Erstellt ein Handle ohne Geräte-Ressource (für Backends ohne Hardware)
    pub fn new(frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self {
            frames,
            guard: None,
        }
    }

    fn with_stream(frames: mpsc::Receiver<AudioFrame>, stream: Stream) -> Self {
        Self {
            frames,
            guard: Some(StreamGuard(stream)),
        }
    }

    /// Trennt Frame-Empfänger und Geräte-Guard.
    ///
    /// Der Guard bleibt bei den Call-Ressourcen, der Empfänger wandert in
    /// die Capture-Pipeline.
    pub fn split(self) -> (mpsc::Receiver<AudioFrame>, CaptureGuard) {
        (self.frames, CaptureGuard(self.guard))
    }
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Standard-Backend über die cpal Default-Geräte
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device, target_rate: u32) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect(), target_rate)
    }

    /// Findet die beste Output-Konfiguration
    fn find_best_output_config(
        device: &Device,
        target_rate: u32,
    ) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect(), target_rate)
    }

    /// Wählt die beste Konfiguration aus einer Liste.
    /// Priorität: Ziel-Rate mit F32 > F32 mit anderer Rate > erste verfügbare.
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
        target_rate: u32,
    ) -> Result<StreamConfig, AudioError> {
        let target = cpal::SampleRate(target_rate);

        for config in &configs {
            if config.min_sample_rate() <= target
                && config.max_sample_rate() >= target
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target
                    && config.max_sample_rate() >= target
                {
                    target
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(AudioError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
    async fn open_capture(&self, config: &CaptureConfig) -> Result<CaptureHandle, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

        let stream_config = Self::find_best_input_config(&device, config.sample_rate)?;
        let source_rate = stream_config.sample_rate.0;
        let source_channels = stream_config.channels as usize;
        let target_rate = config.sample_rate;
        let frame_size = config.frame_size;

        if config.echo_cancellation || config.noise_suppression {
            // Best-effort Wunsch; dieses Backend hat keine Verarbeitungskette
            tracing::debug!(
                "Echo cancellation / noise suppression requested, not available on this backend"
            );
        }

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels (requested {} Hz mono)",
            source_rate,
            source_channels,
            target_rate
        );

        let (tx, rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_CAPACITY);
        let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 2);

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Auf Mono reduzieren (erster Kanal)
                    let mono: Vec<f32> = if source_channels > 1 {
                        data.iter().step_by(source_channels).copied().collect()
                    } else {
                        data.to_vec()
                    };

                    // Resampling falls nötig (einfaches Linear-Resampling)
                    let samples: Vec<f32> = if source_rate != target_rate {
                        let ratio = target_rate as f32 / source_rate as f32;
                        let new_len = (mono.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = mono.get(idx).copied().unwrap_or(0.0);
                                let s2 = mono.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        mono
                    };

                    pending.extend_from_slice(&samples);

                    // Strikte Reihenfolge: Frames in Scheib-Reihenfolge senden
                    while pending.len() >= frame_size {
                        let frame: Vec<f32> = pending.drain(..frame_size).collect();
                        if tx.try_send(AudioFrame::new(frame, target_rate)).is_err() {
                            // Pipeline hängt oder ist weg; Frame verwerfen
                            tracing::warn!("Capture frame dropped, pipeline not keeping up");
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(CaptureHandle::with_stream(rx, stream))
    }

    async fn open_output(&self, config: &OutputConfig) -> Result<Arc<dyn OutputSink>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let stream_config = Self::find_best_output_config(&device, config.sample_rate)?;
        let target_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        let source_rate = config.sample_rate;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels (requested {} Hz mono)",
            target_rate,
            channels,
            source_rate
        );

        let capacity = config.sample_rate as usize * PLAYBACK_BUFFER_SECS;
        let buffer: Arc<Mutex<HeapRb<f32>>> = Arc::new(Mutex::new(HeapRb::new(capacity)));
        let callback_buffer = Arc::clone(&buffer);

        let ratio = source_rate as f32 / target_rate as f32;
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = callback_buffer.lock();
                    render_output(data, channels, ratio, || buffer.try_pop());
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Arc::new(SpeakerSink {
            buffer,
            opened_at: Instant::now(),
            _stream: StreamGuard(stream),
        }))
    }
}

/// Füllt den Ausgabe-Puffer aus der Quell-Pop-Funktion und rechnet dabei
/// auf die Geräte-Rate um.
///
/// Die Quelle läuft mit `ratio` Quell-Samples pro Ausgabe-Frame. Frames
/// ohne fälliges Quell-Sample (Hochtakten, ratio < 1) wiederholen das
/// zuletzt entnommene Sample (Zero-Order-Hold); leere Quelle liefert
/// Stille.
fn render_output<P>(data: &mut [f32], channels: usize, ratio: f32, mut pop: P)
where
    P: FnMut() -> Option<f32>,
{
    let frames = data.len() / channels;
    let mut carry = 0.0f32;
    let mut sample = 0.0f32;
    for i in 0..frames {
        // Positionsdifferenz in Quell-Samples aufakkumulieren
        carry += ratio;
        while carry >= 1.0 {
            sample = pop().unwrap_or(0.0);
            carry -= 1.0;
        }

        // Auf alle Kanäle verteilen
        for c in 0..channels {
            if let Some(out) = data.get_mut(i * channels + c) {
                *out = sample;
            }
        }
    }
}

// ============================================================================
// SPEAKER SINK
// ============================================================================

/// Playback-Senke über den cpal-Ring-Buffer
struct SpeakerSink {
    buffer: Arc<Mutex<HeapRb<f32>>>,
    opened_at: Instant,
    _stream: StreamGuard,
}

impl OutputSink for SpeakerSink {
    fn now(&self) -> Duration {
        self.opened_at.elapsed()
    }

    fn write(&self, samples: &[f32]) {
        let mut buffer = self.buffer.lock();
        for &sample in samples {
            if buffer.try_push(sample).is_err() {
                tracing::warn!("Playback buffer full, dropping samples");
                break;
            }
        }
    }

    fn flush(&self) {
        let mut buffer = self.buffer.lock();
        while buffer.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_output_haelt_letztes_sample_beim_hochtakten() {
        // 24kHz Quelle auf 48kHz Gerät (ratio 0.5): jedes Quell-Sample
        // erscheint doppelt, keine eingestreute Stille
        let mut source = vec![0.1f32, 0.2, 0.3].into_iter();
        let mut data = [9.0f32; 8];
        render_output(&mut data, 1, 0.5, || source.next());

        // Vor dem ersten Pop gibt es noch kein Sample zum Halten
        assert_eq!(
            data,
            [0.0, 0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.0],
            "Frames ohne fälliges Quell-Sample müssen das letzte wiederholen"
        );
    }

    #[test]
    fn render_output_gleiche_rate_reicht_durch() {
        let mut source = vec![0.1f32, -0.2, 0.3, -0.4].into_iter();
        let mut data = [0.0f32; 4];
        render_output(&mut data, 1, 1.0, || source.next());
        assert_eq!(data, [0.1, -0.2, 0.3, -0.4]);
    }

    #[test]
    fn render_output_dupliziert_mono_auf_alle_kanaele() {
        let mut source = vec![0.5f32, -0.5].into_iter();
        let mut data = [0.0f32; 4];
        render_output(&mut data, 2, 1.0, || source.next());
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn render_output_leere_quelle_ist_stille() {
        let mut data = [9.0f32; 4];
        render_output(&mut data, 1, 0.5, || None);
        assert_eq!(data, [0.0; 4]);
    }

    #[tokio::test]
    async fn capture_handle_split_ohne_geraet() {
        let (tx, rx) = mpsc::channel(4);
        let handle = CaptureHandle::new(rx);
        let (mut frames, _guard) = handle.split();

        tx.send(AudioFrame::new(vec![0.1; 8], 16_000))
            .await
            .expect("Senden sollte klappen");
        drop(tx);

        let frame = frames.recv().await.expect("Frame erwartet");
        assert_eq!(frame.samples.len(), 8);
        assert!(frames.recv().await.is_none(), "Kanal muss geschlossen sein");
    }
}
