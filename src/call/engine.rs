//! Call Engine - Lebenszyklus eines Sprach-Anrufs
//!
//! Die Engine besitzt den gesamten Anruf-Zustand und treibt den Ablauf
//! Idle → Ringing → Connecting → Active → Ended → Idle. Ein Driver-Task
//! pro Anruf führt die Phasen aus; `hangup` signalisiert Abbruch über
//! einen Watch-Kanal und wartet, bis der Driver fertig ist. Jede
//! wartende Operation im Driver läuft im Select gegen dieses Signal,
//! Abbruch gewinnt in jeder Phase.
//!
//! Teardown ist der einzige Pfad zurück nach Idle und gibt Ressourcen in
//! umgekehrter Erwerbs-Reihenfolge frei. Er ist idempotent und über einen
//! async Mutex serialisiert, damit Driver und `hangup` sich nicht in die
//! Quere kommen.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::ring::RingIndicator;
use crate::audio::{
    decode_pcm16, run_capture, AudioBackend, CaptureConfig, CaptureEnd, CaptureGuard,
    OutputConfig, OutputSink, PlaybackScheduler, PlaybackSegment, VolumeMeter,
};
use crate::config::{CallConfig, CHANNELS};
use crate::session::{SessionChannel, SessionConfig, SessionEvent, SessionHandle};

// ============================================================================
// STATE & EVENTS
// ============================================================================

/// Anruf-Zustand; genau einer zu jedem Zeitpunkt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Ringing,
    Connecting,
    Active,
    Ended,
}

/// Events für Beobachter (UI, Logging)
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    /// Geglätteter Mikrofon-Pegel in [0, 1]
    VolumeLevel(f32),
    Error(String),
}

/// Momentaufnahme des beobachtbaren Zustands
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub state: CallState,
    pub volume: f32,
    pub last_error: Option<String>,
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("A call is already in progress")]
    AlreadyInCall,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to open session: {0}")]
    ChannelOpenFailed(String),

    #[error("Session error: {0}")]
    ChannelError(String),

    #[error("Audio device lost: {0}")]
    DeviceLost(String),
}

// ============================================================================
// CALL RESOURCES
// ============================================================================

/// Während des Aufbaus erworbene Ressourcen; Teardown nimmt, was da ist
#[derive(Default)]
struct CallResources {
    capture_guard: Option<CaptureGuard>,
    sink: Option<Arc<dyn OutputSink>>,
    scheduler: Option<PlaybackScheduler>,
    session: Option<SessionHandle>,
    capture_task: Option<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
}

// ============================================================================
// ENGINE
// ============================================================================

struct EngineShared {
    config: CallConfig,
    channel: Arc<dyn SessionChannel>,
    audio: Arc<dyn AudioBackend>,
    ringer: Arc<dyn RingIndicator>,

    state: Mutex<CallState>,
    last_error: Mutex<Option<String>>,
    volume: Arc<Mutex<VolumeMeter>>,
    resources: Mutex<CallResources>,

    /// Abbruch-Signal des laufenden Anrufs
    cancel_tx: Mutex<Option<watch::Sender<bool>>>,
    /// Driver-Task des laufenden Anrufs; `hangup` wartet auf ihn
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Serialisiert Teardown zwischen Driver und `hangup`
    teardown_lock: tokio::sync::Mutex<()>,

    event_tx: broadcast::Sender<CallEvent>,
}

/// Ende des Aufbau-Pfads im Driver
enum DriverEnd {
    Cancelled,
    Failed(CallError),
}

/// Sprach-Anruf-Engine.
///
/// Klonbar; alle Klone teilen denselben Anruf-Zustand.
#[derive(Clone)]
pub struct CallEngine {
    shared: Arc<EngineShared>,
}

impl CallEngine {
    pub fn new(
        config: CallConfig,
        channel: Arc<dyn SessionChannel>,
        audio: Arc<dyn AudioBackend>,
        ringer: Arc<dyn RingIndicator>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: Arc::new(EngineShared {
                config,
                channel,
                audio,
                ringer,
                state: Mutex::new(CallState::Idle),
                last_error: Mutex::new(None),
                volume: Arc::new(Mutex::new(VolumeMeter::new())),
                resources: Mutex::new(CallResources::default()),
                cancel_tx: Mutex::new(None),
                driver: Mutex::new(None),
                teardown_lock: tokio::sync::Mutex::new(()),
                event_tx,
            }),
        }
    }

    /// Startet einen Anruf.
    ///
    /// Geht sofort nach Ringing und kehrt zurück, sobald der Anruf Active
    /// ist, der Aufbau fehlgeschlagen ist oder `hangup` ihn abgebrochen
    /// hat. Abbruch ist kein Fehler.
    pub async fn dial(&self) -> Result<(), CallError> {
        {
            let mut state = self.shared.state.lock();
            if *state != CallState::Idle {
                return Err(CallError::AlreadyInCall);
            }
            *state = CallState::Ringing;
        }
        *self.shared.last_error.lock() = None;
        self.shared.emit(CallEvent::StateChanged(CallState::Ringing));
        tracing::info!("Dialing");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.shared.cancel_tx.lock() = Some(cancel_tx);

        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let driver = tokio::spawn(async move {
            let mut cancel_rx = cancel_rx;
            match run_call(&shared, &mut cancel_rx).await {
                Ok(fault_rx) => {
                    let _ = done_tx.send(Ok(()));
                    supervise(&shared, cancel_rx, fault_rx).await;
                }
                Err(DriverEnd::Cancelled) => {
                    shared.teardown(None).await;
                    let _ = done_tx.send(Ok(()));
                }
                Err(DriverEnd::Failed(error)) => {
                    shared.teardown(Some(error.clone())).await;
                    let _ = done_tx.send(Err(error));
                }
            }
        });
        *self.shared.driver.lock() = Some(driver);

        match done_rx.await {
            Ok(result) => result,
            // Driver wurde hart beendet; hangup hat aufgeräumt
            Err(_) => Ok(()),
        }
    }

    /// Beendet den Anruf, egal in welcher Phase.
    ///
    /// Kehrt erst zurück, wenn alle Ressourcen freigegeben sind und die
    /// Engine wieder Idle ist. Im Idle ein No-op.
    pub async fn hangup(&self) {
        if let Some(cancel) = self.shared.cancel_tx.lock().as_ref() {
            let _ = cancel.send(true);
        }

        // Driver zu Ende laufen lassen; ein schwebendes Öffnen wird dort
        // gegen das Abbruch-Signal aufgelöst
        let driver = self.shared.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }

        self.shared.teardown(None).await;
    }

    /// Aktueller Zustand
    pub fn state(&self) -> CallState {
        *self.shared.state.lock()
    }

    /// Momentaufnahme von Zustand, Pegel und letztem Fehler
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: *self.shared.state.lock(),
            volume: self.shared.volume.lock().level(),
            last_error: self.shared.last_error.lock().clone(),
        }
    }

    /// Event-Receiver für Zustands-, Pegel- und Fehler-Events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

impl EngineShared {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, state: CallState) {
        *self.state.lock() = state;
        self.emit(CallEvent::StateChanged(state));
    }

    /// Einziger Pfad zurück nach Idle.
    ///
    /// Gibt alle noch gehaltenen Ressourcen in umgekehrter Erwerbs-
    /// Reihenfolge frei. Mehrfache Aufrufe sind harmlos.
    async fn teardown(&self, error: Option<CallError>) {
        let _guard = self.teardown_lock.lock().await;

        // Abbruch signalisieren, damit Capture- und Event-Task sich
        // selbst beenden, auch wenn Teardown vom Driver kommt
        if let Some(cancel) = self.cancel_tx.lock().take() {
            let _ = cancel.send(true);
        }

        let resources = std::mem::take(&mut *self.resources.lock());

        let was_in_call = {
            let mut state = self.state.lock();
            if *state == CallState::Idle {
                false
            } else {
                *state = CallState::Ended;
                true
            }
        };
        if was_in_call {
            self.emit(CallEvent::StateChanged(CallState::Ended));
        }

        // 1. Hintergrund-Tasks: ab hier wirkt kein Callback mehr
        if let Some(task) = resources.event_task {
            task.abort();
        }
        if let Some(task) = resources.capture_task {
            task.abort();
        }

        // 2. Session schließen
        if let Some(session) = resources.session {
            self.channel.close(&session).await;
        }

        // 3. Mikrofon freigeben
        drop(resources.capture_guard);

        // 4. Wiedergabe: Queue und Puffer leeren, Senke freigeben
        if let Some(scheduler) = resources.scheduler {
            scheduler.clear();
        }
        drop(resources.sink);

        // 5. Pegel zurücksetzen
        self.volume.lock().reset();

        if let Some(ref error) = error {
            tracing::error!("Call ended with error: {}", error);
            *self.last_error.lock() = Some(error.to_string());
            self.emit(CallEvent::Error(error.to_string()));
        }

        if was_in_call {
            self.set_state(CallState::Idle);
            self.emit(CallEvent::VolumeLevel(0.0));
            tracing::info!("Call ended");
        }
    }
}

// ============================================================================
// DRIVER
// ============================================================================

/// Wartet auf `fut`, es sei denn das Abbruch-Signal feuert zuerst
async fn with_cancel<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, DriverEnd> {
    if *cancel.borrow() {
        return Err(DriverEnd::Cancelled);
    }

    tokio::select! {
        _ = cancel.changed() => Err(DriverEnd::Cancelled),
        value = fut => Ok(value),
    }
}

/// Führt Ringing und Connecting aus und startet die Active-Tasks.
///
/// Liefert den Fault-Receiver für die Supervision zurück; Fehler nach
/// diesem Punkt laufen über den Fault-Kanal statt über den Rückgabewert.
async fn run_call(
    shared: &Arc<EngineShared>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<mpsc::Receiver<Option<CallError>>, DriverEnd> {
    let config = &shared.config;

    // --- Ringing ---
    if let Err(e) = shared.ringer.start() {
        tracing::warn!("Ring indication failed to start: {}", e);
    }
    let rung = with_cancel(cancel, tokio::time::sleep(config.ring_duration)).await;
    shared.ringer.stop();
    rung?;

    // --- Connecting ---
    shared.set_state(CallState::Connecting);
    tracing::info!("Connecting");

    let capture = with_cancel(
        cancel,
        shared.audio.open_capture(&CaptureConfig {
            sample_rate: config.capture_sample_rate,
            channels: CHANNELS,
            frame_size: config.frame_size,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
        }),
    )
    .await?
    .map_err(|e| DriverEnd::Failed(CallError::PermissionDenied(e.to_string())))?;

    let (frames, capture_guard) = capture.split();
    shared.resources.lock().capture_guard = Some(capture_guard);

    let sink = with_cancel(
        cancel,
        shared.audio.open_output(&OutputConfig {
            sample_rate: config.playback_sample_rate,
            channels: CHANNELS,
        }),
    )
    .await?
    .map_err(|e| DriverEnd::Failed(CallError::DeviceLost(e.to_string())))?;

    let scheduler = PlaybackScheduler::new(Arc::clone(&sink));
    {
        let mut resources = shared.resources.lock();
        resources.sink = Some(sink);
        resources.scheduler = Some(scheduler.clone());
    }

    // Vor dem Öffnen abonnieren, damit kein frühes Event verloren geht
    let events = shared.channel.subscribe();

    let session = with_cancel(
        cancel,
        shared.channel.open(&SessionConfig {
            persona: config.persona.clone(),
            voice: config.voice.clone(),
            input_sample_rate: config.capture_sample_rate,
            output_sample_rate: config.playback_sample_rate,
        }),
    )
    .await?
    .map_err(|e| DriverEnd::Failed(CallError::ChannelOpenFailed(e.to_string())))?;

    shared.resources.lock().session = Some(session.clone());

    // Hangup könnte das Öffnen knapp verpasst haben
    if *cancel.borrow() {
        return Err(DriverEnd::Cancelled);
    }

    // --- Active ---
    let (fault_tx, fault_rx) = mpsc::channel::<Option<CallError>>(4);

    let capture_task = tokio::spawn(capture_loop(
        frames,
        Arc::clone(&shared.channel),
        session.clone(),
        Arc::clone(&shared.volume),
        shared.event_tx.clone(),
        fault_tx.clone(),
        cancel.clone(),
    ));

    let event_task = tokio::spawn(session_loop(
        events,
        session,
        scheduler,
        config.playback_sample_rate,
        fault_tx,
        cancel.clone(),
    ));

    {
        let mut resources = shared.resources.lock();
        resources.capture_task = Some(capture_task);
        resources.event_task = Some(event_task);
    }

    shared.set_state(CallState::Active);
    tracing::info!("Call active");

    Ok(fault_rx)
}

/// Wartet im Active-Zustand auf Abbruch oder den ersten Fault.
///
/// Bei Abbruch übernimmt `hangup` das Teardown; ein Fault führt es hier
/// aus. `None` ist ein reguläres Ende (Gegenseite hat geschlossen).
async fn supervise(
    shared: &Arc<EngineShared>,
    mut cancel: watch::Receiver<bool>,
    mut fault_rx: mpsc::Receiver<Option<CallError>>,
) {
    tokio::select! {
        _ = cancel.changed() => {}
        fault = fault_rx.recv() => {
            if let Some(error) = fault {
                shared.teardown(error).await;
            }
        }
    }
}

/// Capture-Pipeline plus Pegel-Events; meldet Geräteverlust als Fault
async fn capture_loop(
    frames: mpsc::Receiver<crate::audio::AudioFrame>,
    channel: Arc<dyn SessionChannel>,
    session: SessionHandle,
    volume: Arc<Mutex<VolumeMeter>>,
    event_tx: broadcast::Sender<CallEvent>,
    fault_tx: mpsc::Sender<Option<CallError>>,
    cancel: watch::Receiver<bool>,
) {
    let on_level = move |level: f32| {
        let _ = event_tx.send(CallEvent::VolumeLevel(level));
    };

    let end = run_capture(frames, channel, session, volume, on_level, cancel).await;
    if end == CaptureEnd::DeviceLost {
        let _ = fault_tx
            .send(Some(CallError::DeviceLost(
                "capture stream ended".to_string(),
            )))
            .await;
    }
}

/// Reagiert auf Kanal-Events: Segmente einplanen, Barge-in, Close, Fehler
async fn session_loop(
    mut events: broadcast::Receiver<SessionEvent>,
    session: SessionHandle,
    scheduler: PlaybackScheduler,
    playback_rate: u32,
    fault_tx: mpsc::Sender<Option<CallError>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            return;
        }

        let event = tokio::select! {
            _ = cancel.changed() => return,
            event = events.recv() => event,
        };

        match event {
            Ok(SessionEvent::Segment { session: s, data }) if s == session => {
                let samples = decode_pcm16(&data);
                scheduler.on_segment(PlaybackSegment::new(samples, playback_rate));
            }

            Ok(SessionEvent::Interrupted { session: s }) if s == session => {
                tracing::debug!("Barge-in: flushing playback");
                scheduler.on_interrupt();
            }

            Ok(SessionEvent::Closed { session: s }) if s == session => {
                tracing::info!("Session closed by service");
                let _ = fault_tx.send(None).await;
                return;
            }

            Ok(SessionEvent::Error { session: s, message }) if s == session => {
                let _ = fault_tx
                    .send(Some(CallError::ChannelError(message)))
                    .await;
                return;
            }

            // Event einer anderen (alten) Session
            Ok(_) => {}

            // Verpasste Events können Segmente (hörbare Lücke) oder ein
            // Interrupted/Closed gewesen sein; der Anruf ist nicht mehr
            // vertrauenswürdig
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Session event stream lagged, {} events dropped", skipped);
                let _ = fault_tx
                    .send(Some(CallError::ChannelError(format!(
                        "event stream lagged, {} events lost",
                        skipped
                    ))))
                    .await;
                return;
            }

            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
