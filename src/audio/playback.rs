//! Playback-Scheduler - lückenlose Wiedergabe eingehender Segmente
//!
//! Eingehende, dekodierte Segmente landen in einer FIFO-Queue und werden
//! über eine virtuelle Playback-Uhr geplant: Segment n+1 startet nie vor
//! dem Ende von Segment n und nie in der Vergangenheit. Eine Barge-in-
//! Unterbrechung verwirft alles Wartende und setzt die Uhr auf "jetzt",
//! damit das nächste Segment sofort startet.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::device::OutputSink;

// ============================================================================
// PLAYBACK SEGMENT
// ============================================================================

/// Ein dekodiertes Segment mit bekannter Abspieldauer
#[derive(Debug, Clone)]
pub struct PlaybackSegment {
    pub samples: Vec<f32>,
    pub duration: Duration,
}

impl PlaybackSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);
        Self { samples, duration }
    }
}

// ============================================================================
// SCHEDULER STATE
// ============================================================================

/// Queue und Uhr; genau ein Schreiber (die Drain-Task bzw. die
/// serialisierten Scheduler-Aufrufe).
struct SchedulerState {
    queue: VecDeque<PlaybackSegment>,
    /// Frühester Start des nächsten Segments (Uhr der Ausgabeseite)
    next_start: Duration,
    /// Läuft gerade eine Drain-Task?
    draining: bool,
}

impl SchedulerState {
    /// Plant das nächste Segment: nie in der Vergangenheit, nie vor dem
    /// Ende des zuvor geplanten Segments. Gibt den Startzeitpunkt zurück.
    fn plan(&mut self, duration: Duration, now: Duration) -> Duration {
        let start_at = self.next_start.max(now);
        self.next_start = start_at + duration;
        start_at
    }
}

// ============================================================================
// PLAYBACK SCHEDULER
// ============================================================================

/// Scheduler für die Wiedergabe-Queue eines Anrufs
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    sink: Arc<dyn OutputSink>,
    state: Mutex<SchedulerState>,
    /// Unterbrechungs-Epoche; ein Wechsel verwirft das gerade geplante Segment
    epoch_tx: watch::Sender<u64>,
}

impl PlaybackScheduler {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let next_start = sink.now();

        Self {
            inner: Arc::new(SchedulerInner {
                sink,
                state: Mutex::new(SchedulerState {
                    queue: VecDeque::new(),
                    next_start,
                    draining: false,
                }),
                epoch_tx,
            }),
        }
    }

    /// Nimmt ein eingehendes Segment in Empfangs-Reihenfolge auf und
    /// startet die Drain-Task, falls keine läuft.
    pub fn on_segment(&self, segment: PlaybackSegment) {
        let spawn_drain = {
            let mut state = self.inner.state.lock();
            state.queue.push_back(segment);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if spawn_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain(inner));
        }
    }

    /// Barge-in: verwirft alles Wartende, setzt die Uhr auf "jetzt" und
    /// bricht bereits gepuffertes Audio ab.
    pub fn on_interrupt(&self) {
        {
            let mut state = self.inner.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            state.next_start = self.inner.sink.now();
            if dropped > 0 {
                tracing::debug!("Interrupt: dropped {} queued segments", dropped);
            }
        }

        // Epoche wechseln weckt eine wartende Drain-Task und entwertet
        // deren bereits entnommenes Segment
        self.inner.epoch_tx.send_modify(|epoch| *epoch += 1);
        self.inner.sink.flush();
    }

    /// Verwirft Queue und setzt die Uhr zurück (Teardown)
    pub fn clear(&self) {
        self.on_interrupt();
    }

    /// Anzahl wartender Segmente
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

/// Drain-Schleife: pro Durchlauf ein Segment planen, bis zum Startzeitpunkt
/// warten, schreiben. Endet, wenn die Queue leer ist.
async fn drain(inner: Arc<SchedulerInner>) {
    let mut epoch_rx = inner.epoch_tx.subscribe();

    loop {
        // Epoche markieren, bevor das Segment entnommen wird
        epoch_rx.borrow_and_update();

        let (segment, start_at) = {
            let mut state = inner.state.lock();
            match state.queue.pop_front() {
                Some(segment) => {
                    let now = inner.sink.now();
                    let start_at = state.plan(segment.duration, now);
                    (segment, start_at)
                }
                None => {
                    // Queue leer: Wiedergabe ist idle, nächstes Segment
                    // startet eine neue Drain-Task
                    state.draining = false;
                    return;
                }
            }
        };

        // Bis zum geplanten Start warten; eine Unterbrechung entwertet
        // das entnommene Segment
        let mut cancelled = false;
        loop {
            let now = inner.sink.now();
            if now >= start_at {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(start_at - now) => {}
                changed = epoch_rx.changed() => {
                    if changed.is_ok() {
                        cancelled = true;
                    }
                    break;
                }
            }
        }

        if !cancelled {
            inner.sink.write(&segment.samples);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use tokio::time::Instant;

    /// Senke, die Schreibzeitpunkte aufzeichnet statt Audio auszugeben
    struct RecordingSink {
        origin: Instant,
        writes: PlMutex<Vec<(Duration, usize)>>,
        flushes: PlMutex<usize>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                origin: Instant::now(),
                writes: PlMutex::new(Vec::new()),
                flushes: PlMutex::new(0),
            })
        }
    }

    impl OutputSink for RecordingSink {
        fn now(&self) -> Duration {
            self.origin.elapsed()
        }

        fn write(&self, samples: &[f32]) {
            self.writes.lock().push((self.now(), samples.len()));
        }

        fn flush(&self) {
            *self.flushes.lock() += 1;
        }
    }

    fn segment_ms(ms: u64) -> PlaybackSegment {
        // 24 Samples pro ms bei 24kHz
        PlaybackSegment::new(vec![0.0; (ms * 24) as usize], 24_000)
    }

    #[test]
    fn plan_startet_nie_in_der_vergangenheit() {
        let mut state = SchedulerState {
            queue: VecDeque::new(),
            next_start: Duration::from_millis(100),
            draining: false,
        };

        // Uhr liegt vor next_start: Start wird auf "jetzt" gehoben
        let start = state.plan(Duration::from_millis(50), Duration::from_millis(300));
        assert_eq!(start, Duration::from_millis(300));
        assert_eq!(state.next_start, Duration::from_millis(350));
    }

    #[test]
    fn plan_komprimiert_geplante_zukunft_nicht() {
        let mut state = SchedulerState {
            queue: VecDeque::new(),
            next_start: Duration::from_millis(500),
            draining: false,
        };

        // Uhr liegt hinter next_start: geplante Zukunft bleibt bestehen
        let start = state.plan(Duration::from_millis(100), Duration::from_millis(200));
        assert_eq!(start, Duration::from_millis(500));
        assert_eq!(state.next_start, Duration::from_millis(600));
    }

    #[test]
    fn plan_sequenz_monoton_und_ueberlappungsfrei() {
        let mut state = SchedulerState {
            queue: VecDeque::new(),
            next_start: Duration::ZERO,
            draining: false,
        };

        let durations = [80u64, 120, 40, 200, 60];
        let mut previous_end = Duration::ZERO;
        for &ms in &durations {
            let duration = Duration::from_millis(ms);
            let start = state.plan(duration, Duration::ZERO);
            assert!(
                start >= previous_end,
                "Segmente dürfen sich nicht überlappen"
            );
            previous_end = start + duration;
        }
        // Kumulative Summe aller Dauern
        assert_eq!(previous_end, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn segmente_werden_in_reihenfolge_geschrieben() {
        let sink = RecordingSink::new();
        let scheduler = PlaybackScheduler::new(sink.clone() as Arc<dyn OutputSink>);

        scheduler.on_segment(segment_ms(100));
        scheduler.on_segment(segment_ms(50));
        scheduler.on_segment(segment_ms(50));

        // Zeit auto-advanced bis alle Segmente geschrieben sind
        tokio::time::sleep(Duration::from_millis(500)).await;

        let writes = sink.writes.lock();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].1, 2400);
        assert_eq!(writes[1].1, 1200);
        // Startzeiten monoton nicht-fallend
        assert!(writes[0].0 <= writes[1].0);
        assert!(writes[1].0 <= writes[2].0);
        // Zweites Segment frühestens nach Ende des ersten
        assert!(writes[1].0 >= writes[0].0 + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_leert_queue_und_setzt_uhr_zurueck() {
        let sink = RecordingSink::new();
        let scheduler = PlaybackScheduler::new(sink.clone() as Arc<dyn OutputSink>);

        for _ in 0..4 {
            scheduler.on_segment(segment_ms(200));
        }
        tokio::task::yield_now().await;

        scheduler.on_interrupt();
        assert_eq!(scheduler.queued(), 0, "Queue muss nach Interrupt leer sein");
        assert!(*sink.flushes.lock() >= 1, "Gepuffertes Audio muss verworfen werden");

        // Das nächste Segment startet sofort, nicht nach den verworfenen
        let before = sink.now();
        scheduler.on_segment(segment_ms(50));
        tokio::time::sleep(Duration::from_millis(300)).await;

        let writes = sink.writes.lock();
        let last = writes.last().expect("Segment nach Interrupt muss spielen");
        assert_eq!(last.1, 1200);
        assert!(
            last.0 <= before + Duration::from_millis(60),
            "Segment nach Interrupt darf nicht hinter verworfenen Segmenten warten"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn leere_queue_macht_wiedergabe_idle() {
        let sink = RecordingSink::new();
        let scheduler = PlaybackScheduler::new(sink.clone() as Arc<dyn OutputSink>);

        scheduler.on_segment(segment_ms(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.writes.lock().len(), 1);

        // Späteres Segment startet eine neue Drain-Task
        scheduler.on_segment(segment_ms(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.writes.lock().len(), 2);
    }
}
