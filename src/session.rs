//! Polling loop and session lifecycle.
//!
//! `DetectionController` owns the session: the detection store, the unique
//! counter, the live confidence threshold and the tick scheduler. `start`,
//! `stop`, `reset` and `set_confidence_threshold` are the only mutators.
//!
//! Each tick runs capture -> infer -> dedupe. Ticks never overlap: a tick that
//! fires while the previous one is still outstanding is dropped, not queued.
//! `stop` cancels the scheduler but cannot abort an inference call already on
//! the wire; when that call returns, its result is discarded because the
//! session epoch it was started under is no longer running.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::detect::{InferenceClient, RawDetection};
use crate::display::visible_records;
use crate::error::{CaptureError, InferenceError, SessionError};
use crate::filter::{Confidence, SharedThreshold};
use crate::frame::{CaptureStats, FrameCapture};
use crate::ingest::VideoSource;
use crate::store::{DetectionRecord, DetectionSnapshot, DetectionStore, OfferOutcome};

/// Poll interval used when nothing else is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Running,
    Stopped,
}

/// Point-in-time view of the session for presentation.
#[derive(Clone, Debug, Serialize)]
pub struct SessionState {
    pub lifecycle: LifecycleState,
    pub running: bool,
    pub confidence_threshold: f32,
    pub unique_count: u64,
    /// Set when inference halted the loop; cleared by the next `start`.
    pub last_error: Option<String>,
    pub ticks_completed: u64,
    /// Ticks dropped because the previous tick was still outstanding.
    pub ticks_skipped: u64,
    /// Ticks skipped because the video source had no frame.
    pub captures_unavailable: u64,
    /// Completion time of the last successful inference. Survives stop and
    /// reset, so a stalled feed can be told apart from an empty one.
    pub last_update: Option<SystemTime>,
}

/// Notifications for presentation consumers.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Detected(DetectionRecord),
    Halted { error: InferenceError },
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub poll_interval: Duration,
    pub confidence: Confidence,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            confidence: Confidence::default(),
        }
    }
}

struct Session {
    lifecycle: LifecycleState,
    /// Incremented by every `start`; tick results carry the epoch they began in.
    epoch: u64,
    store: DetectionStore,
    unique_count: u64,
    last_error: Option<InferenceError>,
    ticks_completed: u64,
    ticks_skipped: u64,
    captures_unavailable: u64,
    last_update: Option<SystemTime>,
    scheduler: Option<JoinHandle<()>>,
}

impl Session {
    fn new() -> Self {
        Self {
            lifecycle: LifecycleState::Idle,
            epoch: 0,
            store: DetectionStore::new(),
            unique_count: 0,
            last_error: None,
            ticks_completed: 0,
            ticks_skipped: 0,
            captures_unavailable: 0,
            last_update: None,
            scheduler: None,
        }
    }

    fn clear_detections(&mut self) {
        self.store.clear();
        self.unique_count = 0;
    }

    fn cancel_scheduler(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.abort();
        }
    }
}

enum TickOutcome {
    Unavailable(CaptureError),
    Inferred(Result<Vec<RawDetection>, InferenceError>),
}

/// Capture counters and readiness, readable without the capture lock.
#[derive(Debug)]
struct CaptureCounters {
    frames_captured: AtomicU64,
    unavailable: AtomicU64,
    source_ready: AtomicBool,
}

impl CaptureCounters {
    fn new(stats: &CaptureStats) -> Self {
        Self {
            frames_captured: AtomicU64::new(stats.frames_captured),
            unavailable: AtomicU64::new(stats.unavailable),
            source_ready: AtomicBool::new(false),
        }
    }

    fn record(&self, stats: &CaptureStats, ready: bool) {
        self.frames_captured
            .store(stats.frames_captured, Ordering::Release);
        self.unavailable.store(stats.unavailable, Ordering::Release);
        self.source_ready.store(ready, Ordering::Release);
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::Acquire),
            unavailable: self.unavailable.load(Ordering::Acquire),
        }
    }
}

struct Inner<S: VideoSource, C: InferenceClient> {
    /// Held for a whole capture, which can block on the source. Async code
    /// only ever `try_lock`s it.
    capture: Mutex<FrameCapture<S>>,
    counters: CaptureCounters,
    source_name: String,
    client: Arc<C>,
    session: Mutex<Session>,
    threshold: SharedThreshold,
    in_flight: AtomicBool,
    poll_interval: Duration,
    events: broadcast::Sender<SessionEvent>,
}

/// Clears the in-flight flag when a tick finishes, however it finishes.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S, C> Inner<S, C>
where
    S: VideoSource + 'static,
    C: InferenceClient + 'static,
{
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_capture(&self) -> MutexGuard<'_, FrameCapture<S>> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Readiness without waiting on a capture in progress. While a capture
    /// holds the lock, the outcome of the last capture stands in.
    fn source_ready(&self) -> bool {
        match self.capture.try_lock() {
            Ok(capture) => self.refresh_ready(&capture),
            Err(TryLockError::Poisoned(poisoned)) => self.refresh_ready(&poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => self.counters.source_ready.load(Ordering::Acquire),
        }
    }

    fn refresh_ready(&self, capture: &FrameCapture<S>) -> bool {
        let ready = capture.is_ready();
        self.counters.source_ready.store(ready, Ordering::Release);
        ready
    }

    fn is_current(&self, epoch: u64) -> bool {
        let session = self.lock_session();
        session.epoch == epoch && session.lifecycle == LifecycleState::Running
    }

    /// Blocking half of a tick. Runs on tokio's blocking pool.
    fn capture_and_infer(&self) -> TickOutcome {
        // The capture lock is released before the (slow) inference call.
        let captured = {
            let mut capture = self.lock_capture();
            let captured = capture.capture();
            self.counters.record(&capture.stats(), captured.is_ok());
            captured
        };
        let frame = match captured {
            Ok(frame) => frame,
            Err(err) => return TickOutcome::Unavailable(err),
        };
        TickOutcome::Inferred(self.client.infer(&frame))
    }

    fn apply(&self, epoch: u64, outcome: TickOutcome) {
        let mut session = self.lock_session();
        if session.epoch != epoch || session.lifecycle != LifecycleState::Running {
            if let TickOutcome::Inferred(_) = outcome {
                log::warn!(
                    "discarding inference result from session epoch {} (session no longer running)",
                    epoch
                );
            }
            return;
        }

        match outcome {
            TickOutcome::Unavailable(err) => {
                session.captures_unavailable += 1;
                log::debug!("tick skipped: {}", err);
            }
            TickOutcome::Inferred(Ok(detections)) => {
                let threshold = self.threshold.get();
                let mut accepted = 0u64;
                for detection in &detections {
                    if let OfferOutcome::Accepted(record) =
                        session.store.offer(detection, threshold)
                    {
                        accepted += 1;
                        log::info!(
                            "new detection key={} class={} conf={:.2}",
                            record.id,
                            record.detection.class_id,
                            record.detection.confidence
                        );
                        let _ = self.events.send(SessionEvent::Detected(record));
                    }
                }
                session.unique_count += accepted;
                session.ticks_completed += 1;
                session.last_update = Some(SystemTime::now());
                log::debug!(
                    "tick complete: {} raw, {} new, {} unique",
                    detections.len(),
                    accepted,
                    session.unique_count
                );
            }
            TickOutcome::Inferred(Err(err)) => {
                log::error!("inference failed, stopping detection loop: {}", err);
                session.cancel_scheduler();
                session.lifecycle = LifecycleState::Stopped;
                session.last_error = Some(err.clone());
                let _ = self.events.send(SessionEvent::Halted { error: err });
            }
        }
    }
}

async fn run_tick<S, C>(inner: Arc<Inner<S, C>>, epoch: u64)
where
    S: VideoSource + 'static,
    C: InferenceClient + 'static,
{
    if inner.in_flight.swap(true, Ordering::AcqRel) {
        inner.lock_session().ticks_skipped += 1;
        log::debug!("tick dropped: previous tick still in flight");
        return;
    }
    let _guard = InFlightGuard(&inner.in_flight);

    if !inner.is_current(epoch) {
        return;
    }

    let worker = Arc::clone(&inner);
    let outcome = match tokio::task::spawn_blocking(move || worker.capture_and_infer()).await {
        Ok(outcome) => outcome,
        Err(err) => TickOutcome::Inferred(Err(InferenceError::Transport(format!(
            "inference task failed: {}",
            err
        )))),
    };
    inner.apply(epoch, outcome);
}

async fn schedule<S, C>(inner: Arc<Inner<S, C>>, epoch: u64)
where
    S: VideoSource + 'static,
    C: InferenceClient + 'static,
{
    let mut interval = tokio::time::interval(inner.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        tokio::spawn(run_tick(Arc::clone(&inner), epoch));
    }
}

/// Drives capture -> infer -> dedupe on a fixed cadence.
pub struct DetectionController<S: VideoSource + 'static, C: InferenceClient + 'static> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> DetectionController<S, C>
where
    S: VideoSource + 'static,
    C: InferenceClient + 'static,
{
    pub fn new(capture: FrameCapture<S>, client: C, config: ControllerConfig) -> Self {
        Self::with_shared_client(capture, Arc::new(client), config)
    }

    pub fn with_shared_client(
        capture: FrameCapture<S>,
        client: Arc<C>,
        config: ControllerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let counters = CaptureCounters::new(&capture.stats());
        let source_name = capture.source().name().to_string();
        Self {
            inner: Arc::new(Inner {
                capture: Mutex::new(capture),
                counters,
                source_name,
                client,
                session: Mutex::new(Session::new()),
                threshold: SharedThreshold::new(config.confidence),
                in_flight: AtomicBool::new(false),
                poll_interval: config.poll_interval,
                events,
            }),
        }
    }

    /// Begin polling. Clears the detection set and any surfaced error.
    ///
    /// Rejected without a state change when the video source is not ready.
    /// Calling `start` while running restarts the session.
    pub fn start(&self) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        if !self.inner.source_ready() {
            return Err(SessionError::SourceNotReady(self.inner.source_name.clone()));
        }

        let mut session = self.inner.lock_session();
        session.cancel_scheduler();
        session.epoch += 1;
        session.clear_detections();
        session.last_error = None;
        session.lifecycle = LifecycleState::Running;
        let epoch = session.epoch;
        session.scheduler = Some(runtime.spawn(schedule(Arc::clone(&self.inner), epoch)));
        log::info!(
            "detection loop started (epoch {}, interval {:?}, threshold {:.2}, client {})",
            epoch,
            self.inner.poll_interval,
            self.inner.threshold.get().value(),
            self.inner.client.name()
        );
        Ok(())
    }

    /// Cancel the scheduled tick. Detections are kept.
    pub fn stop(&self) {
        let mut session = self.inner.lock_session();
        session.cancel_scheduler();
        if session.lifecycle == LifecycleState::Running {
            session.lifecycle = LifecycleState::Stopped;
            log::info!(
                "detection loop stopped ({} unique detections kept)",
                session.unique_count
            );
        }
    }

    /// Clear detections and the unique counter. Running state is unchanged.
    pub fn reset(&self) {
        let mut session = self.inner.lock_session();
        session.clear_detections();
        log::info!("detection history cleared");
    }

    /// Takes effect on the next offer or display filter. Out-of-range values
    /// are rejected and the previous threshold is kept.
    pub fn set_confidence_threshold(&self, value: f32) -> Result<(), SessionError> {
        let confidence = self.inner.threshold.set(value)?;
        log::info!("confidence threshold set to {:.2}", confidence.value());
        Ok(())
    }

    pub fn confidence_threshold(&self) -> Confidence {
        self.inner.threshold.get()
    }

    pub fn snapshot(&self) -> DetectionSnapshot {
        self.inner.lock_session().store.snapshot()
    }

    /// Records passing the current threshold, newest first.
    pub fn visible(&self) -> Vec<DetectionRecord> {
        visible_records(&self.snapshot(), self.confidence_threshold())
    }

    pub fn session_state(&self) -> SessionState {
        let session = self.inner.lock_session();
        SessionState {
            lifecycle: session.lifecycle,
            running: session.lifecycle == LifecycleState::Running,
            confidence_threshold: self.inner.threshold.get().value(),
            unique_count: session.unique_count,
            last_error: session.last_error.as_ref().map(|e| e.to_string()),
            ticks_completed: session.ticks_completed,
            ticks_skipped: session.ticks_skipped,
            captures_unavailable: session.captures_unavailable,
            last_update: session.last_update,
        }
    }

    pub fn last_error(&self) -> Option<InferenceError> {
        self.inner.lock_session().last_error.clone()
    }

    /// True while a tick's capture/inference is outstanding.
    pub fn tick_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Counters as of the last finished capture. Never waits on the source.
    pub fn capture_stats(&self) -> CaptureStats {
        self.inner.counters.stats()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Stop polling for good and release the controller.
    pub fn shutdown(self) -> DetectionSnapshot {
        self.stop();
        self.snapshot()
    }
}

impl<S, C> Drop for DetectionController<S, C>
where
    S: VideoSource + 'static,
    C: InferenceClient + 'static,
{
    fn drop(&mut self) {
        self.inner.lock_session().cancel_scheduler();
    }
}
