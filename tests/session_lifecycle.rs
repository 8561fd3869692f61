use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use detect_feed::ingest::{SourceStats, SyntheticConfig, SyntheticSource};
use detect_feed::{
    CapturedFrame, Confidence, ControllerConfig, DetectionController, FrameCapture,
    InferenceClient, InferenceError, LifecycleState, RawDetection, SessionError, SessionEvent,
    StubInferenceClient, VideoSource,
};

const POLL: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(5);

type Reply = Result<Vec<RawDetection>, InferenceError>;

/// Blocks every inference call until the test hands it a reply.
struct GatedClient {
    entered: mpsc::UnboundedSender<()>,
    replies: Mutex<std_mpsc::Receiver<Reply>>,
}

impl GatedClient {
    fn new() -> (Self, mpsc::UnboundedReceiver<()>, std_mpsc::Sender<Reply>) {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = std_mpsc::channel();
        (
            Self {
                entered: entered_tx,
                replies: Mutex::new(reply_rx),
            },
            entered_rx,
            reply_tx,
        )
    }
}

impl InferenceClient for GatedClient {
    fn name(&self) -> &str {
        "gated"
    }

    fn infer(&self, _frame: &CapturedFrame) -> Result<Vec<RawDetection>, InferenceError> {
        let _ = self.entered.send(());
        self.replies
            .lock()
            .unwrap()
            .recv()
            .unwrap_or_else(|_| Err(InferenceError::Transport("gate closed".to_string())))
    }
}

fn source() -> SyntheticSource {
    let mut source = SyntheticSource::new(SyntheticConfig::default());
    source.connect().unwrap();
    source
}

fn controller<C: InferenceClient + 'static>(
    client: C,
    confidence: f32,
) -> DetectionController<SyntheticSource, C> {
    DetectionController::new(
        FrameCapture::new(source()),
        client,
        ControllerConfig {
            poll_interval: POLL,
            confidence: Confidence::new(confidence).unwrap(),
        },
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn person(x: f32, confidence: f32) -> RawDetection {
    RawDetection::new(0, confidence, [x, 100.0, 40.0, 80.0])
}

#[tokio::test]
async fn repeated_detections_are_counted_once() {
    let client = StubInferenceClient::repeating(vec![
        person(100.0, 0.9),
        RawDetection::new(2, 0.8, [300.0, 200.0, 120.0, 60.0]),
    ]);
    let controller = controller(client, 0.5);
    let mut events = controller.subscribe();

    controller.start().unwrap();
    wait_until(|| controller.session_state().ticks_completed >= 5).await;

    let state = controller.session_state();
    assert!(state.running);
    assert_eq!(state.unique_count, 2);
    assert_eq!(controller.snapshot().len(), 2);

    let mut detected = 0;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Detected(_) = event {
            detected += 1;
        }
    }
    assert_eq!(detected, 2);
    controller.stop();
}

#[tokio::test]
async fn stop_keeps_detections_and_start_clears_them() {
    let controller = controller(StubInferenceClient::repeating(vec![person(100.0, 0.9)]), 0.5);
    controller.start().unwrap();
    wait_until(|| controller.session_state().unique_count == 1).await;

    controller.stop();
    let state = controller.session_state();
    assert_eq!(state.lifecycle, LifecycleState::Stopped);
    assert!(!state.running);
    assert_eq!(controller.snapshot().len(), 1);

    controller.start().unwrap();
    assert_eq!(controller.session_state().unique_count, 0);
    wait_until(|| controller.session_state().unique_count == 1).await;
    controller.stop();
}

#[tokio::test]
async fn reset_clears_detections_without_stopping() {
    let client = Arc::new(StubInferenceClient::new().with_response(Ok(vec![person(100.0, 0.9)])));
    let controller = DetectionController::with_shared_client(
        FrameCapture::new(source()),
        Arc::clone(&client),
        ControllerConfig {
            poll_interval: POLL,
            confidence: Confidence::new(0.5).unwrap(),
        },
    );
    controller.start().unwrap();
    wait_until(|| controller.session_state().unique_count == 1).await;

    controller.reset();
    let state = controller.session_state();
    assert!(state.running);
    assert_eq!(state.unique_count, 0);
    assert!(controller.snapshot().is_empty());

    // The same object seen again after a reset counts as new.
    client.push(Ok(vec![person(100.0, 0.9)]));
    wait_until(|| controller.session_state().unique_count == 1).await;
    controller.stop();
}

#[tokio::test]
async fn reset_while_stopped_stays_stopped() {
    let controller = controller(StubInferenceClient::repeating(vec![person(100.0, 0.9)]), 0.5);
    controller.start().unwrap();
    wait_until(|| controller.session_state().unique_count == 1).await;
    controller.stop();

    controller.reset();
    let state = controller.session_state();
    assert_eq!(state.lifecycle, LifecycleState::Stopped);
    assert_eq!(state.unique_count, 0);
    assert!(controller.snapshot().is_empty());
}

#[tokio::test]
async fn inference_error_halts_the_loop_until_next_start() {
    let client = StubInferenceClient::repeating(vec![person(100.0, 0.9)]).with_response(Err(
        InferenceError::Service {
            status: 500,
            message: "model exploded".to_string(),
            retry_after: None,
        },
    ));
    let controller = controller(client, 0.5);
    let mut events = controller.subscribe();
    controller.start().unwrap();

    let halted = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Halted { error }) = events.recv().await {
                return error;
            }
        }
    })
    .await
    .expect("loop did not halt");
    assert!(matches!(halted, InferenceError::Service { status: 500, .. }));

    let state = controller.session_state();
    assert_eq!(state.lifecycle, LifecycleState::Stopped);
    assert!(state.last_error.unwrap().contains("model exploded"));
    assert!(controller.snapshot().is_empty());

    // No further ticks are scheduled after the halt.
    let completed = state.ticks_completed;
    tokio::time::sleep(POLL * 5).await;
    assert_eq!(controller.session_state().ticks_completed, completed);

    controller.start().unwrap();
    assert!(controller.last_error().is_none());
    wait_until(|| controller.session_state().unique_count == 1).await;
    controller.stop();
}

#[tokio::test]
async fn result_arriving_after_stop_is_discarded() {
    let (client, mut entered, replies) = GatedClient::new();
    let controller = controller(client, 0.5);
    controller.start().unwrap();

    tokio::time::timeout(WAIT, entered.recv())
        .await
        .expect("no inference call started");
    assert!(controller.tick_in_flight());

    controller.stop();
    replies.send(Ok(vec![person(100.0, 0.9)])).unwrap();
    wait_until(|| !controller.tick_in_flight()).await;

    let state = controller.session_state();
    assert_eq!(state.lifecycle, LifecycleState::Stopped);
    assert_eq!(state.unique_count, 0);
    assert!(controller.snapshot().is_empty());
}

#[tokio::test]
async fn ticks_never_overlap() {
    let (client, mut entered, replies) = GatedClient::new();
    let controller = controller(client, 0.5);
    controller.start().unwrap();

    tokio::time::timeout(WAIT, entered.recv())
        .await
        .expect("no inference call started");
    wait_until(|| controller.session_state().ticks_skipped >= 3).await;
    assert!(entered.try_recv().is_err());

    replies.send(Ok(vec![person(100.0, 0.9)])).unwrap();
    wait_until(|| controller.session_state().unique_count == 1).await;

    controller.stop();
    drop(replies);
}

#[tokio::test]
async fn threshold_changes_apply_to_the_next_offer() {
    let controller = controller(StubInferenceClient::repeating(vec![person(100.0, 0.6)]), 0.7);
    controller.start().unwrap();
    wait_until(|| controller.session_state().ticks_completed >= 3).await;
    assert_eq!(controller.session_state().unique_count, 0);

    controller.set_confidence_threshold(0.5).unwrap();
    wait_until(|| controller.session_state().unique_count == 1).await;

    // Raising it again hides the record from display without removing it.
    controller.set_confidence_threshold(0.9).unwrap();
    assert!(controller.visible().is_empty());
    assert_eq!(controller.snapshot().len(), 1);

    assert!(controller.set_confidence_threshold(2.0).is_err());
    assert_eq!(controller.confidence_threshold().value(), 0.9);
    controller.stop();
}

/// Source whose readiness the test toggles.
struct ToggleSource {
    ready: Arc<AtomicBool>,
    inner: SyntheticSource,
}

impl VideoSource for ToggleSource {
    fn name(&self) -> &str {
        "toggle"
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        self.inner.connect()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn current_frame(&mut self) -> anyhow::Result<image::RgbImage> {
        self.inner.current_frame()
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }
}

#[tokio::test]
async fn unavailable_frames_skip_ticks_without_halting() {
    let ready = Arc::new(AtomicBool::new(true));
    let controller = DetectionController::new(
        FrameCapture::new(ToggleSource {
            ready: Arc::clone(&ready),
            inner: source(),
        }),
        StubInferenceClient::repeating(vec![person(100.0, 0.9)]),
        ControllerConfig {
            poll_interval: POLL,
            confidence: Confidence::new(0.5).unwrap(),
        },
    );
    ready.store(false, Ordering::SeqCst);
    assert!(matches!(
        controller.start(),
        Err(SessionError::SourceNotReady(_))
    ));
    assert_eq!(controller.session_state().lifecycle, LifecycleState::Idle);

    ready.store(true, Ordering::SeqCst);
    controller.start().unwrap();
    ready.store(false, Ordering::SeqCst);
    wait_until(|| controller.session_state().captures_unavailable >= 3).await;

    let state = controller.session_state();
    assert!(state.running);
    assert!(state.last_error.is_none());

    ready.store(true, Ordering::SeqCst);
    wait_until(|| controller.session_state().unique_count == 1).await;
    let snapshot = controller.shutdown();
    assert_eq!(snapshot.len(), 1);
}

/// Source whose every frame takes `delay` to arrive.
struct SlowSource {
    delay: Duration,
    inner: SyntheticSource,
}

impl VideoSource for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        self.inner.connect()
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn current_frame(&mut self) -> anyhow::Result<image::RgbImage> {
        std::thread::sleep(self.delay);
        self.inner.current_frame()
    }

    fn stats(&self) -> SourceStats {
        self.inner.stats()
    }
}

#[tokio::test]
async fn slow_capture_does_not_block_controller_queries() {
    let controller = DetectionController::new(
        FrameCapture::new(SlowSource {
            delay: Duration::from_millis(800),
            inner: source(),
        }),
        StubInferenceClient::new(),
        ControllerConfig {
            poll_interval: Duration::from_millis(50),
            confidence: Confidence::new(0.5).unwrap(),
        },
    );
    controller.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.tick_in_flight());

    let started = std::time::Instant::now();
    let stats = controller.capture_stats();
    assert_eq!(stats.frames_captured, 0);
    // Restarting while the capture is still running must not wait for it either.
    controller.start().unwrap();
    assert!(started.elapsed() < Duration::from_millis(200));

    wait_until(|| controller.capture_stats().frames_captured >= 1).await;
    controller.stop();
}

#[tokio::test]
async fn last_update_tracks_successful_inference_and_survives_stop() {
    let controller = controller(StubInferenceClient::repeating(Vec::new()), 0.5);
    assert!(controller.session_state().last_update.is_none());

    let before = std::time::SystemTime::now();
    controller.start().unwrap();
    wait_until(|| controller.session_state().last_update.is_some()).await;
    let updated = controller.session_state().last_update.unwrap();
    assert!(updated >= before);
    assert_eq!(controller.session_state().unique_count, 0);

    controller.stop();
    let state = controller.session_state();
    assert_eq!(state.lifecycle, LifecycleState::Stopped);
    assert!(state.last_update.unwrap() >= updated);

    controller.reset();
    assert!(controller.session_state().last_update.is_some());
}

#[tokio::test]
async fn failed_inference_does_not_refresh_last_update() {
    let client = StubInferenceClient::new().with_response(Err(InferenceError::Transport(
        "connection refused".to_string(),
    )));
    let controller = controller(client, 0.5);
    controller.start().unwrap();
    wait_until(|| controller.session_state().lifecycle == LifecycleState::Stopped).await;

    let state = controller.session_state();
    assert!(state.last_error.is_some());
    assert!(state.last_update.is_none());
}
