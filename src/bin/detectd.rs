//! detectd - webcam detection feed daemon
//!
//! This daemon:
//! 1. Opens the configured video source (stub://, http(s)://, /dev/video*)
//! 2. Checks the inference endpoint's health (warning only)
//! 3. Polls capture -> infer -> dedupe at the configured interval
//! 4. Logs every new unique detection and a periodic status line
//! 5. On Ctrl-C, stops polling and prints the visible detection list

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use detect_feed::config::DetectdConfig;
use detect_feed::display::{class_name, format_record};
use detect_feed::{
    open_source, DetectionController, FrameCapture, HttpInferenceClient, PayloadFormat,
    SessionError, SessionEvent, VideoSource,
};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream webcam frames to an object detector and track unique detections"
)]
struct Args {
    /// Config file (.toml or .json).
    #[arg(long, env = "DETECT_CONFIG")]
    config: Option<PathBuf>,

    /// Video source: stub://name, http(s)://snapshot-url or /dev/videoN.
    #[arg(long)]
    source: Option<String>,

    /// Detection endpoint URL.
    #[arg(long)]
    endpoint: Option<String>,

    /// Upload encoding: multipart or base64-json.
    #[arg(long)]
    payload: Option<PayloadFormat>,

    /// Poll interval in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Confidence threshold in [0, 1].
    #[arg(long)]
    confidence: Option<f32>,

    /// Clear the detector's server-side history before starting.
    #[arg(long)]
    reset_remote: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = DetectdConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        cfg.source_url = source;
    }
    if let Some(endpoint) = args.endpoint {
        cfg.inference.endpoint = endpoint;
    }
    if let Some(payload) = args.payload {
        cfg.inference.payload = payload;
    }
    if let Some(ms) = args.interval_ms {
        cfg.poll_interval = Duration::from_millis(ms);
    }
    if let Some(confidence) = args.confidence {
        cfg.confidence = confidence;
    }
    cfg.validate()?;

    let mut source = open_source(&cfg.source_url)?;
    if let Err(err) = source.connect() {
        log::warn!("video source {} not connected yet: {:#}", cfg.source_url, err);
    }

    let client = Arc::new(HttpInferenceClient::new(cfg.http_client_config())?);
    match client.health_async().await {
        Ok(health) => log::info!(
            "detector {} status={} model_loaded={}",
            client.endpoint(),
            health.status,
            health.model_loaded
        ),
        Err(err) => log::warn!("detector health check failed: {}", err),
    }
    if args.reset_remote {
        client
            .reset_remote_async()
            .await
            .context("reset detector-side history")?;
        log::info!("detector-side detection history cleared");
    }

    let controller = DetectionController::with_shared_client(
        FrameCapture::new(source),
        client,
        cfg.controller_config()?,
    );
    let mut events = controller.subscribe();

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "detectd running. source={} endpoint={} payload={} interval={:?} threshold={:.2}",
        cfg.source_url,
        cfg.inference.endpoint,
        cfg.inference.payload,
        cfg.poll_interval,
        cfg.confidence
    );

    // Wait for the source to deliver frames before starting the loop.
    loop {
        match controller.start() {
            Ok(()) => break,
            Err(SessionError::SourceNotReady(name)) => {
                log::info!("waiting for video source {}...", name);
            }
            Err(err) => return Err(err.into()),
        }
        tokio::select! {
            _ = shutdown_rx.recv() => {
                log::info!("shutdown signal received before source became ready");
                return Ok(());
            }
            _ = tokio::time::sleep(cfg.poll_interval) => {}
        }
    }

    let mut status_log = tokio::time::interval(STATUS_LOG_INTERVAL);
    let mut halted = None;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                log::info!("shutdown signal received, stopping detection loop...");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Detected(record)) => {
                    log::info!(
                        "unique #{}: {} conf={:.2} box={:?}",
                        record.sequence,
                        class_name(record.detection.class_id),
                        record.detection.confidence,
                        record.detection.bbox.to_array()
                    );
                }
                Ok(SessionEvent::Halted { error }) => {
                    halted = Some(error);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("event consumer lagged, {} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = status_log.tick() => {
                let state = controller.session_state();
                let stats = controller.capture_stats();
                let last_update = state
                    .last_update
                    .and_then(|at| at.elapsed().ok())
                    .map(|age| format!("{:.1}s ago", age.as_secs_f32()))
                    .unwrap_or_else(|| "never".to_string());
                log::info!(
                    "status lifecycle={:?} unique={} ticks={} skipped={} unavailable={} frames={} last_update={}",
                    state.lifecycle,
                    state.unique_count,
                    state.ticks_completed,
                    state.ticks_skipped,
                    state.captures_unavailable,
                    stats.frames_captured,
                    last_update
                );
            }
        }
    }

    controller.stop();
    let visible = controller.visible();
    log::info!("{} visible unique detections:", visible.len());
    for record in &visible {
        log::info!("  {}", format_record(record));
    }

    match halted {
        Some(error) => Err(anyhow!("detection loop halted: {}", error)),
        None => Ok(()),
    }
}
