//! detect_check - one-shot checks against a detection endpoint.
//!
//! Subcommands:
//! - health: GET the detection endpoint
//! - status: GET /status
//! - reset:  POST /reset (clears detector-side history)
//! - once:   capture one frame, run inference, print normalised detections

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;

use detect_feed::config::DetectdConfig;
use detect_feed::display::class_name;
use detect_feed::{open_source, FrameCapture, HttpInferenceClient, InferenceClient, VideoSource};

const CAPTURE_ATTEMPTS: u32 = 20;
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one-shot checks against a detection endpoint")]
struct Args {
    /// Detection endpoint URL (overrides DETECT_ENDPOINT / config file).
    #[arg(long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check detector liveness and model state.
    Health,
    /// Show detector-side counters.
    Status,
    /// Clear detector-side detection history.
    Reset,
    /// Capture one frame and print the detections returned for it.
    Once {
        /// Video source (overrides DETECT_SOURCE_URL / config file).
        #[arg(long)]
        source: Option<String>,
    },
}

#[derive(Serialize)]
struct OnceDetection {
    class_id: u32,
    class_name: &'static str,
    confidence: f32,
    #[serde(rename = "box")]
    bbox: [f32; 4],
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut cfg = DetectdConfig::load()?;
    if let Some(endpoint) = args.endpoint {
        cfg.inference.endpoint = endpoint;
    }
    let client = HttpInferenceClient::new(cfg.http_client_config())?;

    match args.command {
        Command::Health => {
            let health = client.health()?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Command::Status => {
            let status = client.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Reset => {
            client.reset_remote()?;
            println!("detector history cleared");
        }
        Command::Once { source } => {
            let url = source.unwrap_or(cfg.source_url);
            let mut source = open_source(&url)?;
            source.connect()?;
            let mut capture = FrameCapture::new(source);

            let mut attempt = 0;
            let frame = loop {
                attempt += 1;
                match capture.capture() {
                    Ok(frame) => break frame,
                    Err(err) if attempt < CAPTURE_ATTEMPTS => {
                        log::debug!("capture attempt {} failed: {}", attempt, err);
                        std::thread::sleep(CAPTURE_RETRY_DELAY);
                    }
                    Err(err) => return Err(anyhow!("no frame after {} attempts: {}", attempt, err)),
                }
            };

            let detections: Vec<OnceDetection> = client
                .infer(&frame)?
                .into_iter()
                .map(|d| OnceDetection {
                    class_id: d.class_id,
                    class_name: class_name(d.class_id),
                    confidence: d.confidence,
                    bbox: d.bbox.to_array(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&detections)?);
        }
    }

    Ok(())
}
