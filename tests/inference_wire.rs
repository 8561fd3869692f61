use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::RgbImage;

use detect_feed::{
    BoundingBox, CapturedFrame, HttpClientConfig, HttpInferenceClient, InferenceClient,
    InferenceError, PayloadFormat,
};

struct CapturedRequest {
    request_line: String,
    content_type: String,
    body: Vec<u8>,
}

/// Answer exactly one request with `status` and `body`, returning what was sent.
fn fake_detector(status: &str, body: &str) -> (String, JoinHandle<CapturedRequest>) {
    slow_fake_detector(Duration::ZERO, status, body)
}

/// Like `fake_detector`, holding the answer back for `delay`.
fn slow_fake_detector(
    delay: Duration,
    status: &str,
    body: &str,
) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let status = status.to_string();
    let body = body.to_string();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();
        let mut content_type = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "content-length" => content_length = value.trim().parse().unwrap(),
                    "content-type" => content_type = value.trim().to_string(),
                    _ => {}
                }
            }
        }
        let mut request_body = vec![0u8; content_length];
        reader.read_exact(&mut request_body).unwrap();

        std::thread::sleep(delay);
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        reader.get_mut().write_all(response.as_bytes()).unwrap();

        CapturedRequest {
            request_line: request_line.trim_end().to_string(),
            content_type,
            body: request_body,
        }
    });
    (format!("http://{}/detect", addr), handle)
}

fn client(endpoint: String, payload: PayloadFormat) -> HttpInferenceClient {
    HttpInferenceClient::new(HttpClientConfig {
        endpoint,
        payload,
        timeout: Duration::from_secs(5),
        ..HttpClientConfig::default()
    })
    .unwrap()
}

fn frame() -> CapturedFrame {
    CapturedFrame::from_image(RgbImage::from_pixel(640, 480, image::Rgb([90, 120, 40])), 1).unwrap()
}

fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0xFF, 0xD8]) && bytes.ends_with(&[0xFF, 0xD9])
}

#[test]
fn multipart_upload_returns_normalised_detections() {
    let (endpoint, server) = fake_detector(
        "200 OK",
        r#"{"status": "success", "detections": [{"class_id": 0, "confidence": 0.91, "box": [100, 120, 50, 80]}]}"#,
    );
    let detections = client(endpoint, PayloadFormat::Multipart)
        .infer(&frame())
        .unwrap();

    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].class_id, 0);
    assert_eq!(detections[0].bbox, BoundingBox::new(100.0, 120.0, 50.0, 80.0));

    let request = server.join().unwrap();
    assert_eq!(request.request_line, "POST /detect HTTP/1.1");
    let boundary = request
        .content_type
        .strip_prefix("multipart/form-data; boundary=")
        .expect("multipart content type");
    let text = String::from_utf8_lossy(&request.body);
    assert!(text.starts_with(&format!("--{}\r\n", boundary)));
    assert!(text.contains("name=\"image\""));
    assert!(text.contains("Content-Type: image/jpeg"));
}

#[test]
fn base64_upload_carries_the_jpeg_in_an_image_field() {
    let (endpoint, server) = fake_detector(
        "200 OK",
        r#"{"classIDs": [2], "confidences": [0.77], "boxes": [[300, 40, 20, 20]]}"#,
    );
    let detections = client(endpoint, PayloadFormat::Base64Json)
        .infer(&frame())
        .unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].class_id, 2);
    assert_eq!(detections[0].confidence, 0.77);

    let request = server.join().unwrap();
    assert_eq!(request.content_type, "application/json");
    let json: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    let jpeg = BASE64_STANDARD
        .decode(json["image"].as_str().expect("image field"))
        .unwrap();
    assert!(is_jpeg(&jpeg));

    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 480));
}

#[test]
fn non_success_status_is_a_service_error() {
    let (endpoint, server) = fake_detector(
        "500 Internal Server Error",
        r#"{"status": "error", "message": "model not loaded"}"#,
    );
    let err = client(endpoint, PayloadFormat::Multipart)
        .infer(&frame())
        .unwrap_err();
    server.join().unwrap();

    match err {
        InferenceError::Service {
            status, message, ..
        } => {
            assert_eq!(status, 500);
            assert_eq!(message, "model not loaded");
        }
        other => panic!("expected service error, got {:?}", other),
    }
}

#[test]
fn rate_limit_carries_retry_after() {
    let (endpoint, server) = fake_detector(
        "429 Too Many Requests",
        r#"{"error": "Too many requests", "retry_after": 0.05}"#,
    );
    let err = client(endpoint, PayloadFormat::Base64Json)
        .infer(&frame())
        .unwrap_err();
    server.join().unwrap();

    assert_eq!(
        err,
        InferenceError::Service {
            status: 429,
            message: "Too many requests".to_string(),
            retry_after: Some(Duration::from_millis(50)),
        }
    );
}

#[test]
fn unrecognised_body_is_a_decode_error() {
    let (endpoint, server) = fake_detector("200 OK", r#"{"status": "success"}"#);
    let err = client(endpoint, PayloadFormat::Multipart)
        .infer(&frame())
        .unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, InferenceError::Decode(_)));
}

#[test]
fn refused_connection_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(format!("http://{}/detect", addr), PayloadFormat::Multipart)
        .infer(&frame())
        .unwrap_err();
    assert!(err.is_transport());
}

#[test]
fn health_status_and_reset_reach_the_detector() {
    let (endpoint, server) = fake_detector("200 OK", r#"{"status": "healthy", "model_loaded": true}"#);
    let health = client(endpoint, PayloadFormat::Multipart).health().unwrap();
    assert_eq!(health.status, "healthy");
    assert!(health.model_loaded);
    assert_eq!(server.join().unwrap().request_line, "GET /detect HTTP/1.1");

    let (endpoint, server) = fake_detector(
        "200 OK",
        r#"{"status": "running", "active_clients": 3, "tracked_detections": 12, "model_loaded": true}"#,
    );
    let status = client(endpoint, PayloadFormat::Multipart).status().unwrap();
    assert_eq!(status.active_clients, 3);
    assert_eq!(status.tracked_detections, 12);
    assert_eq!(server.join().unwrap().request_line, "GET /status HTTP/1.1");

    let (endpoint, server) = fake_detector("200 OK", r#"{"status": "success"}"#);
    client(endpoint, PayloadFormat::Multipart)
        .reset_remote()
        .unwrap();
    assert_eq!(server.join().unwrap().request_line, "POST /reset HTTP/1.1");
}

#[tokio::test]
async fn async_health_and_reset_leave_the_runtime_free() {
    let (endpoint, server) = slow_fake_detector(
        Duration::from_millis(300),
        "200 OK",
        r#"{"status": "healthy", "model_loaded": true}"#,
    );
    let shared = Arc::new(client(endpoint, PayloadFormat::Multipart));

    let ticks = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&ticks);
    let ticker = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let health = shared.health_async().await.unwrap();
    assert!(health.model_loaded);
    // The single-threaded test runtime kept ticking while the call waited.
    assert!(ticks.load(Ordering::SeqCst) >= 10);
    ticker.abort();
    server.join().unwrap();

    let (endpoint, server) = fake_detector("200 OK", r#"{"status": "success"}"#);
    Arc::new(client(endpoint, PayloadFormat::Multipart))
        .reset_remote_async()
        .await
        .unwrap();
    assert_eq!(server.join().unwrap().request_line, "POST /reset HTTP/1.1");
}
