use image::{DynamicImage, ImageFormat, RgbImage};
use naval_watch::api::{ApiConfig, ApiHandle, ApiServer};
use naval_watch::{
    DetectedObject, Pipeline, PipelineSettings, RuleEngine, StageKind, StageSet, StubBackend,
};
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

fn png_bytes() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::new(16, 12))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn spawn(backend: StubBackend, max_upload_bytes: usize) -> ApiHandle {
    let pipeline = Pipeline::new(
        StageSet::stub(backend),
        PipelineSettings::default(),
        RuleEngine::default(),
    );
    let cfg = ApiConfig {
        addr: "127.0.0.1:0".to_string(),
        max_upload_bytes,
    };
    ApiServer::new(cfg, Arc::new(pipeline)).spawn().unwrap()
}

fn send(handle: &ApiHandle, head: &str, body: &[u8]) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(handle.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(head.as_bytes()).unwrap();
    stream.write_all(body).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();

    let text = String::from_utf8_lossy(&response).into_owned();
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = text.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("");
    let json = serde_json::from_str(body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn multipart_upload(handle: &ApiHandle, field: &str, filename: &str, data: &[u8]) -> (u16, serde_json::Value) {
    let boundary = "naval-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={boundary}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    send(handle, &head, &body)
}

#[test]
fn health_check() {
    let handle = spawn(StubBackend::new(), 1024 * 1024);
    let (status, json) = send(&handle, "GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n", b"");
    assert_eq!(status, 200);
    assert_eq!(json["status"], "ok");
    handle.stop().unwrap();
}

#[test]
fn multipart_upload_returns_full_report() {
    let backend = StubBackend::new().with_objects(vec![DetectedObject::new(
        "fire",
        91.0,
        [5.0, 5.0, 30.0, 40.0],
    )]);
    let handle = spawn(backend, 1024 * 1024);
    let (status, json) = multipart_upload(&handle, "file", "../deck 01.png", &png_bytes());
    assert_eq!(status, 200);
    assert_eq!(json["file_info"]["filename"], "deck_01.png");
    assert_eq!(json["classification"]["label"], "naval patrol");
    assert_eq!(json["caption"]["confidence"], "85.0%");
    assert_eq!(json["detections"]["objects_detected"][0]["confidence"], "91.0%");
    assert_eq!(
        json["anomalies_detected"]["anomalies_detected"][0],
        "fire hazard detected"
    );
    assert_eq!(json["naval_assessment"]["status"], "Alert");
    assert_eq!(json["naval_assessment"]["priority"], "High");
    handle.stop().unwrap();
}

#[test]
fn raw_body_upload_uses_filename_header() {
    let handle = spawn(StubBackend::new(), 1024 * 1024);
    let body = png_bytes();
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: localhost\r\nX-Filename: harbor.png\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let (status, json) = send(&handle, &head, &body);
    assert_eq!(status, 200);
    assert_eq!(json["anomalies_detected"]["count"], 0);
    assert_eq!(json["naval_assessment"]["recommendation"], "Monitor");
    handle.stop().unwrap();
}

#[test]
fn upload_errors() {
    let handle = spawn(StubBackend::new(), 1024 * 1024);

    let (status, json) = multipart_upload(&handle, "image", "deck.png", &png_bytes());
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No file part");

    let (status, json) = multipart_upload(&handle, "file", "", &png_bytes());
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No selected file");

    let (status, json) = multipart_upload(&handle, "file", "deck.gif", &png_bytes());
    assert_eq!(status, 400);
    assert_eq!(
        json["error"],
        "Format \".gif\" not supported. Please upload JPG, PNG, TIFF, or BMP files."
    );

    let (status, _) = send(&handle, "GET /upload HTTP/1.1\r\nHost: localhost\r\n\r\n", b"");
    assert_eq!(status, 405);

    let (status, _) = send(&handle, "GET /events HTTP/1.1\r\nHost: localhost\r\n\r\n", b"");
    assert_eq!(status, 404);

    handle.stop().unwrap();
}

#[test]
fn oversized_upload_is_rejected() {
    let handle = spawn(StubBackend::new(), 64);
    let body = png_bytes();
    assert!(body.len() > 64);
    let head = format!(
        "POST /upload HTTP/1.1\r\nHost: localhost\r\nX-Filename: big.png\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let (status, _) = send(&handle, &head, b"");
    assert_eq!(status, 413);
    handle.stop().unwrap();
}

#[test]
fn stage_failure_is_500() {
    let backend = StubBackend::new().failing(StageKind::Detection, "model weights missing");
    let handle = spawn(backend, 1024 * 1024);
    let (status, json) = multipart_upload(&handle, "file", "deck.png", &png_bytes());
    assert_eq!(status, 500);
    assert_eq!(
        json["error"],
        "Analysis Failed: object detection failed: model weights missing"
    );
    handle.stop().unwrap();
}
