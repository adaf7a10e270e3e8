//! Session transport tests: WDA driver against a mock HTTP server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use common::{fast_settings, MockHttpServer, MockReply, RecordedRequest};
use uixt_core::config::UixtConfig;
use uixt_core::driver::{AutomationDriver, ErrorKind};
use uixt_core::ios::IOSDevice;
use uixt_core::options::ActionOptions;
use uixt_core::session::SessionSettings;
use uixt_core::wda_driver::WdaDriver;

/// A WDA stand-in: sessions are numbered `s1`, `s2`, ...; taps and battery
/// reads against `s1` fail in the ways the test names describe.
fn wda_handler(sessions: Arc<AtomicUsize>) -> impl Fn(&RecordedRequest) -> MockReply + Send + Sync {
    move |req| {
        let path = req.path.as_str();
        match (req.method.as_str(), path) {
            ("POST", "/session") => {
                let n = sessions.fetch_add(1, Ordering::SeqCst) + 1;
                MockReply::value(json!({ "sessionId": format!("s{n}"), "capabilities": {} }))
            }
            ("GET", "/status") => MockReply::value(json!({ "ready": true, "message": "WDA ready" })),
            ("GET", "/wda/screen") => MockReply::value(json!({ "scale": 2.0 })),
            ("GET", p) if p.ends_with("/window/size") => {
                MockReply::value(json!({ "width": 540.0, "height": 960.0 }))
            }
            ("GET", p) if p.ends_with("/orientation") => MockReply::value(json!("PORTRAIT")),
            ("POST", "/session/s1/wda/tap") => MockReply::Drop,
            ("POST", p) if p.ends_with("/wda/tap") => MockReply::value(json!(null)),
            ("GET", "/session/s1/wda/batteryInfo") => MockReply::Json(
                500,
                json!({ "value": { "error": "unknown error", "message": "battery unavailable" } }),
            ),
            ("GET", "/session/s1/rotation") => MockReply::Json(
                404,
                json!({ "value": { "error": "invalid session id", "message": "gone" } }),
            ),
            ("GET", p) if p.ends_with("/rotation") => {
                MockReply::value(json!({ "x": 0, "y": 0, "z": 90 }))
            }
            _ => MockReply::Json(404, json!({ "value": { "error": "unknown command" } })),
        }
    }
}

async fn wda_with(server: &MockHttpServer, settings: SessionSettings) -> WdaDriver {
    let device = Arc::new(IOSDevice::new("00008110-TEST", &UixtConfig::default()));
    let driver = WdaDriver::with_base_url(device, server.url(), settings).unwrap();
    driver.setup().await.unwrap();
    driver
}

// ---------------------------------------------------------------------------
// Reset and retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dropped_tap_rebuilds_session_and_retries() {
    let sessions = Arc::new(AtomicUsize::new(0));
    let server = MockHttpServer::start(wda_handler(sessions.clone())).await;
    let driver = wda_with(&server, fast_settings()).await;
    assert_eq!(driver.session().remote_session_id().await.as_deref(), Some("s1"));

    driver.tap_xy(0.5, 0.5, &ActionOptions::new()).await.unwrap();

    assert_eq!(driver.session().remote_session_id().await.as_deref(), Some("s2"));
    assert_eq!(sessions.load(Ordering::SeqCst), 2);

    // Nothing addresses the old session once the new one exists.
    let requests = server.requests();
    let rebuilt_at = requests
        .iter()
        .rposition(|r| r.method == "POST" && r.path == "/session")
        .unwrap();
    assert!(requests[rebuilt_at..]
        .iter()
        .all(|r| !r.path.starts_with("/session/s1")));

    // 1080x1920 pixels at scale 2 -> tap at (270, 480) points.
    let tap = requests
        .iter()
        .find(|r| r.path == "/session/s2/wda/tap")
        .unwrap();
    assert_eq!(tap.body, json!({ "x": 270.0, "y": 480.0 }));
}

#[tokio::test]
async fn test_invalid_session_response_triggers_reset() {
    let sessions = Arc::new(AtomicUsize::new(0));
    let server = MockHttpServer::start(wda_handler(sessions.clone())).await;
    let driver = wda_with(&server, fast_settings()).await;

    let rotation = driver.rotation().await.unwrap();
    assert_eq!(rotation.z, 90);
    assert_eq!(server.count("GET", "/session/s2/rotation"), 1);
    assert_eq!(server.count("GET", "/status"), 1);
}

#[tokio::test]
async fn test_backend_error_surfaces_without_reset() {
    let sessions = Arc::new(AtomicUsize::new(0));
    let server = MockHttpServer::start(wda_handler(sessions.clone())).await;
    let driver = wda_with(&server, fast_settings()).await;

    let err = driver.battery_info().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert!(err.to_string().contains("battery unavailable"));
    assert_eq!(sessions.load(Ordering::SeqCst), 1);
    assert_eq!(server.count("GET", "/status"), 0);
}

#[tokio::test]
async fn test_reset_gives_up_after_configured_retries() {
    let server = MockHttpServer::start(|req| match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/session") => MockReply::value(json!({ "sessionId": "only" })),
        _ => MockReply::Drop,
    })
    .await;
    let settings = SessionSettings {
        reset_retries: 2,
        ..fast_settings()
    };
    let driver = wda_with(&server, settings).await;

    let err = driver.status().await.unwrap_err();
    assert!(err.is_transport());
    // The original request plus one health check per retry.
    assert_eq!(server.count("GET", "/status"), 3);
}

// ---------------------------------------------------------------------------
// Caches and history
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_window_size_is_fetched_once() {
    let server = MockHttpServer::start(wda_handler(Arc::new(AtomicUsize::new(0)))).await;
    let driver = wda_with(&server, fast_settings()).await;

    let first = driver.window_size().await.unwrap();
    let second = driver.window_size().await.unwrap();
    assert_eq!(first, second);
    assert_eq!((first.width, first.height), (1080.0, 1920.0));
    assert_eq!(server.count("GET", "/session/s1/window/size"), 1);
    assert_eq!(server.count("GET", "/wda/screen"), 1);
}

#[tokio::test]
async fn test_init_session_clears_window_cache() {
    let server = MockHttpServer::start(wda_handler(Arc::new(AtomicUsize::new(0)))).await;
    let driver = wda_with(&server, fast_settings()).await;

    driver.window_size().await.unwrap();
    driver.init_session(None).await.unwrap();
    driver.window_size().await.unwrap();

    assert_eq!(server.count("GET", "/session/s1/window/size"), 1);
    assert_eq!(server.count("GET", "/session/s2/window/size"), 1);
}

#[tokio::test]
async fn test_request_history_records_failures() {
    let server = MockHttpServer::start(wda_handler(Arc::new(AtomicUsize::new(0)))).await;
    let driver = wda_with(&server, fast_settings()).await;

    let _ = driver.battery_info().await;
    let history = driver.session().request_history().await;
    let last = history.last().unwrap();
    assert!(!last.success);
    assert_eq!(last.status, Some(500));
    assert!(last.target.ends_with("/session/s1/wda/batteryInfo"));

    let mut out = Vec::new();
    driver.session().export_jsonl(&mut out).await.unwrap();
    let lines = String::from_utf8(out).unwrap();
    assert_eq!(lines.lines().count(), history.len());
}

// ---------------------------------------------------------------------------
// Orientation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_landscape_tap_uses_rotated_window() {
    let portrait = wda_handler(Arc::new(AtomicUsize::new(0)));
    let server = MockHttpServer::start(move |req: &RecordedRequest| {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", p) if p.ends_with("/orientation") => MockReply::value(json!("LANDSCAPE")),
            ("POST", p) if p.ends_with("/wda/tap") => MockReply::value(json!(null)),
            _ => portrait(req),
        }
    })
    .await;
    let driver = wda_with(&server, fast_settings()).await;

    let size = driver.window_size().await.unwrap();
    assert_eq!((size.width, size.height), (1920.0, 1080.0));

    driver.tap_xy(0.5, 0.25, &ActionOptions::new()).await.unwrap();

    // (960, 270) pixels in the rotated window, halved into points.
    let tap = server
        .requests()
        .into_iter()
        .find(|r| r.path == "/session/s1/wda/tap")
        .unwrap();
    assert_eq!(tap.body, json!({ "x": 480.0, "y": 135.0 }));
}
