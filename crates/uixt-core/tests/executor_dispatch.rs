//! Action interpreter tests: JSON-described actions dispatched onto an
//! in-process driver.

mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};

use base64::Engine;
use serde_json::{json, Value};

use common::{ocr, Call, RecordingDriver, ScriptedRecognizer};
use uixt_core::action::{ActionMethod, ActionResult, MobileAction};
use uixt_core::executor::ActionExecutor;
use uixt_core::geometry::{Point, Rect, Size};
use uixt_core::recognition::Recognition;
use uixt_core::vision::VisionDriver;

fn driver() -> Arc<RecordingDriver> {
    Arc::new(RecordingDriver::new(
        Size::new(1080.0, 1920.0),
        Size::new(1080.0, 1920.0),
    ))
}

fn action(value: Value) -> MobileAction {
    serde_json::from_value(value).unwrap()
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Routes this thread's events at INFO and above into a buffer.
fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn test_tap_xy_from_json() {
    let driver = driver();
    let executor = ActionExecutor::new(driver.clone());

    let result = executor
        .execute(action(json!({ "method": "tap_xy", "params": [0.5, 0.5] })))
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(driver.taps(), vec![Point::new(540.0, 960.0)]);

    let logs = executor.action_logs().await;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].is_success());
    assert_eq!(logs[0].action.method, ActionMethod::TapXy);
}

#[tokio::test]
async fn test_tap_abs_xy_applies_offset() {
    let driver = driver();
    let executor = ActionExecutor::new(driver.clone());

    let result = executor
        .execute(action(json!({
            "method": "tap_abs_xy",
            "params": [100, 200],
            "options": { "offset": [10.0, -10.0] }
        })))
        .await;

    assert!(result.success);
    assert_eq!(driver.taps(), vec![Point::new(110.0, 190.0)]);
}

#[tokio::test]
async fn test_invalid_params_are_validation_failures() {
    let driver = driver();
    let executor = ActionExecutor::new(driver.clone());

    let bad_shape = executor
        .execute(MobileAction::new("tap_xy", json!("middle")))
        .await;
    assert!(!bad_shape.success);
    assert_eq!(bad_shape.error_code, Some("validation"));
    assert!(bad_shape.message.contains("tap_xy"));

    let out_of_range = executor
        .execute(MobileAction::new("tap_xy", json!([1.5, 0.5])))
        .await;
    assert_eq!(out_of_range.error_code, Some("validation"));

    let bad_direction = executor
        .execute(MobileAction::new("swipe", json!("sideways")))
        .await;
    assert_eq!(bad_direction.error_code, Some("validation"));

    assert!(driver.calls().is_empty());
    let logs = executor.action_logs().await;
    assert!(matches!(
        &logs[0].result,
        ActionResult::Failure { code, .. } if code == "validation"
    ));
}

#[tokio::test]
async fn test_unknown_method_is_not_implemented() {
    let executor = ActionExecutor::new(driver());

    let result = executor.execute(MobileAction::new("shake", Value::Null)).await;
    assert!(!result.success);
    assert_eq!(result.error_code, Some("not_implemented"));
    assert!(result.message.contains("shake"));
}

#[tokio::test]
async fn test_unsupported_backend_operation_is_not_implemented() {
    let executor = ActionExecutor::new(driver());

    let result = executor.execute(MobileAction::new("back", Value::Null)).await;
    assert_eq!(result.error_code, Some("not_implemented"));
}

#[tokio::test]
async fn test_vision_method_without_recognizer_is_config_error() {
    let executor = ActionExecutor::new(driver());

    let result = executor
        .execute(MobileAction::new("tap_ocr", json!("Settings")))
        .await;
    assert_eq!(result.error_code, Some("config"));
}

#[tokio::test]
async fn test_swipe_by_name_and_vector() {
    let driver = driver();
    let executor = ActionExecutor::new(driver.clone());

    assert!(executor.execute(MobileAction::new("swipe", json!("left"))).await.success);
    assert!(
        executor
            .execute(MobileAction::new("swipe", json!([0.5, 0.8, 0.5, 0.2])))
            .await
            .success
    );

    assert_eq!(
        driver.calls(),
        vec![
            Call::Swipe(Point::new(540.0, 960.0), Point::new(108.0, 960.0)),
            Call::Swipe(Point::new(540.0, 1536.0), Point::new(540.0, 384.0)),
        ]
    );
}

#[tokio::test]
async fn test_screenshot_returns_base64_png() {
    let executor = ActionExecutor::new(driver());

    let result = executor.execute(MobileAction::new("screenshot", Value::Null)).await;
    assert!(result.success);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(result.screenshot.unwrap())
        .unwrap();
    assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
}

#[tokio::test]
async fn test_execute_all_stops_at_first_failure() {
    let driver = driver();
    let executor = ActionExecutor::new(driver.clone());

    let results = executor
        .execute_all(vec![
            MobileAction::new("home", Value::Null),
            MobileAction::new("input", json!("hello")),
            MobileAction::new("shake", Value::Null),
            MobileAction::new("home", Value::Null),
        ])
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].success && results[1].success && !results[2].success);
    assert_eq!(driver.calls(), vec![Call::Home, Call::Input("hello".into())]);
    assert_eq!(executor.action_logs().await.len(), 3);
}

#[tokio::test]
async fn test_action_log_is_capped() {
    let driver = driver();
    let executor = ActionExecutor::new(driver.clone()).with_log_capacity(2);

    for _ in 0..3 {
        executor.execute(MobileAction::new("home", Value::Null)).await;
    }
    executor.execute(MobileAction::new("input", json!("last"))).await;

    let logs = executor.action_logs().await;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].action.method, ActionMethod::Home);
    assert_eq!(logs[1].action.method, ActionMethod::Input);
    assert_eq!(driver.calls().len(), 4);
}

#[tokio::test]
async fn test_every_action_logs_method_params_and_outcome() {
    let (logs, _guard) = capture_logs();
    let executor = ActionExecutor::new(driver());

    executor
        .execute(MobileAction::new("tap_xy", json!([0.5, 0.25])))
        .await;
    executor.execute(MobileAction::new("shake", json!(3))).await;

    let output = logs.contents();
    let lines: Vec<&str> = output.lines().collect();
    let success = lines.iter().find(|l| l.contains("action complete")).unwrap();
    assert!(success.contains("INFO"));
    assert!(success.contains("tap_xy"));
    assert!(success.contains("params=[0.5,0.25]"));
    assert!(success.contains("elapsed_ms="));
    assert!(success.contains("success=true"));

    let failure = lines.iter().find(|l| l.contains("action failed")).unwrap();
    assert!(failure.contains("WARN"));
    assert!(failure.contains("shake"));
    assert!(failure.contains("params=3"));
    assert!(failure.contains("code=\"not_implemented\""));
}

#[tokio::test]
async fn test_login_secrets_stay_out_of_logs() {
    let (logs, _guard) = capture_logs();
    let executor = ActionExecutor::new(driver());

    executor
        .execute(MobileAction::new(
            "login",
            json!({ "phone": "13800000000", "password": "hunter2" }),
        ))
        .await;

    let output = logs.contents();
    assert!(output.contains("login"));
    assert!(output.contains("13800000000"));
    assert!(output.contains("***"));
    assert!(!output.contains("hunter2"));
}

#[tokio::test]
async fn test_sleep_ms_waits() {
    let executor = ActionExecutor::new(driver());

    let result = executor.execute(MobileAction::new("sleep_ms", json!(20))).await;
    assert!(result.success);
    assert!(result.elapsed_ms >= 20);
}

// ---------------------------------------------------------------------------
// With a vision driver
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_vision_actions_dispatch_through_recognizer() {
    let driver = driver();
    let recognizer = Arc::new(ScriptedRecognizer::always(ocr(&[(
        "Settings",
        Rect::new(100.0, 200.0, 40.0, 20.0),
    )])));
    let vision = Arc::new(VisionDriver::new(driver.clone(), recognizer.clone()));
    let executor = ActionExecutor::with_vision(vision);

    let tapped = executor
        .execute(MobileAction::new("tap_ocr", json!("Settings")))
        .await;
    assert!(tapped.success, "{}", tapped.message);
    assert_eq!(driver.taps(), vec![Point::new(120.0, 210.0)]);

    let popups = executor
        .execute(MobileAction::new("close_popups", Value::Null))
        .await;
    assert!(popups.success);
    assert_eq!(popups.data, Some(json!({ "closed": 0 })));

    let missing = executor
        .execute(action(json!({
            "method": "swipe_to_tap_texts",
            "params": ["Allow", "OK"],
            "options": { "max_retry_times": 2, "interval": 0.0 }
        })))
        .await;
    assert_eq!(missing.error_code, Some("not_found"));
    assert_eq!(driver.swipes(), 1);
}

#[tokio::test]
async fn test_ignore_not_found_turns_miss_into_success() {
    let driver = driver();
    let recognizer = Arc::new(ScriptedRecognizer::always(Recognition::default()));
    let executor = ActionExecutor::with_vision(Arc::new(VisionDriver::new(driver.clone(), recognizer)));

    let result = executor
        .execute(action(json!({
            "method": "tap_ocr",
            "params": "Skip",
            "options": { "ignore_not_found": true }
        })))
        .await;
    assert!(result.success);
    assert!(driver.taps().is_empty());
}
