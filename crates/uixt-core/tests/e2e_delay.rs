//! End-to-end delay measurement tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{ocr, recognition_down, RecordingDriver, ScriptedRecognizer};
use uixt_core::e2e_delay::{DelayConfig, DelayReport, EndToEndDelay};
use uixt_core::geometry::{Rect, Size};
use uixt_core::recognition::Recognition;
use uixt_core::vision::VisionDriver;

fn vision(recognizer: ScriptedRecognizer) -> Arc<VisionDriver> {
    let driver = Arc::new(RecordingDriver::new(
        Size::new(1080.0, 1920.0),
        Size::new(1080.0, 1920.0),
    ));
    Arc::new(VisionDriver::new(driver, Arc::new(recognizer)))
}

fn config(duration: Duration) -> DelayConfig {
    DelayConfig {
        interval: Duration::from_millis(2),
        ..DelayConfig::new("Live", duration)
    }
}

#[tokio::test]
async fn test_stops_when_text_appears() {
    let recognizer = ScriptedRecognizer::new(vec![
        Ok(Recognition::default()),
        Ok(Recognition::default()),
        Ok(ocr(&[("Live", Rect::new(0.0, 0.0, 40.0, 20.0))])),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("delay.json");
    let delay = EndToEndDelay::new(
        vision(recognizer),
        DelayConfig {
            output: Some(output.clone()),
            ..config(Duration::from_secs(10))
        },
    );

    let report = delay.run_until(CancellationToken::new()).await.unwrap();

    assert!(!report.interrupted);
    assert_eq!(report.samples.len(), 3);
    assert!(report.first_seen_ms.is_some());
    assert!(report.samples[2].found);
    assert!(report.samples.iter().all(|s| s.screen_id.is_some()));

    let written: DelayReport = serde_json::from_slice(&std::fs::read(&output).unwrap()).unwrap();
    assert_eq!(written.samples.len(), 3);
    assert_eq!(written.text, "Live");
}

#[tokio::test]
async fn test_duration_bounds_the_run() {
    let delay = EndToEndDelay::new(
        vision(ScriptedRecognizer::always(Recognition::default())),
        config(Duration::from_millis(30)),
    );

    let report = delay.run_until(CancellationToken::new()).await.unwrap();

    assert!(!report.interrupted);
    assert!(report.first_seen_ms.is_none());
    assert!(!report.samples.is_empty());
    assert!(report.samples.iter().all(|s| !s.found));
}

#[tokio::test]
async fn test_cancellation_returns_samples_so_far() {
    let delay = EndToEndDelay::new(
        vision(ScriptedRecognizer::always(Recognition::default())),
        DelayConfig {
            keep_sampling: true,
            ..config(Duration::from_secs(30))
        },
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        trigger.cancel();
    });

    let report = delay.run_until(cancel).await.unwrap();

    assert!(report.interrupted);
    assert!(!report.samples.is_empty());
}

#[tokio::test]
async fn test_keep_sampling_continues_after_first_sighting() {
    let recognizer = ScriptedRecognizer::new(vec![
        Ok(Recognition::default()),
        Ok(ocr(&[("Live", Rect::new(0.0, 0.0, 40.0, 20.0))])),
    ]);
    let delay = EndToEndDelay::new(
        vision(recognizer),
        DelayConfig {
            keep_sampling: true,
            ..config(Duration::from_millis(60))
        },
    );

    let report = delay.run_until(CancellationToken::new()).await.unwrap();

    let first = report.first_seen_ms.unwrap();
    assert!(report.samples.len() > 2);
    assert!(report.samples.iter().skip(1).all(|s| s.found));
    assert!(first >= report.samples[1].elapsed_ms);
}

#[tokio::test]
async fn test_failed_samples_carry_the_error() {
    let recognizer = ScriptedRecognizer::new(vec![
        recognition_down(),
        recognition_down(),
        recognition_down(),
    ]);
    let delay = EndToEndDelay::new(vision(recognizer), config(Duration::from_millis(10)));

    let report = delay.run_until(CancellationToken::new()).await.unwrap();

    assert_eq!(report.samples.len(), 1);
    assert!(!report.samples[0].found);
    assert!(report.samples[0].error.as_deref().unwrap().contains("model down"));
}
