//! End-to-end delay measurement.
//!
//! [`EndToEndDelay`] screenshots and OCRs the screen in a loop to time how
//! long a text takes to appear. It runs for a configured duration, stops early
//! on SIGINT or SIGTERM, and always returns the samples collected so far,
//! optionally writing them as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::driver::Result;
use crate::options::{ActionOptions, ScreenShotOptions};
use crate::vision::VisionDriver;

#[derive(Debug, Clone)]
pub struct DelayConfig {
    /// Text whose appearance ends the measurement.
    pub text: String,
    /// Upper bound on the whole run.
    pub duration: Duration,
    /// Pause between samples.
    pub interval: Duration,
    /// Keep sampling after the text first appears.
    pub keep_sampling: bool,
    /// Where to write the report as JSON.
    pub output: Option<PathBuf>,
    /// Lookup options (scope, regex, index).
    pub options: ActionOptions,
}

impl DelayConfig {
    pub fn new(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            text: text.into(),
            duration,
            interval: Duration::from_millis(200),
            keep_sampling: false,
            output: None,
            options: ActionOptions::default(),
        }
    }
}

/// One screenshot taken during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaySample {
    pub timestamp: DateTime<Utc>,
    /// Time since the run started.
    pub elapsed_ms: u64,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayReport {
    pub text: String,
    pub started_at: DateTime<Utc>,
    /// Time from start until the first sample that contained the text.
    pub first_seen_ms: Option<u64>,
    /// True when a termination signal cut the run short.
    pub interrupted: bool,
    pub samples: Vec<DelaySample>,
}

pub struct EndToEndDelay {
    vision: Arc<VisionDriver>,
    config: DelayConfig,
}

impl EndToEndDelay {
    pub fn new(vision: Arc<VisionDriver>, config: DelayConfig) -> Self {
        Self { vision, config }
    }

    /// Runs until the text appears, the duration elapses or the process is
    /// asked to terminate.
    pub async fn run(&self) -> Result<DelayReport> {
        let cancel = CancellationToken::new();
        let listener = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                wait_for_termination().await;
                cancel.cancel();
            }
        });
        let report = self.run_until(cancel).await;
        listener.abort();
        report
    }

    /// Same as [`run`](Self::run) but stops when `cancel` fires instead of on
    /// OS signals.
    pub async fn run_until(&self, cancel: CancellationToken) -> Result<DelayReport> {
        let started = Instant::now();
        let mut report = DelayReport {
            text: self.config.text.clone(),
            started_at: Utc::now(),
            first_seen_ms: None,
            interrupted: false,
            samples: Vec::new(),
        };
        let shot = ScreenShotOptions {
            with_ocr: true,
            ..self.config.options.screenshot.clone()
        };

        while started.elapsed() < self.config.duration {
            let sample = tokio::select! {
                _ = cancel.cancelled() => {
                    report.interrupted = true;
                    break;
                }
                sample = self.sample(&shot, started) => sample,
            };
            let found = sample.found;
            report.samples.push(sample);

            if found && report.first_seen_ms.is_none() {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(text = %self.config.text, elapsed_ms, "text appeared");
                report.first_seen_ms = Some(elapsed_ms);
                if !self.config.keep_sampling {
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    report.interrupted = true;
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        if let Some(path) = &self.config.output {
            let json = serde_json::to_vec_pretty(&report)?;
            tokio::fs::write(path, json).await?;
            info!(path = %path.display(), samples = report.samples.len(), "delay report written");
        }
        Ok(report)
    }

    async fn sample(&self, shot: &ScreenShotOptions, started: Instant) -> DelaySample {
        let timestamp = Utc::now();
        match self.vision.get_screen_result(shot).await {
            Ok(screen) => DelaySample {
                timestamp,
                elapsed_ms: started.elapsed().as_millis() as u64,
                found: screen.find_text(&self.config.text, &self.config.options).is_ok(),
                screen_id: Some(screen.id),
                error: None,
            },
            Err(e) => {
                warn!(error = %e, "delay sample failed");
                DelaySample {
                    timestamp,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    found: false,
                    screen_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }
}
