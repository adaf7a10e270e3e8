//! Action execution against the active driver.
//!
//! [`ActionExecutor`] is the single seam through which data-described
//! actions reach the driver core. It coerces each action's `params` with
//! [`crate::params`], dispatches on the closed [`ActionMethod`] set and logs
//! method, params, elapsed time and outcome uniformly. Login secrets are
//! masked before they reach the log.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use uixt_core::action::MobileAction;
//! use uixt_core::config::UixtConfig;
//! use uixt_core::driver::DriverConfig;
//! use uixt_core::executor::ActionExecutor;
//! use uixt_core::factory::create_driver;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = DriverConfig::Adb { serial: "emulator-5554".to_string() };
//!     let driver = create_driver(config, &UixtConfig::default()).unwrap();
//!     let executor = ActionExecutor::new(driver);
//!
//!     let result = executor.execute(MobileAction::new("tap_xy", json!([0.5, 0.5]))).await;
//!     if result.success {
//!         println!("Tapped the center");
//!     }
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::action::{ActionLog, ActionMethod, ActionResult, MobileAction};
use crate::config::{ConfigError, UixtConfig, RECOGNITION_URL_ENV};
use crate::driver::{AutomationDriver, DriverError, Result};
use crate::geometry::Point;
use crate::options::{Direction, SwipeDirection};
use crate::params;
use crate::vision::VisionDriver;

/// Result of executing an action.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Human-readable description of the result.
    pub message: String,
    /// Stable error code when the action failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    /// Screenshot captured by the action (base64-encoded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Additional data returned by the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    /// A successful result with no screenshot or data attached.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_code: None,
            screenshot: None,
            data: None,
            elapsed_ms: 0,
        }
    }

    /// A failed result carrying the error's message and stable code.
    pub fn failure(err: &DriverError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            error_code: Some(err.kind().code()),
            screenshot: None,
            data: None,
            elapsed_ms: 0,
        }
    }

    /// Attaches a base64-encoded screenshot.
    pub fn with_screenshot(mut self, screenshot: String) -> Self {
        self.screenshot = Some(screenshot);
        self
    }

    /// Attaches method-specific result data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Executes [`MobileAction`]s against a driver.
///
/// Vision methods need a [`VisionDriver`]; without one they fail with a
/// config error. The action log keeps the most recent
/// [`UixtConfig::action_log_capacity`] entries.
pub struct ActionExecutor {
    driver: Arc<dyn AutomationDriver>,
    vision: Option<Arc<VisionDriver>>,
    logs: Mutex<VecDeque<ActionLog>>,
    log_capacity: usize,
}

impl ActionExecutor {
    /// Creates an executor for plain driver methods only.
    pub fn new(driver: Arc<dyn AutomationDriver>) -> Self {
        Self {
            driver,
            vision: None,
            logs: Mutex::new(VecDeque::new()),
            log_capacity: UixtConfig::default().action_log_capacity,
        }
    }

    /// Creates an executor whose plain driver calls go through the vision
    /// driver's inner driver.
    pub fn with_vision(vision: Arc<VisionDriver>) -> Self {
        Self {
            driver: vision.driver().clone(),
            vision: Some(vision),
            logs: Mutex::new(VecDeque::new()),
            log_capacity: UixtConfig::default().action_log_capacity,
        }
    }

    /// Caps the action log at `capacity` entries (at least one).
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    /// The driver plain methods dispatch to.
    pub fn driver(&self) -> &Arc<dyn AutomationDriver> {
        &self.driver
    }

    /// The retained actions, oldest first.
    pub async fn action_logs(&self) -> Vec<ActionLog> {
        self.logs.lock().await.iter().cloned().collect()
    }

    /// Executes an action and returns the result. Never panics on failure.
    pub async fn execute(&self, action: MobileAction) -> ExecutionResult {
        let span = info_span!(
            "execute_action",
            method = action.name(),
            params = %loggable_params(&action),
        );
        async {
            let start = Instant::now();
            let outcome = self.dispatch(&action).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            let (mut result, logged) = match outcome {
                Ok(result) => {
                    info!(elapsed_ms, success = true, "action complete");
                    (result, ActionResult::Success)
                }
                Err(e) => {
                    warn!(elapsed_ms, success = false, code = e.kind().code(), error = %e, "action failed");
                    let logged = ActionResult::Failure {
                        code: e.kind().code().to_string(),
                        message: e.to_string(),
                    };
                    (ExecutionResult::failure(&e), logged)
                }
            };
            result.elapsed_ms = elapsed_ms;

            let mut logs = self.logs.lock().await;
            while logs.len() >= self.log_capacity {
                logs.pop_front();
            }
            logs.push_back(ActionLog::new(action, logged, elapsed_ms));
            result
        }
        .instrument(span)
        .await
    }

    /// Executes a sequence, stopping at the first failure.
    pub async fn execute_all(&self, actions: Vec<MobileAction>) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            let result = self.execute(action).await;
            let failed = !result.success;
            results.push(result);
            if failed {
                break;
            }
        }
        results
    }

    fn vision(&self) -> Result<&VisionDriver> {
        self.vision
            .as_deref()
            .ok_or(DriverError::Config(ConfigError::MissingEnv(RECOGNITION_URL_ENV)))
    }

    async fn dispatch(&self, action: &MobileAction) -> Result<ExecutionResult> {
        let method = action.method.as_str();
        let params = &action.params;
        let opts = &action.options;
        let driver = &self.driver;

        match &action.method {
            ActionMethod::AppLaunch => {
                let package = params::string(method, params)?;
                driver.app_launch(&package).await?;
                Ok(ExecutionResult::success(format!("Launched {package}")))
            }
            ActionMethod::AppTerminate => {
                let package = params::string(method, params)?;
                let terminated = driver.app_terminate(&package).await?;
                Ok(ExecutionResult::success(format!("Terminated {package}"))
                    .with_data(json!({ "terminated": terminated })))
            }
            ActionMethod::AppClear => {
                let package = params::string(method, params)?;
                driver.app_clear(&package).await?;
                Ok(ExecutionResult::success(format!("Cleared {package}")))
            }
            ActionMethod::Home => {
                driver.home().await?;
                Ok(ExecutionResult::success("Pressed home"))
            }
            ActionMethod::Back => {
                driver.back().await?;
                Ok(ExecutionResult::success("Pressed back"))
            }
            ActionMethod::TapXy => {
                let [x, y] = params::point(method, params)?;
                driver.tap_xy(x, y, opts).await?;
                Ok(ExecutionResult::success(format!("Tapped at ({x}, {y})")))
            }
            ActionMethod::TapAbsXy => {
                let [x, y] = params::point(method, params)?;
                let point = opts.apply_offset(Point::new(x, y));
                driver.tap_abs_xy(point.x, point.y, opts).await?;
                Ok(ExecutionResult::success(format!("Tapped at ({}, {})", point.x, point.y)))
            }
            ActionMethod::TapOcr => {
                let text = params::string(method, params)?;
                self.vision()?.tap_by_ocr(&text, opts).await?;
                Ok(ExecutionResult::success(format!("Tapped text '{text}'")))
            }
            ActionMethod::TapCv => {
                let ui_types = params::strings(method, params)?;
                self.vision()?.tap_by_ui_detection(&ui_types, opts).await?;
                Ok(ExecutionResult::success(format!("Tapped {}", ui_types.join("|"))))
            }
            ActionMethod::DoubleTapXy => {
                let [x, y] = params::point(method, params)?;
                driver.double_tap_xy(x, y, opts).await?;
                Ok(ExecutionResult::success(format!("Double tapped at ({x}, {y})")))
            }
            ActionMethod::TouchAndHoldXy => {
                let [x, y] = params::point(method, params)?;
                driver.touch_and_hold_xy(x, y, opts).await?;
                Ok(ExecutionResult::success(format!("Held at ({x}, {y})")))
            }
            ActionMethod::Swipe => {
                if let Value::String(name) = params {
                    let direction: Direction = serde_json::from_value(Value::String(name.clone()))
                        .map_err(|_| {
                            DriverError::InvalidParams(format!(
                                "{method}: unknown direction {name:?}, use up/down/left/right"
                            ))
                        })?;
                    let mut opts = opts.clone();
                    opts.direction = Some(SwipeDirection::Named(direction));
                    driver.swipe_direction(&opts).await?;
                    return Ok(ExecutionResult::success(format!("Swiped {name}")));
                }
                let [fx, fy, tx, ty] = params::vector(method, params)?;
                driver.swipe(fx, fy, tx, ty, opts).await?;
                Ok(ExecutionResult::success("Swiped"))
            }
            ActionMethod::Drag => {
                let [fx, fy, tx, ty] = params::vector(method, params)?;
                driver.drag(fx, fy, tx, ty, opts).await?;
                Ok(ExecutionResult::success("Dragged"))
            }
            ActionMethod::Input => {
                let text = params::string(method, params)?;
                driver.input(&text, opts).await?;
                Ok(ExecutionResult::success(format!("Typed {} chars", text.chars().count())))
            }
            ActionMethod::Backspace => {
                let count = if params.is_null() { 1 } else { params::count(method, params)? };
                driver.backspace(count, opts).await?;
                Ok(ExecutionResult::success(format!("Deleted {count} chars")))
            }
            ActionMethod::Sleep | ActionMethod::SleepMs | ActionMethod::SleepRandom => {
                let duration = match action.method {
                    ActionMethod::Sleep => params::seconds(method, params)?,
                    ActionMethod::SleepMs => params::millis(method, params)?,
                    _ => params::random_sleep(method, params)?,
                };
                tokio::time::sleep(duration).await;
                Ok(ExecutionResult::success(format!("Slept {}ms", duration.as_millis())))
            }
            ActionMethod::Screenshot => {
                let bytes = driver.screenshot().await?;
                let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
                Ok(ExecutionResult::success("Screenshot captured").with_screenshot(b64))
            }
            ActionMethod::Source => {
                let tree = driver.source(opts).await?;
                Ok(ExecutionResult::success("Source dumped").with_data(Value::String(tree)))
            }
            ActionMethod::ClosePopups => {
                let closed = self.vision()?.close_popups(opts).await?;
                Ok(ExecutionResult::success(format!("Closed {closed} popups"))
                    .with_data(json!({ "closed": closed })))
            }
            ActionMethod::SwipeToTapApp => {
                let app = params::string(method, params)?;
                self.vision()?.swipe_to_tap_app(&app, opts).await?;
                Ok(ExecutionResult::success(format!("Tapped app '{app}'")))
            }
            ActionMethod::SwipeToTapText => {
                let text = params::string(method, params)?;
                self.vision()?.swipe_to_tap_text(&text, opts).await?;
                Ok(ExecutionResult::success(format!("Tapped text '{text}'")))
            }
            ActionMethod::SwipeToTapTexts => {
                let texts = params::strings(method, params)?;
                self.vision()?.swipe_to_tap_texts(&texts, opts).await?;
                Ok(ExecutionResult::success(format!("Tapped one of {texts:?}")))
            }
            ActionMethod::SetIme => {
                let ime = params::string(method, params)?;
                driver.set_ime(&ime).await?;
                Ok(ExecutionResult::success(format!("IME set to {ime}")))
            }
            ActionMethod::SetRotation => {
                let rotation = params::rotation(method, params)?;
                driver.set_rotation(rotation).await?;
                Ok(ExecutionResult::success(format!("Rotated to {}", rotation.z)))
            }
            ActionMethod::StartCaptureLog => {
                let identifier = match params {
                    Value::Null => opts.identifier.clone().unwrap_or_default(),
                    other => params::string(method, other)?,
                };
                driver.start_capture_log(&identifier).await?;
                Ok(ExecutionResult::success("Log capture started"))
            }
            ActionMethod::StopCaptureLog => {
                let lines = driver.stop_capture_log().await?;
                Ok(ExecutionResult::success(format!("Captured {} log lines", lines.len()))
                    .with_data(json!(lines)))
            }
            ActionMethod::Login => {
                let credentials = params::credentials(method, params)?;
                let info = driver.login(&credentials).await?;
                Ok(ExecutionResult::success("Logged in").with_data(serde_json::to_value(info)?))
            }
            ActionMethod::Logout => {
                driver.logout().await?;
                Ok(ExecutionResult::success("Logged out"))
            }
            ActionMethod::Other(name) => Err(DriverError::NotImplemented(format!("action method {name}"))),
        }
    }
}

const MASKED_KEYS: [&str; 2] = ["password", "captcha"];

/// Params rendered for logging, with login secrets masked.
fn loggable_params(action: &MobileAction) -> Value {
    let mut params = action.params.clone();
    if action.method == ActionMethod::Login {
        if let Value::Object(map) = &mut params {
            for key in MASKED_KEYS {
                if let Some(value) = map.get_mut(key) {
                    if !value.is_null() {
                        *value = json!("***");
                    }
                }
            }
        }
    }
    params
}
