//! Data-described actions and their execution log.
//!
//! A [`MobileAction`] is the wire form of one step: a method tag, opaque
//! `params` and an [`ActionOptions`] record. It is what an external caller
//! sends and what [`ActionExecutor`](crate::executor::ActionExecutor)
//! consumes.
//!
//! # Method families
//!
//! - **App lifecycle**: [`ActionMethod::AppLaunch`], [`ActionMethod::AppTerminate`], [`ActionMethod::AppClear`]
//! - **Gestures**: [`ActionMethod::TapXy`], [`ActionMethod::TapAbsXy`], [`ActionMethod::Swipe`], [`ActionMethod::Drag`], ...
//! - **Vision**: [`ActionMethod::TapOcr`], [`ActionMethod::TapCv`], [`ActionMethod::ClosePopups`], [`ActionMethod::SwipeToTapTexts`], ...
//! - **Waiting**: [`ActionMethod::Sleep`], [`ActionMethod::SleepMs`], [`ActionMethod::SleepRandom`]
//!
//! Unknown tags deserialize to [`ActionMethod::Other`] and fail at execution
//! time with a not-implemented error.
//!
//! # Example
//!
//! ```
//! use uixt_core::action::{ActionMethod, MobileAction};
//!
//! let action: MobileAction = serde_json::from_str(
//!     r#"{"method": "tap_xy", "params": [0.5, 0.5], "options": {"identifier": "center"}}"#,
//! ).unwrap();
//! assert_eq!(action.method, ActionMethod::TapXy);
//! assert_eq!(action.options.identifier.as_deref(), Some("center"));
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::options::ActionOptions;

/// The closed set of methods the executor understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionMethod {
    AppLaunch,
    AppTerminate,
    AppClear,
    Home,
    Back,
    TapXy,
    TapAbsXy,
    TapOcr,
    TapCv,
    DoubleTapXy,
    TouchAndHoldXy,
    Swipe,
    Drag,
    Input,
    Backspace,
    Sleep,
    SleepMs,
    SleepRandom,
    Screenshot,
    Source,
    ClosePopups,
    SwipeToTapApp,
    SwipeToTapText,
    SwipeToTapTexts,
    SetIme,
    SetRotation,
    StartCaptureLog,
    StopCaptureLog,
    Login,
    Logout,
    /// A tag this crate does not know.
    Other(String),
}

impl ActionMethod {
    /// The snake_case wire name.
    pub fn as_str(&self) -> &str {
        match self {
            ActionMethod::AppLaunch => "app_launch",
            ActionMethod::AppTerminate => "app_terminate",
            ActionMethod::AppClear => "app_clear",
            ActionMethod::Home => "home",
            ActionMethod::Back => "back",
            ActionMethod::TapXy => "tap_xy",
            ActionMethod::TapAbsXy => "tap_abs_xy",
            ActionMethod::TapOcr => "tap_ocr",
            ActionMethod::TapCv => "tap_cv",
            ActionMethod::DoubleTapXy => "double_tap_xy",
            ActionMethod::TouchAndHoldXy => "touch_and_hold_xy",
            ActionMethod::Swipe => "swipe",
            ActionMethod::Drag => "drag",
            ActionMethod::Input => "input",
            ActionMethod::Backspace => "backspace",
            ActionMethod::Sleep => "sleep",
            ActionMethod::SleepMs => "sleep_ms",
            ActionMethod::SleepRandom => "sleep_random",
            ActionMethod::Screenshot => "screenshot",
            ActionMethod::Source => "source",
            ActionMethod::ClosePopups => "close_popups",
            ActionMethod::SwipeToTapApp => "swipe_to_tap_app",
            ActionMethod::SwipeToTapText => "swipe_to_tap_text",
            ActionMethod::SwipeToTapTexts => "swipe_to_tap_texts",
            ActionMethod::SetIme => "set_ime",
            ActionMethod::SetRotation => "set_rotation",
            ActionMethod::StartCaptureLog => "start_capture_log",
            ActionMethod::StopCaptureLog => "stop_capture_log",
            ActionMethod::Login => "login",
            ActionMethod::Logout => "logout",
            ActionMethod::Other(name) => name,
        }
    }

    /// True for methods that need a recognition service.
    pub fn needs_vision(&self) -> bool {
        matches!(
            self,
            ActionMethod::TapOcr
                | ActionMethod::TapCv
                | ActionMethod::ClosePopups
                | ActionMethod::SwipeToTapApp
                | ActionMethod::SwipeToTapText
                | ActionMethod::SwipeToTapTexts
        )
    }
}

impl From<&str> for ActionMethod {
    fn from(name: &str) -> Self {
        match name {
            "app_launch" => ActionMethod::AppLaunch,
            "app_terminate" => ActionMethod::AppTerminate,
            "app_clear" => ActionMethod::AppClear,
            "home" => ActionMethod::Home,
            "back" => ActionMethod::Back,
            "tap_xy" => ActionMethod::TapXy,
            "tap_abs_xy" => ActionMethod::TapAbsXy,
            "tap_ocr" => ActionMethod::TapOcr,
            "tap_cv" => ActionMethod::TapCv,
            "double_tap_xy" => ActionMethod::DoubleTapXy,
            "touch_and_hold_xy" => ActionMethod::TouchAndHoldXy,
            "swipe" => ActionMethod::Swipe,
            "drag" => ActionMethod::Drag,
            "input" => ActionMethod::Input,
            "backspace" => ActionMethod::Backspace,
            "sleep" => ActionMethod::Sleep,
            "sleep_ms" => ActionMethod::SleepMs,
            "sleep_random" => ActionMethod::SleepRandom,
            "screenshot" => ActionMethod::Screenshot,
            "source" => ActionMethod::Source,
            "close_popups" => ActionMethod::ClosePopups,
            "swipe_to_tap_app" => ActionMethod::SwipeToTapApp,
            "swipe_to_tap_text" => ActionMethod::SwipeToTapText,
            "swipe_to_tap_texts" => ActionMethod::SwipeToTapTexts,
            "set_ime" => ActionMethod::SetIme,
            "set_rotation" => ActionMethod::SetRotation,
            "start_capture_log" => ActionMethod::StartCaptureLog,
            "stop_capture_log" => ActionMethod::StopCaptureLog,
            "login" => ActionMethod::Login,
            "logout" => ActionMethod::Logout,
            other => ActionMethod::Other(other.to_string()),
        }
    }
}

impl From<String> for ActionMethod {
    fn from(name: String) -> Self {
        ActionMethod::from(name.as_str())
    }
}

impl From<ActionMethod> for String {
    fn from(method: ActionMethod) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for ActionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One data-described step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileAction {
    pub method: ActionMethod,
    /// Method-specific arguments, coerced at dispatch time.
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub options: ActionOptions,
}

impl MobileAction {
    /// Creates an action with default options.
    pub fn new(method: impl Into<ActionMethod>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            options: ActionOptions::default(),
        }
    }

    /// Replaces the action's options.
    pub fn with_options(mut self, options: ActionOptions) -> Self {
        self.options = options;
        self
    }

    /// Method name for span metadata.
    pub fn name(&self) -> &str {
        self.method.as_str()
    }
}

/// The result of executing an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionResult {
    Success,
    /// Failure with the error code and message.
    Failure { code: String, message: String },
}

/// A logged action with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: MobileAction,
    pub result: ActionResult,
    pub elapsed_ms: u64,
}

impl ActionLog {
    /// Creates a new entry, stamped with a fresh UUID and the current time.
    pub fn new(action: MobileAction, result: ActionResult, elapsed_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action,
            result,
            elapsed_ms,
        }
    }

    /// Whether the logged action succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.result, ActionResult::Success)
    }
}
