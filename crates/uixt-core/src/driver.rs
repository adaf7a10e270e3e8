//! The backend-agnostic driver capability contract.
//!
//! This module defines the [`AutomationDriver`] trait, which every backend
//! (ADB shell, UiAutomator2 HTTP, WebDriverAgent HTTP, HDC shell, browser
//! agent and the stub-socket wrapper) implements. Higher layers such as
//! [`VisionDriver`](crate::vision::VisionDriver) and the
//! [`ActionExecutor`](crate::executor::ActionExecutor) only ever hold an
//! `Arc<dyn AutomationDriver>`, so they never special-case a backend.
//!
//! Relative-coordinate operations (`tap_xy`, `swipe`, `drag`, ...) are
//! implemented here once, as default methods: they validate the input, convert
//! it with the cached [`window_size`](AutomationDriver::window_size) and
//! delegate to the absolute variant that the backend provides.
//!
//! # Backend Selection
//!
//! Use [`DriverConfig`] to pick a backend at runtime and
//! [`create_driver`](crate::factory::create_driver) to build it:
//!
//! ```no_run
//! use uixt_core::driver::DriverConfig;
//!
//! let config = DriverConfig::Uia2 {
//!     serial: "emulator-5554".to_string(),
//!     port: None,
//! };
//!
//! // A stub-socket driver layered over WDA
//! let config = DriverConfig::Stub {
//!     base: Box::new(DriverConfig::Wda {
//!         udid: "00008110-001A0C123456789A".to_string(),
//!         port: None,
//!         mjpeg_port: None,
//!     }),
//!     port: None,
//! };
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ConfigError;
use crate::device::Device;
use crate::geometry::{self, Orientation, Point, Rotation, Size};
use crate::info::{AppInfo, BackendStatus, BatteryInfo, DeviceInfo, LoginCredentials, LoginInfo};
use crate::options::ActionOptions;
use crate::session::DriverSession;

/// Convenience alias used throughout the crate.
pub type Result<T, E = DriverError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Stable error classification for programmatic branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused, timeout, malformed response, dropped session.
    Transport,
    /// The backend does not support the operation.
    NotImplemented,
    /// An element, text or UI type is absent.
    NotFound,
    /// Out-of-range coordinates or malformed action parameters.
    Validation,
    /// The recognition service failed or is unavailable.
    Recognition,
    /// The backend answered but reported a failure.
    Backend,
    /// Missing or invalid configuration.
    Config,
}

impl ErrorKind {
    /// Returns the stable snake_case code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Recognition => "recognition",
            ErrorKind::Backend => "backend",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors that can occur during driver operations.
///
/// This enum unifies errors from all backends behind a single type. Use
/// [`kind`](Self::kind) to branch on the class of failure rather than on
/// individual variants.
#[derive(Error, Debug)]
pub enum DriverError {
    /// A command or operation failed with the given message.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// The backend is not available or not connected.
    #[error("Not connected to automation backend")]
    NotConnected,

    /// The connection to the backend was lost or refused.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An operation timed out.
    #[error("Operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse a backend response.
    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// The backend answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The remote session identifier is no longer valid.
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// The backend does not support this operation.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The requested element, text or UI type was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The swipe-search loop exhausted its attempts.
    #[error("Not found after {loops} loops")]
    LoopNotFound { loops: usize },

    /// A relative coordinate fell outside `[0, 1]`.
    #[error("Invalid relative coordinate ({x}, {y}): must be within [0, 1]")]
    InvalidCoordinate { x: f64, y: f64 },

    /// Action parameters did not have the expected shape.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The recognition service failed.
    #[error("Recognition service error: {0}")]
    Recognition(String),

    /// A USB tunnel operation failed.
    #[error("USB tunnel error: {0}")]
    UsbTunnel(#[from] crate::usb_tunnel::UsbTunnelError),

    /// Configuration is missing or invalid.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::NotConnected
            | DriverError::ConnectionLost(_)
            | DriverError::Timeout
            | DriverError::Io(_)
            | DriverError::JsonParse(_)
            | DriverError::InvalidSession(_)
            | DriverError::UsbTunnel(_) => ErrorKind::Transport,
            DriverError::CommandFailed(_) | DriverError::Http { .. } => ErrorKind::Backend,
            DriverError::NotImplemented(_) => ErrorKind::NotImplemented,
            DriverError::NotFound(_) | DriverError::LoopNotFound { .. } => ErrorKind::NotFound,
            DriverError::InvalidCoordinate { .. } | DriverError::InvalidParams(_) => {
                ErrorKind::Validation
            }
            DriverError::Recognition(_) => ErrorKind::Recognition,
            DriverError::Config(_) => ErrorKind::Config,
        }
    }

    /// True for failures that a session reset may cure.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn not_implemented(operation: &str) -> Self {
        DriverError::NotImplemented(operation.to_string())
    }

    /// Maps a `reqwest` failure onto the transport variants.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DriverError::Timeout
        } else if err.is_decode() {
            DriverError::JsonParse(err.to_string())
        } else {
            DriverError::ConnectionLost(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::JsonParse(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Configuration for selecting an automation backend at runtime.
///
/// Ports left as `None` fall back to the defaults in
/// [`UixtConfig`](crate::config::UixtConfig).
#[derive(Debug, Clone, PartialEq)]
pub enum DriverConfig {
    /// Plain `adb shell` driver.
    Adb {
        /// Device serial as listed by `adb devices`.
        serial: String,
    },
    /// UiAutomator2 HTTP server on an Android device.
    Uia2 {
        serial: String,
        /// Server port on the device.
        port: Option<u16>,
    },
    /// WebDriverAgent HTTP server on an iOS device.
    Wda {
        udid: String,
        /// WDA port on the device.
        port: Option<u16>,
        /// MJPEG screenshot stream port on the device.
        mjpeg_port: Option<u16>,
    },
    /// HarmonyOS `hdc` shell driver.
    Hdc { serial: String },
    /// Browser automation agent.
    Browser {
        /// Agent base URL, e.g. `http://127.0.0.1:8093`.
        base_url: Option<String>,
        /// Reuse an existing browser instance instead of creating one.
        browser_id: Option<String>,
        width: u32,
        height: u32,
    },
    /// Stub-socket driver layered on top of another backend.
    Stub {
        base: Box<DriverConfig>,
        /// Socket port of the in-app hook on the device.
        port: Option<u16>,
    },
}

impl DriverConfig {
    /// Short backend name used in logs.
    pub fn backend_name(&self) -> &'static str {
        match self {
            DriverConfig::Adb { .. } => "adb",
            DriverConfig::Uia2 { .. } => "uia2",
            DriverConfig::Wda { .. } => "wda",
            DriverConfig::Hdc { .. } => "hdc",
            DriverConfig::Browser { .. } => "browser",
            DriverConfig::Stub { .. } => "stub",
        }
    }
}

// ---------------------------------------------------------------------------
// The contract
// ---------------------------------------------------------------------------

/// Trait for backend-agnostic device UI automation.
///
/// Implementors provide the backend primitives; the relative-coordinate and
/// window-size-caching logic comes from the default methods and must not be
/// re-implemented per backend. Operations a backend cannot perform keep the
/// default body, which returns [`DriverError::NotImplemented`].
///
/// # Required Methods
///
/// [`device`](AutomationDriver::device),
/// [`session`](AutomationDriver::session),
/// [`status`](AutomationDriver::status),
/// [`fetch_window_size`](AutomationDriver::fetch_window_size),
/// [`screenshot`](AutomationDriver::screenshot),
/// [`tap_abs_xy`](AutomationDriver::tap_abs_xy),
/// [`swipe_abs`](AutomationDriver::swipe_abs) and
/// [`input`](AutomationDriver::input).
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// The device this driver is bound to.
    fn device(&self) -> Arc<dyn Device>;

    /// The transport session owned by this driver.
    fn session(&self) -> &DriverSession;

    // -- lifecycle ----------------------------------------------------------

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Releases backend resources and invalidates cached screen facts.
    async fn teardown(&self) -> Result<()> {
        self.session().invalidate_screen_cache().await;
        Ok(())
    }

    /// Creates (or re-creates) the remote session.
    ///
    /// Backends without a remote session concept only reset the caches.
    async fn init_session(&self, capabilities: Option<serde_json::Value>) -> Result<()> {
        let _ = capabilities;
        self.session().invalidate_screen_cache().await;
        Ok(())
    }

    async fn delete_session(&self) -> Result<()> {
        Ok(())
    }

    // -- status / introspection --------------------------------------------

    async fn status(&self) -> Result<BackendStatus>;

    async fn device_info(&self) -> Result<DeviceInfo> {
        Err(DriverError::not_implemented("device_info"))
    }

    async fn battery_info(&self) -> Result<BatteryInfo> {
        Err(DriverError::not_implemented("battery_info"))
    }

    async fn foreground_info(&self) -> Result<AppInfo> {
        Err(DriverError::not_implemented("foreground_info"))
    }

    /// Queries the backend for the orientation- and scale-corrected screen
    /// size in device pixels. Callers should use
    /// [`window_size`](Self::window_size), which caches the result.
    async fn fetch_window_size(&self) -> Result<Size>;

    /// Returns the cached window size, fetching it on first use.
    async fn window_size(&self) -> Result<Size> {
        if let Some(size) = self.session().cached_window_size().await {
            return Ok(size);
        }
        let size = self.fetch_window_size().await?;
        self.session().cache_window_size(size).await;
        Ok(size)
    }

    async fn orientation(&self) -> Result<Orientation> {
        Err(DriverError::not_implemented("orientation"))
    }

    async fn rotation(&self) -> Result<Rotation> {
        Err(DriverError::not_implemented("rotation"))
    }

    // -- capture ------------------------------------------------------------

    /// Captures the screen as encoded image bytes (PNG or JPEG).
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Records the screen for `duration` and returns the encoded video.
    async fn screen_record(&self, duration: Duration) -> Result<Vec<u8>> {
        let _ = duration;
        Err(DriverError::not_implemented("screen_record"))
    }

    /// Dumps the UI hierarchy in the backend's native format.
    async fn source(&self, opts: &ActionOptions) -> Result<String> {
        let _ = opts;
        Err(DriverError::not_implemented("source"))
    }

    // -- configuration ------------------------------------------------------

    async fn set_rotation(&self, rotation: Rotation) -> Result<()> {
        let _ = rotation;
        Err(DriverError::not_implemented("set_rotation"))
    }

    async fn set_ime(&self, ime: &str) -> Result<()> {
        let _ = ime;
        Err(DriverError::not_implemented("set_ime"))
    }

    // -- gestures -----------------------------------------------------------

    /// Taps at absolute device pixels.
    async fn tap_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()>;

    /// Taps at a relative position.
    ///
    /// # Arguments
    ///
    /// * `x` - Horizontal position in `[0, 1]`
    /// * `y` - Vertical position in `[0, 1]`
    /// * `opts` - Offsets are applied after conversion
    async fn tap_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        geometry::validate_relative(x, y)?;
        let size = self.window_size().await?;
        let point = opts.apply_offset(geometry::to_absolute_point(x, y, size)?);
        self.tap_abs_xy(point.x, point.y, opts).await
    }

    async fn double_tap_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        let _ = (x, y, opts);
        Err(DriverError::not_implemented("double_tap"))
    }

    async fn double_tap_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        geometry::validate_relative(x, y)?;
        let size = self.window_size().await?;
        let point = geometry::to_absolute_point(x, y, size)?;
        self.double_tap_abs_xy(point.x, point.y, opts).await
    }

    async fn touch_and_hold_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        let _ = (x, y, opts);
        Err(DriverError::not_implemented("touch_and_hold"))
    }

    async fn touch_and_hold_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        geometry::validate_relative(x, y)?;
        let size = self.window_size().await?;
        let point = geometry::to_absolute_point(x, y, size)?;
        self.touch_and_hold_abs_xy(point.x, point.y, opts).await
    }

    async fn drag_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let _ = (from, to, opts);
        Err(DriverError::not_implemented("drag"))
    }

    async fn drag(
        &self,
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
        opts: &ActionOptions,
    ) -> Result<()> {
        geometry::validate_relative(from_x, from_y)?;
        geometry::validate_relative(to_x, to_y)?;
        let size = self.window_size().await?;
        let (from, to) = geometry::to_absolute_swipe(from_x, from_y, to_x, to_y, size)?;
        self.drag_abs(from, to, opts).await
    }

    /// Swipes between absolute device pixels.
    async fn swipe_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()>;

    /// Swipes between two relative positions.
    async fn swipe(
        &self,
        from_x: f64,
        from_y: f64,
        to_x: f64,
        to_y: f64,
        opts: &ActionOptions,
    ) -> Result<()> {
        geometry::validate_relative(from_x, from_y)?;
        geometry::validate_relative(to_x, to_y)?;
        let size = self.window_size().await?;
        let (from, to) = geometry::to_absolute_swipe(from_x, from_y, to_x, to_y, size)?;
        self.swipe_abs(from, to, opts).await
    }

    /// Swipes in `opts.direction` (defaults to up).
    async fn swipe_direction(&self, opts: &ActionOptions) -> Result<()> {
        let [fx, fy, tx, ty] = opts
            .direction
            .map(|d| d.to_relative())
            .unwrap_or([0.5, 0.5, 0.5, 0.1]);
        self.swipe(fx, fy, tx, ty, opts).await
    }

    // -- text input ---------------------------------------------------------

    async fn input(&self, text: &str, opts: &ActionOptions) -> Result<()>;

    async fn backspace(&self, count: usize, opts: &ActionOptions) -> Result<()> {
        let _ = (count, opts);
        Err(DriverError::not_implemented("backspace"))
    }

    // -- navigation ---------------------------------------------------------

    async fn home(&self) -> Result<()> {
        Err(DriverError::not_implemented("home"))
    }

    async fn back(&self) -> Result<()> {
        Err(DriverError::not_implemented("back"))
    }

    // -- app lifecycle ------------------------------------------------------

    async fn app_launch(&self, package: &str) -> Result<()> {
        let _ = package;
        Err(DriverError::not_implemented("app_launch"))
    }

    /// Stops the app. Returns `false` if it was not running.
    async fn app_terminate(&self, package: &str) -> Result<bool> {
        let _ = package;
        Err(DriverError::not_implemented("app_terminate"))
    }

    async fn app_clear(&self, package: &str) -> Result<()> {
        let _ = package;
        Err(DriverError::not_implemented("app_clear"))
    }

    // -- log capture --------------------------------------------------------

    async fn start_capture_log(&self, identifier: &str) -> Result<()> {
        let _ = identifier;
        Err(DriverError::not_implemented("start_capture_log"))
    }

    /// Stops log capture and returns the captured lines.
    async fn stop_capture_log(&self) -> Result<Vec<String>> {
        Err(DriverError::not_implemented("stop_capture_log"))
    }

    // -- in-app hook --------------------------------------------------------

    async fn login(&self, credentials: &LoginCredentials) -> Result<LoginInfo> {
        let _ = credentials;
        Err(DriverError::not_implemented("login"))
    }

    async fn logout(&self) -> Result<()> {
        Err(DriverError::not_implemented("logout"))
    }
}
