//! [`AutomationDriver`] implementation for the UiAutomator2 HTTP server.
//!
//! The server runs on the device (launched by
//! [`AndroidDevice::start_uia2_server`]) and is reached through an `adb
//! forward`. Gestures, screenshots and the UI tree go over HTTP; app
//! lifecycle, log capture and other shell-side operations are delegated to an
//! inner [`AdbDriver`] bound to the same device.
//!
//! A [`Uia2Reset`] handler is registered on the session, so a crashed or
//! restarted server is brought back and a fresh session id swapped in without
//! the caller noticing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::adb::AndroidDevice;
use crate::adb_driver::AdbDriver;
use crate::device::Device;
use crate::driver::{AutomationDriver, DriverError, Result};
use crate::geometry::{Orientation, Point, Rotation, Size};
use crate::info::{AppInfo, BackendStatus, BatteryInfo, BatteryState, DeviceInfo};
use crate::options::ActionOptions;
use crate::session::{DriverSession, SessionReset, SessionSettings};
use crate::webdriver::{self, PointerActions};

const KEYCODE_HOME: u32 = 3;
const KEYCODE_DEL: u32 = 67;

/// Polls while waiting for a freshly launched server.
const SERVER_READY_POLLS: u32 = 20;
const SERVER_READY_INTERVAL: Duration = Duration::from_millis(500);

fn default_capabilities() -> Value {
    json!({
        "capabilities": {
            "alwaysMatch": {
                "platformName": "Android",
                "appium:automationName": "UiAutomator2",
                "appium:newCommandTimeout": 0,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Session reset
// ---------------------------------------------------------------------------

/// Restores the UIA2 server and creates a new session.
pub struct Uia2Reset {
    device: Arc<AndroidDevice>,
}

impl Uia2Reset {
    pub fn new(device: Arc<AndroidDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl SessionReset for Uia2Reset {
    async fn health_check(&self, session: &DriverSession) -> Result<()> {
        if session.get_once("/status").await.is_ok() {
            return Ok(());
        }
        warn!(serial = %self.device.uuid(), "uiautomator2 server unhealthy, relaunching");
        self.device.start_uia2_server().await?;
        wait_until_ready(session).await
    }

    async fn create_session(&self, session: &DriverSession) -> Result<String> {
        let response = session.post_once("/session", &default_capabilities()).await?;
        webdriver::session_id(&response)
            .ok_or_else(|| DriverError::JsonParse(format!("no session id in {response}")))
    }
}

async fn wait_until_ready(session: &DriverSession) -> Result<()> {
    for _ in 0..SERVER_READY_POLLS {
        if session.get_once("/status").await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(SERVER_READY_INTERVAL).await;
    }
    Err(DriverError::ConnectionLost(
        "uiautomator2 server did not become ready".into(),
    ))
}

// ---------------------------------------------------------------------------
// Uia2Driver
// ---------------------------------------------------------------------------

/// Android driver backed by the UiAutomator2 server.
pub struct Uia2Driver {
    device: Arc<AndroidDevice>,
    session: Arc<DriverSession>,
    adb: AdbDriver,
    server_port: u16,
}

impl Uia2Driver {
    pub fn new(device: Arc<AndroidDevice>, server_port: u16, settings: SessionSettings) -> Result<Self> {
        let adb = AdbDriver::new(device.clone(), settings.clone())?;
        Ok(Self {
            device,
            session: Arc::new(DriverSession::new(settings)?),
            adb,
            server_port,
        })
    }

    /// Creates a driver talking to an already reachable server at `base_url`.
    ///
    /// `setup` then skips the port forward and only ensures a session.
    pub fn with_base_url(
        device: Arc<AndroidDevice>,
        base_url: impl Into<String>,
        settings: SessionSettings,
    ) -> Result<Self> {
        let adb = AdbDriver::new(device.clone(), settings.clone())?;
        Ok(Self {
            device,
            session: Arc::new(DriverSession::with_base_url(settings, base_url)?),
            adb,
            server_port: 0,
        })
    }

    /// Path under the current remote session.
    async fn session_path(&self, suffix: &str) -> Result<String> {
        let id = self.session.require_remote_session_id().await?;
        Ok(format!("/session/{id}{suffix}"))
    }

    async fn get_value(&self, suffix: &str) -> Result<Value> {
        let path = self.session_path(suffix).await?;
        Ok(webdriver::unwrap_value(self.session.get(&path).await?))
    }

    async fn post_value(&self, suffix: &str, body: &Value) -> Result<Value> {
        let path = self.session_path(suffix).await?;
        Ok(webdriver::unwrap_value(self.session.post(&path, body).await?))
    }

    async fn perform(&self, actions: PointerActions) -> Result<()> {
        self.post_value("/actions", &actions.into_payload()).await?;
        Ok(())
    }

    async fn press_keycode(&self, keycode: u32) -> Result<()> {
        self.post_value("/appium/device/press_keycode", &json!({ "keycode": keycode }))
            .await?;
        Ok(())
    }

    async fn ensure_session(&self, capabilities: Option<Value>) -> Result<()> {
        let body = capabilities.unwrap_or_else(default_capabilities);
        let response = self.session.post_once("/session", &body).await?;
        let id = webdriver::session_id(&response)
            .ok_or_else(|| DriverError::JsonParse(format!("no session id in {response}")))?;
        self.session.set_remote_session_id(Some(id.clone())).await;
        info!(session_id = %id, "uiautomator2 session created");
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for Uia2Driver {
    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn session(&self) -> &DriverSession {
        &self.session
    }

    #[instrument(skip(self), fields(serial = %self.device.uuid()))]
    async fn setup(&self) -> Result<()> {
        self.device.setup().await?;
        if self.session.base_url().await.is_none() {
            let local = self.device.forward(0, self.server_port).await?;
            self.session
                .set_base_url(format!("http://127.0.0.1:{local}/wd/hub"))
                .await;
            debug!(local, remote = self.server_port, "uiautomator2 port forwarded");
        }
        self.session
            .register_reset_handler(Arc::new(Uia2Reset::new(self.device.clone())))
            .await;

        if self.session.get_once("/status").await.is_err() {
            self.device.start_uia2_server().await?;
            wait_until_ready(&self.session).await?;
        }
        self.ensure_session(None).await
    }

    async fn teardown(&self) -> Result<()> {
        if let Err(e) = self.delete_session().await {
            debug!(error = %e, "delete session failed during teardown");
        }
        self.adb.teardown().await?;
        self.session.invalidate_screen_cache().await;
        Ok(())
    }

    async fn init_session(&self, capabilities: Option<Value>) -> Result<()> {
        self.session.invalidate_screen_cache().await;
        self.ensure_session(capabilities).await
    }

    async fn delete_session(&self) -> Result<()> {
        if let Some(id) = self.session.set_remote_session_id(None).await {
            self.session.delete_once(&format!("/session/{id}")).await?;
        }
        Ok(())
    }

    async fn status(&self) -> Result<BackendStatus> {
        let raw = self.session.get("/status").await?;
        let value = webdriver::unwrap_value(raw.clone());
        Ok(BackendStatus {
            ready: value.get("ready").and_then(Value::as_bool).unwrap_or(true),
            message: value.get("message").and_then(Value::as_str).map(str::to_string),
            raw,
        })
    }

    async fn device_info(&self) -> Result<DeviceInfo> {
        let value = self.get_value("/appium/device/info").await?;
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let mut info = DeviceInfo {
            model: text("model"),
            brand: text("brand").or_else(|| text("manufacturer")),
            os_version: text("platformVersion"),
            sdk_version: text("apiVersion"),
            ..DeviceInfo::default()
        };
        if let Value::Object(map) = &value {
            for (key, v) in map {
                if !["model", "brand", "manufacturer", "platformVersion", "apiVersion"]
                    .contains(&key.as_str())
                {
                    info.extra.insert(key.clone(), v.clone());
                }
            }
        }
        Ok(info)
    }

    async fn battery_info(&self) -> Result<BatteryInfo> {
        let value = self.get_value("/appium/device/battery_info").await?;
        let level = value.get("level").and_then(Value::as_f64).unwrap_or(0.0);
        let state = match value.get("status").and_then(Value::as_i64) {
            Some(2) => BatteryState::Charging,
            Some(3) => BatteryState::Discharging,
            Some(4) => BatteryState::NotCharging,
            Some(5) => BatteryState::Full,
            _ => BatteryState::Unknown,
        };
        // Reported as a 0..1 fraction.
        let level = if level <= 1.0 { level * 100.0 } else { level };
        Ok(BatteryInfo { level, state })
    }

    async fn foreground_info(&self) -> Result<AppInfo> {
        self.adb.foreground_info().await
    }

    async fn fetch_window_size(&self) -> Result<Size> {
        let value = self.get_value("/window/current/size").await?;
        let size = webdriver::parse_size(&value)?;
        let orientation = self.orientation().await.unwrap_or_default();
        Ok(size.for_orientation(orientation))
    }

    async fn orientation(&self) -> Result<Orientation> {
        let value = self.get_value("/orientation").await?;
        value
            .as_str()
            .and_then(Orientation::parse)
            .ok_or_else(|| DriverError::JsonParse(format!("unknown orientation {value}")))
    }

    async fn rotation(&self) -> Result<Rotation> {
        let value = self.get_value("/rotation").await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn set_rotation(&self, rotation: Rotation) -> Result<()> {
        self.post_value("/rotation", &serde_json::to_value(rotation)?)
            .await?;
        self.session.invalidate_screen_cache().await;
        Ok(())
    }

    async fn set_ime(&self, ime: &str) -> Result<()> {
        self.adb.set_ime(ime).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let value = self.get_value("/screenshot").await?;
        webdriver::decode_image(&value)
    }

    async fn screen_record(&self, duration: Duration) -> Result<Vec<u8>> {
        self.adb.screen_record(duration).await
    }

    async fn source(&self, _opts: &ActionOptions) -> Result<String> {
        let value = self.get_value("/source").await?;
        match value {
            Value::String(xml) => Ok(xml),
            other => Ok(other.to_string()),
        }
    }

    #[instrument(skip(self, _opts))]
    async fn tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.perform(PointerActions::tap(Point::new(x, y))).await
    }

    async fn double_tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.perform(PointerActions::double_tap(Point::new(x, y))).await
    }

    async fn touch_and_hold_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        let hold = opts.press_duration().as_millis() as u64;
        self.perform(PointerActions::long_press(Point::new(x, y), hold))
            .await
    }

    async fn drag_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let steps = opts.steps.unwrap_or(12);
        self.post_value(
            "/touch/drag",
            &json!({
                "startX": from.x.round(),
                "startY": from.y.round(),
                "endX": to.x.round(),
                "endY": to.y.round(),
                "steps": steps,
            }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, opts))]
    async fn swipe_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let ms = opts.swipe_duration().as_millis() as u64;
        self.perform(PointerActions::swipe(from, to, ms)).await
    }

    async fn input(&self, text: &str, opts: &ActionOptions) -> Result<()> {
        let mut body = json!({ "text": text, "value": [text] });
        if let Some(frequency) = opts.frequency {
            body["frequency"] = json!(frequency);
        }
        self.post_value("/keys", &body).await?;
        Ok(())
    }

    async fn backspace(&self, count: usize, _opts: &ActionOptions) -> Result<()> {
        for _ in 0..count {
            self.press_keycode(KEYCODE_DEL).await?;
        }
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.press_keycode(KEYCODE_HOME).await
    }

    async fn back(&self) -> Result<()> {
        self.post_value("/back", &json!({})).await?;
        Ok(())
    }

    async fn app_launch(&self, package: &str) -> Result<()> {
        self.adb.app_launch(package).await
    }

    async fn app_terminate(&self, package: &str) -> Result<bool> {
        self.adb.app_terminate(package).await
    }

    async fn app_clear(&self, package: &str) -> Result<()> {
        self.adb.app_clear(package).await
    }

    async fn start_capture_log(&self, identifier: &str) -> Result<()> {
        self.adb.start_capture_log(identifier).await
    }

    async fn stop_capture_log(&self) -> Result<Vec<String>> {
        self.adb.stop_capture_log().await
    }
}
