//! [`AutomationDriver`] implementation for WebDriverAgent on iOS.
//!
//! WDA speaks in points while the rest of the crate works in device pixels.
//! The display scale comes from `GET /wda/screen` once per session and is
//! cached next to the window size; every absolute coordinate is divided by
//! it on the way out.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::device::Device;
use crate::driver::{AutomationDriver, DriverError, Result};
use crate::geometry::{Orientation, Point, Rotation, Size};
use crate::info::{AppInfo, BackendStatus, BatteryInfo, BatteryState, DeviceInfo};
use crate::ios::IOSDevice;
use crate::log_capture::CaptureSlot;
use crate::options::ActionOptions;
use crate::session::{DriverSession, SessionReset, SessionSettings};
use crate::webdriver::{self, PointerActions};

/// WDA's text-entry code for delete.
const DELETE_KEY: &str = "\u{8}";

fn default_capabilities() -> Value {
    json!({
        "capabilities": {
            "alwaysMatch": {
                "shouldUseTestManagerForVisibilityDetection": false,
                "shouldUseCompactResponses": true,
            }
        }
    })
}

/// Recreates the WDA session after a transport failure.
///
/// WDA itself is launched outside this crate, so the health check only
/// confirms the server answers again.
pub struct WdaReset;

#[async_trait]
impl SessionReset for WdaReset {
    async fn health_check(&self, session: &DriverSession) -> Result<()> {
        session.get_once("/status").await.map(|_| ())
    }

    async fn create_session(&self, session: &DriverSession) -> Result<String> {
        let response = session.post_once("/session", &default_capabilities()).await?;
        webdriver::session_id(&response)
            .ok_or_else(|| DriverError::JsonParse(format!("no session id in {response}")))
    }
}

/// iOS driver backed by WebDriverAgent.
pub struct WdaDriver {
    device: Arc<IOSDevice>,
    session: Arc<DriverSession>,
    wda_port: u16,
    mjpeg_port: u16,
    mjpeg_local_port: Mutex<Option<u16>>,
    syslog: CaptureSlot,
}

impl WdaDriver {
    pub fn new(device: Arc<IOSDevice>, wda_port: u16, mjpeg_port: u16, settings: SessionSettings) -> Result<Self> {
        Ok(Self {
            device,
            session: Arc::new(DriverSession::new(settings)?),
            wda_port,
            mjpeg_port,
            mjpeg_local_port: Mutex::new(None),
            syslog: CaptureSlot::new(),
        })
    }

    /// Creates a driver for a WDA already reachable at `base_url`.
    pub fn with_base_url(
        device: Arc<IOSDevice>,
        base_url: impl Into<String>,
        settings: SessionSettings,
    ) -> Result<Self> {
        Ok(Self {
            device,
            session: Arc::new(DriverSession::with_base_url(settings, base_url)?),
            wda_port: 0,
            mjpeg_port: 0,
            mjpeg_local_port: Mutex::new(None),
            syslog: CaptureSlot::new(),
        })
    }

    /// Local URL of the MJPEG screen stream, once forwarded.
    pub async fn mjpeg_url(&self) -> Option<String> {
        self.mjpeg_local_port
            .lock()
            .await
            .map(|port| format!("http://127.0.0.1:{port}"))
    }

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

    /// Display scale (pixels per point), cached per session.
    pub async fn scale(&self) -> Result<f64> {
        if let Some(scale) = self.session.cached_scale().await {
            return Ok(scale);
        }
        let screen = webdriver::unwrap_value(self.session.get("/wda/screen").await?);
        let scale = screen
            .get("scale")
            .and_then(Value::as_f64)
            .filter(|s| *s > 0.0)
            .unwrap_or(1.0);
        self.session.cache_scale(scale).await;
        Ok(scale)
    }

    async fn to_points(&self, point: Point) -> Result<Point> {
        let scale = self.scale().await?;
        Ok(Point::new(point.x / scale, point.y / scale))
    }

    async fn ensure_session(&self, capabilities: Option<Value>) -> Result<()> {
        let body = capabilities.unwrap_or_else(default_capabilities);
        let response = self.session.post_once("/session", &body).await?;
        let id = webdriver::session_id(&response)
            .ok_or_else(|| DriverError::JsonParse(format!("no session id in {response}")))?;
        self.session.set_remote_session_id(Some(id.clone())).await;
        info!(session_id = %id, "wda session created");
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for WdaDriver {
    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn session(&self) -> &DriverSession {
        &self.session
    }

    #[instrument(skip(self), fields(udid = %self.device.uuid()))]
    async fn setup(&self) -> Result<()> {
        if self.session.base_url().await.is_none() {
            self.device.setup().await?;
            let local = self.device.forward(0, self.wda_port).await?;
            self.session
                .set_base_url(format!("http://127.0.0.1:{local}"))
                .await;
            let mjpeg = self.device.forward(0, self.mjpeg_port).await?;
            *self.mjpeg_local_port.lock().await = Some(mjpeg);
            debug!(local, mjpeg, "wda ports forwarded");
        }
        self.session.register_reset_handler(Arc::new(WdaReset)).await;
        self.ensure_session(None).await
    }

    async fn teardown(&self) -> Result<()> {
        if let Err(e) = self.delete_session().await {
            debug!(error = %e, "delete session failed during teardown");
        }
        if self.syslog.is_running().await {
            if let Err(e) = self.syslog.stop().await {
                warn!(error = %e, "failed to stop syslog capture during teardown");
            }
        }
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
        let value = webdriver::unwrap_value(self.session.get("/wda/device/info").await?);
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let mut info = DeviceInfo {
            model: text("model"),
            brand: Some("Apple".to_string()),
            os_version: text("osVersion").or_else(|| text("os_version")),
            ..DeviceInfo::default()
        };
        if let Value::Object(map) = &value {
            info.extra = map.clone();
        }
        Ok(info)
    }

    async fn battery_info(&self) -> Result<BatteryInfo> {
        let value = self.get_value("/wda/batteryInfo").await?;
        let level = value.get("level").and_then(Value::as_f64).unwrap_or(0.0);
        // UIDeviceBatteryState: 1 unplugged, 2 charging, 3 full.
        let state = match value.get("state").and_then(Value::as_i64) {
            Some(1) => BatteryState::Discharging,
            Some(2) => BatteryState::Charging,
            Some(3) => BatteryState::Full,
            _ => BatteryState::Unknown,
        };
        Ok(BatteryInfo {
            level: level * 100.0,
            state,
        })
    }

    async fn foreground_info(&self) -> Result<AppInfo> {
        let value = webdriver::unwrap_value(self.session.get("/wda/activeAppInfo").await?);
        let bundle_id = value
            .get("bundleId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::NotFound("active app".into()))?;
        Ok(AppInfo {
            pid: value.get("pid").and_then(Value::as_u64).map(|p| p as u32),
            activity: value.get("name").and_then(Value::as_str).map(str::to_string),
            ..AppInfo::new(bundle_id)
        })
    }

    async fn fetch_window_size(&self) -> Result<Size> {
        let value = self.get_value("/window/size").await?;
        let points = webdriver::parse_size(&value)?;
        let scale = self.scale().await?;
        let orientation = self.orientation().await.unwrap_or_default();
        Ok(points.scaled(scale).for_orientation(orientation))
    }

    async fn orientation(&self) -> Result<Orientation> {
        let value = self.get_value("/orientation").await?;
        value
            .as_str()
            .and_then(Orientation::parse)
            .ok_or_else(|| DriverError::JsonParse(format!("unknown orientation {value}")))
    }

    async fn rotation(&self) -> Result<Rotation> {
        Ok(serde_json::from_value(self.get_value("/rotation").await?)?)
    }

    async fn set_rotation(&self, rotation: Rotation) -> Result<()> {
        self.post_value("/rotation", &serde_json::to_value(rotation)?)
            .await?;
        self.session.invalidate_screen_cache().await;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let value = webdriver::unwrap_value(self.session.get("/screenshot").await?);
        webdriver::decode_image(&value)
    }

    async fn source(&self, opts: &ActionOptions) -> Result<String> {
        let format = opts
            .custom
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("xml");
        let value = self.get_value(&format!("/source?format={format}")).await?;
        match value {
            Value::String(tree) => Ok(tree),
            other => Ok(other.to_string()),
        }
    }

    #[instrument(skip(self, _opts))]
    async fn tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        let p = self.to_points(Point::new(x, y)).await?;
        self.post_value("/wda/tap", &json!({ "x": p.x, "y": p.y }))
            .await?;
        Ok(())
    }

    async fn double_tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        let p = self.to_points(Point::new(x, y)).await?;
        self.post_value("/wda/doubleTap", &json!({ "x": p.x, "y": p.y }))
            .await?;
        Ok(())
    }

    async fn touch_and_hold_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        let p = self.to_points(Point::new(x, y)).await?;
        let duration = opts.press_duration().as_secs_f64();
        self.post_value(
            "/wda/touchAndHold",
            &json!({ "x": p.x, "y": p.y, "duration": duration }),
        )
        .await?;
        Ok(())
    }

    async fn drag_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let from = self.to_points(from).await?;
        let to = self.to_points(to).await?;
        self.post_value(
            "/wda/dragfromtoforduration",
            &json!({
                "fromX": from.x,
                "fromY": from.y,
                "toX": to.x,
                "toY": to.y,
                "duration": opts.swipe_duration().as_secs_f64(),
            }),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, opts))]
    async fn swipe_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        let from = self.to_points(from).await?;
        let to = self.to_points(to).await?;
        let ms = opts.swipe_duration().as_millis() as u64;
        self.post_value("/actions", &PointerActions::swipe(from, to, ms).into_payload())
            .await?;
        Ok(())
    }

    async fn input(&self, text: &str, opts: &ActionOptions) -> Result<()> {
        let frequency = opts.frequency.unwrap_or(60);
        self.post_value("/wda/keys", &json!({ "value": [text], "frequency": frequency }))
            .await?;
        Ok(())
    }

    async fn backspace(&self, count: usize, opts: &ActionOptions) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.input(&DELETE_KEY.repeat(count), opts).await
    }

    async fn home(&self) -> Result<()> {
        self.session.post("/wda/homescreen", &json!({})).await?;
        Ok(())
    }

    async fn app_launch(&self, package: &str) -> Result<()> {
        self.post_value("/wda/apps/launch", &json!({ "bundleId": package }))
            .await?;
        Ok(())
    }

    async fn app_terminate(&self, package: &str) -> Result<bool> {
        let value = self
            .post_value("/wda/apps/terminate", &json!({ "bundleId": package }))
            .await?;
        Ok(value.as_bool().unwrap_or(true))
    }

    async fn start_capture_log(&self, identifier: &str) -> Result<()> {
        self.syslog.start(self.device.syslog_command(), identifier).await
    }

    async fn stop_capture_log(&self) -> Result<Vec<String>> {
        self.syslog.stop().await
    }
}
