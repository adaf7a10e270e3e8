//! [`AutomationDriver`] that layers the in-app stub hook over another driver.
//!
//! Everything the base driver already does is delegated to it unchanged.
//! The hook only takes over what no automation server exposes: the in-app
//! view dump (`source`), login/logout and static-method invocation.
//!
//! The hook socket is reached through a port forward on the base driver's
//! device. A dropped connection is re-established once per command.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::driver::{AutomationDriver, DriverError, Result};
use crate::geometry::{Orientation, Point, Rotation, Size};
use crate::info::{AppInfo, BackendStatus, BatteryInfo, DeviceInfo, LoginCredentials, LoginInfo};
use crate::options::ActionOptions;
use crate::session::DriverSession;
use crate::stub_client::StubClient;
use crate::stub_protocol::StubCommand;

/// Parses the hook's login status payload.
///
/// Accepts either a bare boolean or an object with `isLogin`/`uid`/`nickname`.
pub fn parse_login_info(value: &Value) -> LoginInfo {
    match value {
        Value::Bool(is_login) => LoginInfo {
            is_login: *is_login,
            ..LoginInfo::default()
        },
        Value::Object(map) => {
            let text = |key: &str| {
                map.get(key).and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
            };
            LoginInfo {
                is_login: map
                    .get("isLogin")
                    .or_else(|| map.get("is_login"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                uid: text("uid"),
                nickname: text("nickname"),
            }
        }
        _ => LoginInfo::default(),
    }
}

/// Stub-socket driver wrapping a base driver.
pub struct StubDriver {
    base: Arc<dyn AutomationDriver>,
    device_port: u16,
    addr: RwLock<Option<SocketAddr>>,
    client: Mutex<Option<StubClient>>,
}

impl StubDriver {
    /// Wraps `base`; `setup` forwards `device_port` on the base device.
    pub fn new(base: Arc<dyn AutomationDriver>, device_port: u16) -> Self {
        Self {
            base,
            device_port,
            addr: RwLock::new(None),
            client: Mutex::new(None),
        }
    }

    /// Wraps `base` and talks to a hook already reachable at `addr`.
    pub fn with_address(base: Arc<dyn AutomationDriver>, addr: SocketAddr) -> Self {
        Self {
            base,
            device_port: 0,
            addr: RwLock::new(Some(addr)),
            client: Mutex::new(None),
        }
    }

    pub fn base(&self) -> &Arc<dyn AutomationDriver> {
        &self.base
    }

    /// Invokes a static method in the app and returns its result.
    pub async fn invoke_static(&self, class: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call(StubCommand::InvokeStatic {
            class: class.to_string(),
            method: method.to_string(),
            args,
        })
        .await
    }

    pub async fn is_login(&self) -> Result<LoginInfo> {
        let value = self.call(StubCommand::IsLogin).await?;
        Ok(parse_login_info(&value))
    }

    /// Sends one command, reconnecting once if the connection is broken.
    async fn call(&self, command: StubCommand) -> Result<Value> {
        let started = Instant::now();
        let outcome = self.call_with_reconnect(&command).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(value) => {
                let body = serde_json::to_vec(value).unwrap_or_default();
                self.session()
                    .record_command("SOCKET", command.name(), elapsed, Ok(body.as_slice()))
                    .await;
            }
            Err(e) => {
                self.session()
                    .record_command("SOCKET", command.name(), elapsed, Err(e))
                    .await;
            }
        }
        outcome
    }

    async fn call_with_reconnect(&self, command: &StubCommand) -> Result<Value> {
        let mut guard = self.client.lock().await;
        if guard.as_ref().map_or(true, |c| !c.is_connected()) {
            *guard = Some(self.open().await?);
        }
        let Some(client) = guard.as_mut() else {
            return Err(DriverError::NotConnected);
        };

        match client.send(command).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_connection_error() => {
                warn!(cmd = command.name(), error = %e, "stub connection lost, reconnecting");
                client.connect().await?;
                Ok(client.send(command).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self) -> Result<StubClient> {
        let addr = self.addr.read().await.ok_or(DriverError::NotConnected)?;
        let mut client = StubClient::new(addr);
        client.connect().await?;
        debug!(%addr, "stub hook connected");
        Ok(client)
    }
}

#[async_trait]
impl AutomationDriver for StubDriver {
    fn device(&self) -> Arc<dyn Device> {
        self.base.device()
    }

    fn session(&self) -> &DriverSession {
        self.base.session()
    }

    async fn setup(&self) -> Result<()> {
        self.base.setup().await?;
        if self.addr.read().await.is_none() {
            let local = self.base.device().forward(0, self.device_port).await?;
            let addr = SocketAddr::from(([127, 0, 0, 1], local));
            *self.addr.write().await = Some(addr);
            info!(%addr, device_port = self.device_port, "stub hook forwarded");
        }
        *self.client.lock().await = Some(self.open().await?);
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if let Some(mut client) = self.client.lock().await.take() {
            client.disconnect();
        }
        self.base.teardown().await
    }

    async fn init_session(&self, capabilities: Option<Value>) -> Result<()> {
        self.base.init_session(capabilities).await
    }

    async fn delete_session(&self) -> Result<()> {
        self.base.delete_session().await
    }

    async fn status(&self) -> Result<BackendStatus> {
        self.base.status().await
    }

    async fn device_info(&self) -> Result<DeviceInfo> {
        self.base.device_info().await
    }

    async fn battery_info(&self) -> Result<BatteryInfo> {
        self.base.battery_info().await
    }

    async fn foreground_info(&self) -> Result<AppInfo> {
        self.base.foreground_info().await
    }

    async fn fetch_window_size(&self) -> Result<Size> {
        self.base.fetch_window_size().await
    }

    async fn window_size(&self) -> Result<Size> {
        self.base.window_size().await
    }

    async fn orientation(&self) -> Result<Orientation> {
        self.base.orientation().await
    }

    async fn rotation(&self) -> Result<Rotation> {
        self.base.rotation().await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.base.screenshot().await
    }

    async fn screen_record(&self, duration: Duration) -> Result<Vec<u8>> {
        self.base.screen_record(duration).await
    }

    /// In-app view dump from the hook.
    async fn source(&self, opts: &ActionOptions) -> Result<String> {
        let format = opts
            .custom
            .get("format")
            .and_then(Value::as_str)
            .map(str::to_string);
        match self.call(StubCommand::DumpView { format }).await? {
            Value::String(tree) => Ok(tree),
            other => Ok(other.to_string()),
        }
    }

    async fn set_rotation(&self, rotation: Rotation) -> Result<()> {
        self.base.set_rotation(rotation).await
    }

    async fn set_ime(&self, ime: &str) -> Result<()> {
        self.base.set_ime(ime).await
    }

    async fn tap_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        self.base.tap_abs_xy(x, y, opts).await
    }

    async fn double_tap_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        self.base.double_tap_abs_xy(x, y, opts).await
    }

    async fn touch_and_hold_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        self.base.touch_and_hold_abs_xy(x, y, opts).await
    }

    async fn drag_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        self.base.drag_abs(from, to, opts).await
    }

    async fn swipe_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        self.base.swipe_abs(from, to, opts).await
    }

    async fn input(&self, text: &str, opts: &ActionOptions) -> Result<()> {
        self.base.input(text, opts).await
    }

    async fn backspace(&self, count: usize, opts: &ActionOptions) -> Result<()> {
        self.base.backspace(count, opts).await
    }

    async fn home(&self) -> Result<()> {
        self.base.home().await
    }

    async fn back(&self) -> Result<()> {
        self.base.back().await
    }

    async fn app_launch(&self, package: &str) -> Result<()> {
        self.base.app_launch(package).await
    }

    async fn app_terminate(&self, package: &str) -> Result<bool> {
        self.base.app_terminate(package).await
    }

    async fn app_clear(&self, package: &str) -> Result<()> {
        self.base.app_clear(package).await
    }

    async fn start_capture_log(&self, identifier: &str) -> Result<()> {
        self.base.start_capture_log(identifier).await
    }

    async fn stop_capture_log(&self) -> Result<Vec<String>> {
        self.base.stop_capture_log().await
    }

    async fn login(&self, credentials: &LoginCredentials) -> Result<LoginInfo> {
        let value = self
            .call(StubCommand::Login {
                phone: credentials.phone.clone(),
                captcha: credentials.captcha.clone(),
                password: credentials.password.clone(),
            })
            .await?;
        let info = match value {
            Value::Null => self.is_login().await?,
            other => parse_login_info(&other),
        };
        if !info.is_login {
            return Err(DriverError::CommandFailed("login did not take effect".into()));
        }
        Ok(info)
    }

    async fn logout(&self) -> Result<()> {
        self.call(StubCommand::Logout).await?;
        Ok(())
    }
}
