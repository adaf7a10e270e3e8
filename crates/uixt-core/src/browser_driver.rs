//! [`AutomationDriver`] implementation for the browser automation agent.
//!
//! Every call is scoped to the browser created by the bound
//! [`BrowserDevice`]: `/api/v1/<browser_id>/...`. Coordinates are CSS pixels
//! of the page viewport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::instrument;

use crate::browser::{decode_envelope, BrowserDevice};
use crate::device::Device;
use crate::driver::{AutomationDriver, DriverError, Result};
use crate::geometry::{Point, Size};
use crate::info::BackendStatus;
use crate::options::ActionOptions;
use crate::session::{DriverSession, SessionSettings};
use crate::webdriver;

/// Driver for one browser instance.
pub struct BrowserDriver {
    device: Arc<BrowserDevice>,
    session: Arc<DriverSession>,
}

impl BrowserDriver {
    pub fn new(device: Arc<BrowserDevice>, settings: SessionSettings) -> Result<Self> {
        let session = Arc::new(DriverSession::with_base_url(settings, device.base_url())?);
        Ok(Self { device, session })
    }

    async fn path(&self, suffix: &str) -> Result<String> {
        let id = self.device.browser_id().await?;
        Ok(format!("/api/v1/{id}{suffix}"))
    }

    async fn get_data(&self, suffix: &str) -> Result<Value> {
        let path = self.path(suffix).await?;
        decode_envelope(self.session.get(&path).await?)
    }

    async fn post_data(&self, suffix: &str, body: Value) -> Result<Value> {
        let path = self.path(suffix).await?;
        decode_envelope(self.session.post(&path, &body).await?)
    }

    async fn gesture(&self, kind: &str, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        self.post_data(
            &format!("/ui/{kind}"),
            json!({
                "from_x": from.x,
                "from_y": from.y,
                "to_x": to.x,
                "to_y": to.y,
                "duration": opts.swipe_duration().as_secs_f64(),
            }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AutomationDriver for BrowserDriver {
    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn session(&self) -> &DriverSession {
        &self.session
    }

    async fn setup(&self) -> Result<()> {
        self.device.setup().await
    }

    async fn teardown(&self) -> Result<()> {
        self.session.invalidate_screen_cache().await;
        self.device.teardown().await
    }

    async fn status(&self) -> Result<BackendStatus> {
        let data = self.get_data("/status").await?;
        Ok(BackendStatus {
            ready: true,
            message: None,
            raw: data,
        })
    }

    async fn fetch_window_size(&self) -> Result<Size> {
        let data = self.get_data("/page/size").await?;
        webdriver::parse_size(&data)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let data = self.get_data("/screenshot").await?;
        let encoded = data.get("screenshot").cloned().unwrap_or(data);
        webdriver::decode_image(&encoded)
    }

    async fn source(&self, _opts: &ActionOptions) -> Result<String> {
        let data = self.get_data("/source").await?;
        match data.get("content").and_then(Value::as_str) {
            Some(html) => Ok(html.to_string()),
            None => Ok(data.to_string()),
        }
    }

    #[instrument(skip(self, _opts))]
    async fn tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.post_data("/ui/tap", json!({ "x": x, "y": y })).await?;
        Ok(())
    }

    async fn double_tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.post_data("/ui/double_tap", json!({ "x": x, "y": y }))
            .await?;
        Ok(())
    }

    async fn touch_and_hold_abs_xy(&self, x: f64, y: f64, opts: &ActionOptions) -> Result<()> {
        self.post_data(
            "/ui/hold",
            json!({ "x": x, "y": y, "duration": opts.press_duration().as_secs_f64() }),
        )
        .await?;
        Ok(())
    }

    async fn drag_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        self.gesture("drag", from, to, opts).await
    }

    async fn swipe_abs(&self, from: Point, to: Point, opts: &ActionOptions) -> Result<()> {
        self.gesture("swipe", from, to, opts).await
    }

    async fn input(&self, text: &str, _opts: &ActionOptions) -> Result<()> {
        self.post_data("/ui/input", json!({ "text": text })).await?;
        Ok(())
    }

    async fn backspace(&self, count: usize, _opts: &ActionOptions) -> Result<()> {
        self.post_data("/ui/keypress", json!({ "key": "Backspace", "count": count }))
            .await?;
        Ok(())
    }

    async fn back(&self) -> Result<()> {
        self.post_data("/page/back", json!({})).await?;
        Ok(())
    }

    /// Opens `package` as a URL in a new page.
    async fn app_launch(&self, package: &str) -> Result<()> {
        if !package.contains("://") {
            return Err(DriverError::InvalidParams(format!(
                "browser app_launch expects a URL, got {package:?}"
            )));
        }
        self.post_data("/page/launch", json!({ "url": package }))
            .await?;
        Ok(())
    }

    async fn app_terminate(&self, package: &str) -> Result<bool> {
        let data = self
            .post_data("/page/close", json!({ "url": package }))
            .await?;
        Ok(data.get("closed").and_then(Value::as_bool).unwrap_or(true))
    }
}
