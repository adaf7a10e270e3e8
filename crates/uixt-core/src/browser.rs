//! Browser instances managed by a browser automation agent.
//!
//! The agent answers every call with a `{code, message, data}` envelope;
//! `code == 0` means success. A [`BrowserDevice`] creates a browser on
//! `setup` (unless attached to an existing one) and closes what it created on
//! `teardown`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::device::{Device, Platform};
use crate::driver::{DriverError, Result};
use crate::session::build_http_client;

/// Browser idle timeout requested from the agent, in seconds.
const BROWSER_IDLE_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

/// Unwraps a browser-agent envelope into its `data`.
pub fn decode_envelope(value: Value) -> Result<Value> {
    let envelope: Envelope = serde_json::from_value(value)?;
    if envelope.code != 0 {
        return Err(DriverError::CommandFailed(format!(
            "browser agent code {}: {}",
            envelope.code, envelope.message
        )));
    }
    Ok(envelope.data)
}

/// One browser instance behind the agent.
pub struct BrowserDevice {
    base_url: String,
    browser_id: RwLock<Option<String>>,
    owned: RwLock<bool>,
    width: u32,
    height: u32,
    http: reqwest::Client,
}

impl BrowserDevice {
    /// Targets the agent at `base_url`; a browser is created on `setup`.
    pub fn new(base_url: impl Into<String>, width: u32, height: u32, timeout: Duration) -> Result<Self> {
        Self::build(base_url.into(), None, width, height, timeout)
    }

    /// Attaches to a browser that already exists; `teardown` leaves it open.
    pub fn attach(base_url: impl Into<String>, browser_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::build(base_url.into(), Some(browser_id.into()), 0, 0, timeout)
    }

    fn build(
        base_url: String,
        browser_id: Option<String>,
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let http = build_http_client(reqwest::Client::builder().timeout(timeout).no_proxy())?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            browser_id: RwLock::new(browser_id),
            owned: RwLock::new(false),
            width,
            height,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn viewport(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub async fn browser_id(&self) -> Result<String> {
        self.browser_id
            .read()
            .await
            .clone()
            .ok_or(DriverError::NotConnected)
    }

    async fn call(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(DriverError::from_reqwest)?;
        let value: Value = response.json().await.map_err(DriverError::from_reqwest)?;
        decode_envelope(value)
    }
}

#[async_trait]
impl Device for BrowserDevice {
    fn uuid(&self) -> &str {
        &self.base_url
    }

    fn platform(&self) -> Platform {
        Platform::Browser
    }

    async fn setup(&self) -> Result<()> {
        if self.browser_id.read().await.is_some() {
            return Ok(());
        }
        let data = self
            .call(
                reqwest::Method::POST,
                "/api/v1/create_browser",
                Some(json!({
                    "timeout": BROWSER_IDLE_TIMEOUT_SECS,
                    "width": self.width,
                    "height": self.height,
                })),
            )
            .await?;
        let id = data
            .get("browser_id")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::JsonParse(format!("no browser_id in {data}")))?
            .to_string();
        info!(browser_id = %id, "browser created");
        *self.browser_id.write().await = Some(id);
        *self.owned.write().await = true;
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        if !*self.owned.read().await {
            return Ok(());
        }
        if let Some(id) = self.browser_id.write().await.take() {
            self.call(reqwest::Method::DELETE, &format!("/api/v1/{id}/close"), None)
                .await?;
            debug!(browser_id = %id, "browser closed");
        }
        *self.owned.write().await = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_and_failure() {
        let data = decode_envelope(json!({"code": 0, "message": "ok", "data": {"browser_id": "b1"}})).unwrap();
        assert_eq!(data["browser_id"], "b1");

        let err = decode_envelope(json!({"code": 500, "message": "no page"})).unwrap_err();
        assert!(err.to_string().contains("no page"));
        assert!(decode_envelope(json!({"message": "x"})).is_err());
    }

    #[tokio::test]
    async fn attached_browser_is_not_closed() {
        let device = BrowserDevice::attach("http://127.0.0.1:1", "existing", Duration::from_secs(1)).unwrap();
        assert_eq!(device.browser_id().await.unwrap(), "existing");
        device.setup().await.unwrap();
        device.teardown().await.unwrap();
        assert_eq!(device.browser_id().await.unwrap(), "existing");
    }
}
