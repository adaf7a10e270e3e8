//! Transport session owned by each driver.
//!
//! A [`DriverSession`] carries everything a backend needs to talk to its
//! device and everything a report needs afterwards:
//!
//! - an HTTP client and base URL (HTTP backends only)
//! - the remote session identifier, replaced atomically on reset
//! - the cached window size and display scale
//! - a ring buffer of [`RequestRecord`]s (requests and shell commands)
//! - a bounded cache of [`ScreenResult`]s
//! - a broadcast channel of [`SessionEvent`]s for live observers
//!
//! # Reset and retry
//!
//! Backends that have a remote session concept register a [`SessionReset`]
//! handler. When [`request`](DriverSession::request) fails with a transport
//! error or an invalid-session answer, the session runs a bounded loop: sleep
//! (exponential backoff), check backend health, create a new remote session,
//! rewrite the pending path from the old identifier to the new one and retry.
//! The handler itself must only call the `*_once` methods, which never reset.
//!
//! The session is owned by one driver and expects one logical caller at a
//! time; the interior locks only keep the type `Sync`.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, UixtConfig};
use crate::driver::{DriverError, Result};
use crate::geometry::Size;
use crate::logging::{redact_body, redact_json};
use crate::recognition::ScreenResult;

/// Tunables copied out of [`UixtConfig`] at construction time.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    pub reset_retries: u32,
    pub reset_backoff: Duration,
    pub screen_result_capacity: usize,
    pub request_history_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&UixtConfig::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &UixtConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            reset_retries: config.reset_retries,
            reset_backoff: config.reset_backoff(),
            screen_result_capacity: config.screen_result_capacity.max(1),
            request_history_capacity: config.request_history_capacity.max(1),
        }
    }
}

/// One transport call as recorded for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// HTTP method, or `SHELL` / `SOCKET` for non-HTTP backends.
    pub method: String,
    /// Full URL or command line.
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub elapsed_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestRecord {
    fn new(method: impl Into<String>, target: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            method: method.into(),
            target: target.into(),
            request_body: None,
            status: None,
            response_body: None,
            elapsed_ms: elapsed.as_millis() as u64,
            success: true,
            error: None,
        }
    }
}

/// Events broadcast to session observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A transport call completed (successfully or not).
    RequestCompleted(RequestRecord),

    /// The remote session was rebuilt.
    SessionReset {
        old: Option<String>,
        new: String,
    },

    /// A screen result was appended to the cache.
    ScreenResultCached {
        id: Uuid,
        ocr_texts: usize,
    },

    /// Cached screen facts were invalidated (teardown or re-init).
    ScreenCacheInvalidated,
}

/// Rebuilds the remote session after a transport failure.
///
/// Implementations talk to the backend through the `*_once` request methods.
#[async_trait]
pub trait SessionReset: Send + Sync {
    /// Checks (and if needed restores) backend health.
    async fn health_check(&self, session: &DriverSession) -> Result<()>;

    /// Creates a new remote session and returns its identifier.
    async fn create_session(&self, session: &DriverSession) -> Result<String>;
}

/// Transport state owned by one driver.
pub struct DriverSession {
    /// Logical identity; survives remote session resets.
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    settings: SessionSettings,
    client: reqwest::Client,
    base_url: RwLock<Option<String>>,
    remote_session_id: RwLock<Option<String>>,
    window_size: RwLock<Option<Size>>,
    scale: RwLock<Option<f64>>,
    history: Mutex<VecDeque<RequestRecord>>,
    screen_results: Mutex<VecDeque<Arc<ScreenResult>>>,
    reset_handler: RwLock<Option<Arc<dyn SessionReset>>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

/// Finishes an HTTP client builder, reporting a TLS or resolver setup
/// failure as a config error.
pub(crate) fn build_http_client(builder: reqwest::ClientBuilder) -> Result<reqwest::Client> {
    builder.build().map_err(|e| {
        DriverError::Config(ConfigError::Invalid {
            key: "http_client".into(),
            message: e.to_string(),
        })
    })
}

impl DriverSession {
    /// Creates a session without a base URL (shell and socket backends).
    pub fn new(settings: SessionSettings) -> Result<Self> {
        let client = build_http_client(
            reqwest::Client::builder()
                .timeout(settings.request_timeout)
                .no_proxy(),
        )?;
        let (event_tx, _) = broadcast::channel(100);
        Ok(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            history: Mutex::new(VecDeque::with_capacity(
                settings.request_history_capacity.min(1024),
            )),
            screen_results: Mutex::new(VecDeque::new()),
            settings,
            client,
            base_url: RwLock::new(None),
            remote_session_id: RwLock::new(None),
            window_size: RwLock::new(None),
            scale: RwLock::new(None),
            reset_handler: RwLock::new(None),
            event_tx,
        })
    }

    /// Creates a session targeting an HTTP base URL.
    pub fn with_base_url(settings: SessionSettings, base_url: impl Into<String>) -> Result<Self> {
        let mut session = Self::new(settings)?;
        *session.base_url.get_mut() = Some(base_url.into());
        Ok(session)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Transport state
    // -----------------------------------------------------------------------

    pub async fn base_url(&self) -> Option<String> {
        self.base_url.read().await.clone()
    }

    pub async fn set_base_url(&self, base_url: impl Into<String>) {
        *self.base_url.write().await = Some(base_url.into());
    }

    pub async fn remote_session_id(&self) -> Option<String> {
        self.remote_session_id.read().await.clone()
    }

    /// Replaces the remote session id, returning the previous one.
    pub async fn set_remote_session_id(&self, id: Option<String>) -> Option<String> {
        let mut guard = self.remote_session_id.write().await;
        std::mem::replace(&mut *guard, id)
    }

    /// Returns the remote session id or [`DriverError::InvalidSession`].
    pub async fn require_remote_session_id(&self) -> Result<String> {
        self.remote_session_id()
            .await
            .ok_or_else(|| DriverError::InvalidSession("no remote session".into()))
    }

    pub async fn register_reset_handler(&self, handler: Arc<dyn SessionReset>) {
        *self.reset_handler.write().await = Some(handler);
    }

    // -----------------------------------------------------------------------
    // Screen caches
    // -----------------------------------------------------------------------

    pub async fn cached_window_size(&self) -> Option<Size> {
        *self.window_size.read().await
    }

    pub async fn cache_window_size(&self, size: Size) {
        *self.window_size.write().await = Some(size);
    }

    pub async fn cached_scale(&self) -> Option<f64> {
        *self.scale.read().await
    }

    pub async fn cache_scale(&self, scale: f64) {
        *self.scale.write().await = Some(scale);
    }

    /// Drops the cached window size and scale.
    pub async fn invalidate_screen_cache(&self) {
        *self.window_size.write().await = None;
        *self.scale.write().await = None;
        let _ = self.event_tx.send(SessionEvent::ScreenCacheInvalidated);
    }

    /// Appends a screen result, evicting the oldest beyond capacity.
    pub async fn push_screen_result(&self, result: Arc<ScreenResult>) {
        {
            let mut cache = self.screen_results.lock().await;
            if cache.len() >= self.settings.screen_result_capacity {
                cache.pop_front();
            }
            cache.push_back(result.clone());
        }
        let _ = self.event_tx.send(SessionEvent::ScreenResultCached {
            id: result.id,
            ocr_texts: result.texts.len(),
        });
    }

    pub async fn screen_results(&self) -> Vec<Arc<ScreenResult>> {
        self.screen_results.lock().await.iter().cloned().collect()
    }

    pub async fn latest_screen_result(&self) -> Option<Arc<ScreenResult>> {
        self.screen_results.lock().await.back().cloned()
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    async fn push_record(&self, record: RequestRecord) {
        {
            let mut history = self.history.lock().await;
            if history.len() >= self.settings.request_history_capacity {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        let _ = self.event_tx.send(SessionEvent::RequestCompleted(record));
    }

    /// Records a non-HTTP transport call (shell command, socket command).
    pub async fn record_command(
        &self,
        kind: &str,
        command: &str,
        elapsed: Duration,
        outcome: std::result::Result<&[u8], &DriverError>,
    ) {
        let mut record = RequestRecord::new(kind, command, elapsed);
        match outcome {
            Ok(output) => record.response_body = Some(redact_body(output)),
            Err(e) => {
                record.success = false;
                record.error = Some(e.to_string());
            }
        }
        self.push_record(record).await;
    }

    pub async fn request_history(&self) -> Vec<RequestRecord> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Writes request history and screen results as JSON Lines.
    pub async fn export_jsonl<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        for record in self.request_history().await {
            let line = serde_json::json!({ "type": "request", "record": record });
            writeln!(writer, "{line}")?;
        }
        for result in self.screen_results().await {
            let line = serde_json::json!({ "type": "screen_result", "result": result });
            writeln!(writer, "{line}")?;
        }
        writer.flush()
    }

    pub async fn export_jsonl_to(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        self.export_jsonl(std::io::BufWriter::new(file)).await
    }

    // -----------------------------------------------------------------------
    // HTTP requests
    // -----------------------------------------------------------------------

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }

    pub async fn get_once(&self, path: &str) -> Result<Value> {
        self.request_once(Method::GET, path, None).await
    }

    pub async fn post_once(&self, path: &str, body: &Value) -> Result<Value> {
        self.request_once(Method::POST, path, Some(body)).await
    }

    pub async fn delete_once(&self, path: &str) -> Result<Value> {
        self.request_once(Method::DELETE, path, None).await
    }

    /// Sends a request, rebuilding the remote session on transport failure.
    ///
    /// The rebuild loop is bounded by `reset_retries` with a backoff that
    /// starts at `reset_backoff` and doubles per attempt. Non-transport
    /// errors surface immediately.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let first = self.request_once(method.clone(), path, body).await;
        let err = match first {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let handler = match self.reset_handler.read().await.clone() {
            Some(handler) if err.is_transport() => handler,
            _ => return Err(err),
        };

        warn!(%method, path, error = %err, "request failed, rebuilding remote session");

        let mut path = path.to_string();
        let mut backoff = self.settings.reset_backoff;
        let mut last_err = err;

        for attempt in 1..=self.settings.reset_retries {
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);

            match self.rebuild(handler.as_ref()).await {
                Ok((old, new)) => {
                    if let Some(old) = old {
                        path = rewrite_session_path(&path, &old, &new);
                    }
                    match self.request_once(method.clone(), &path, body).await {
                        Ok(value) => {
                            info!(attempt, "request succeeded after session reset");
                            return Ok(value);
                        }
                        Err(e) if e.is_transport() => {
                            warn!(attempt, error = %e, "retry after reset failed");
                            last_err = e;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "session rebuild failed");
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Runs health check and session creation, then swaps the identifier.
    async fn rebuild(&self, handler: &dyn SessionReset) -> Result<(Option<String>, String)> {
        handler.health_check(self).await?;
        let new = handler.create_session(self).await?;
        let old = self.set_remote_session_id(Some(new.clone())).await;
        info!(old = ?old, new = %new, "remote session rebuilt");
        let _ = self.event_tx.send(SessionEvent::SessionReset {
            old: old.clone(),
            new: new.clone(),
        });
        Ok((old, new))
    }

    /// Sends a single request with no reset handling.
    pub async fn request_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let base = self.base_url().await.ok_or(DriverError::NotConnected)?;
        let url = join_url(&base, path);
        let started = Instant::now();

        let mut builder = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!(%method, %url, "sending request");
        let outcome = send_and_decode(builder).await;
        let elapsed = started.elapsed();

        let mut record = RequestRecord::new(method.as_str(), &url, elapsed);
        record.request_body = body.map(redact_json);
        match &outcome {
            Ok((status, value)) => {
                record.status = Some(*status);
                record.response_body = Some(redact_json(value).to_string());
            }
            Err(e) => {
                if let DriverError::Http { status, .. } = e {
                    record.status = Some(*status);
                }
                record.success = false;
                record.error = Some(e.to_string());
            }
        }
        debug!(
            %method,
            %url,
            elapsed_ms = record.elapsed_ms,
            status = ?record.status,
            success = record.success,
            "request completed"
        );
        self.push_record(record).await;

        outcome.map(|(_, value)| value)
    }
}

impl std::fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("settings", &self.settings)
            .field("history", &"<Mutex<VecDeque<RequestRecord>>>")
            .field("screen_results", &"<Mutex<VecDeque<ScreenResult>>>")
            .finish()
    }
}

async fn send_and_decode(builder: reqwest::RequestBuilder) -> Result<(u16, Value)> {
    let response = builder.send().await.map_err(DriverError::from_reqwest)?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(DriverError::from_reqwest)?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(v) => v,
            Err(_) if status.is_success() => {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(_) => Value::Null,
        }
    };

    if status.is_success() {
        return Ok((status.as_u16(), value));
    }

    let message = error_message(&value).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });
    if is_invalid_session(&value) {
        return Err(DriverError::InvalidSession(message));
    }
    Err(DriverError::Http {
        status: status.as_u16(),
        message,
    })
}

/// Extracts a W3C-style error message from `{value: {error, message}}`.
fn error_message(value: &Value) -> Option<String> {
    let inner = value.get("value").unwrap_or(value);
    inner
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| inner.get("error").and_then(Value::as_str))
        .map(str::to_string)
}

fn is_invalid_session(value: &Value) -> bool {
    let inner = value.get("value").unwrap_or(value);
    inner
        .get("error")
        .and_then(Value::as_str)
        .map_or(false, |e| e == "invalid session id")
}

fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Replaces the `/session/<old>` segment of `path` with `/session/<new>`.
///
/// Only whole path segments are rewritten so an id that happens to be a
/// prefix of another segment is left alone.
pub fn rewrite_session_path(path: &str, old: &str, new: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();
    for i in 1..segments.len() {
        if segments[i - 1] == "session" && segments[i] == old {
            segments[i] = new;
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_replaces_only_session_segment() {
        assert_eq!(
            rewrite_session_path("/session/abc/window/size", "abc", "xyz"),
            "/session/xyz/window/size"
        );
        assert_eq!(
            rewrite_session_path("/session/abc/element/abc", "abc", "xyz"),
            "/session/xyz/element/abc"
        );
        assert_eq!(rewrite_session_path("/status", "abc", "xyz"), "/status");
        assert_eq!(
            rewrite_session_path("/session/abcd/source", "abc", "xyz"),
            "/session/abcd/source"
        );
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://h:1/", "/status"), "http://h:1/status");
        assert_eq!(join_url("http://h:1", "status"), "http://h:1/status");
        assert_eq!(join_url("http://h:1", ""), "http://h:1");
    }

    #[test]
    fn invalid_session_detection() {
        let body = serde_json::json!({"value": {"error": "invalid session id", "message": "gone"}});
        assert!(is_invalid_session(&body));
        assert_eq!(error_message(&body).as_deref(), Some("gone"));
        assert!(!is_invalid_session(&serde_json::json!({"value": null})));
    }

    #[tokio::test]
    async fn window_size_cache_lifecycle() {
        let session = DriverSession::new(SessionSettings::default()).unwrap();
        assert!(session.cached_window_size().await.is_none());
        session.cache_window_size(Size::new(1080.0, 1920.0)).await;
        assert_eq!(
            session.cached_window_size().await,
            Some(Size::new(1080.0, 1920.0))
        );
        session.invalidate_screen_cache().await;
        assert!(session.cached_window_size().await.is_none());
    }

    #[tokio::test]
    async fn history_is_a_ring_buffer() {
        let settings = SessionSettings {
            request_history_capacity: 2,
            ..Default::default()
        };
        let session = DriverSession::new(settings).unwrap();
        for cmd in ["a", "b", "c"] {
            session
                .record_command("SHELL", cmd, Duration::from_millis(1), Ok(b"ok"))
                .await;
        }
        let history = session.request_history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].target, "b");
        assert_eq!(history[1].target, "c");
    }

    #[tokio::test]
    async fn request_without_base_url_is_not_connected() {
        let session = DriverSession::new(SessionSettings::default()).unwrap();
        let err = session.get("/status").await.unwrap_err();
        assert!(matches!(err, DriverError::NotConnected));
    }

    #[tokio::test]
    async fn remote_session_id_is_replaced_atomically() {
        let session = DriverSession::new(SessionSettings::default()).unwrap();
        assert!(session.set_remote_session_id(Some("one".into())).await.is_none());
        let old = session.set_remote_session_id(Some("two".into())).await;
        assert_eq!(old.as_deref(), Some("one"));
        assert_eq!(session.require_remote_session_id().await.unwrap(), "two");
    }

    #[tokio::test]
    async fn export_writes_one_line_per_record() {
        let session = DriverSession::new(SessionSettings::default()).unwrap();
        session
            .record_command("SHELL", "wm size", Duration::from_millis(3), Ok(b"Physical size: 1x1"))
            .await;
        let err = DriverError::Timeout;
        session
            .record_command("SHELL", "input tap 1 1", Duration::from_millis(3), Err(&err))
            .await;
        let mut out = Vec::new();
        session.export_jsonl(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["record"]["success"], false);
    }

    #[test]
    fn http_client_setup_failure_is_a_config_error() {
        // rustls offers nothing at or below TLS 1.0, so the build fails.
        let builder = reqwest::Client::builder().max_tls_version(reqwest::tls::Version::TLS_1_0);
        let err = build_http_client(builder).unwrap_err();
        assert_eq!(err.kind(), crate::driver::ErrorKind::Config);
        assert!(err.to_string().contains("http_client"));
    }
}
