//! Shared test helpers for uixt-core integration tests.
//!
//! This module provides reusable mock infrastructure: a programmable HTTP
//! server standing in for WDA/UIA2/browser agents, a mock stub-socket hook,
//! an in-process [`RecordingDriver`] and a scripted recognizer.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use uixt_core::config::UixtConfig;
use uixt_core::device::{Device, Platform};
use uixt_core::driver::{AutomationDriver, DriverError, Result};
use uixt_core::geometry::{Point, Rect, Size};
use uixt_core::info::BackendStatus;
use uixt_core::options::{ActionOptions, ScreenShotOptions};
use uixt_core::recognition::{ImageRecognizer, OcrText, OcrTexts, PopupInfo, Recognition};
use uixt_core::session::{DriverSession, SessionSettings};
use uixt_core::stub_protocol::{decode_request, encode_response, RequestFrame, ResponseFrame};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Session settings with short timeouts and no reset backoff.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        request_timeout: Duration::from_secs(2),
        reset_retries: 3,
        reset_backoff: Duration::from_millis(1),
        ..SessionSettings::from_config(&UixtConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Programmable HTTP server
// ---------------------------------------------------------------------------

/// One request as seen by [`MockHttpServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

/// How the mock answers one request.
pub enum MockReply {
    /// Reply with a status and JSON body.
    Json(u16, Value),
    /// Read the request and close the connection without answering.
    Drop,
}

impl MockReply {
    pub fn ok(body: Value) -> Self {
        MockReply::Json(200, body)
    }

    /// A W3C `{value: ...}` envelope.
    pub fn value(value: Value) -> Self {
        MockReply::Json(200, json!({ "value": value }))
    }
}

type Handler = dyn Fn(&RecordedRequest) -> MockReply + Send + Sync;

/// A minimal HTTP/1.1 server whose replies come from a handler closure.
///
/// Every request is recorded, including those answered with
/// [`MockReply::Drop`].
pub struct MockHttpServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockHttpServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(stream, handler.clone(), recorded.clone()));
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Paths of recorded requests with the given method.
    pub fn paths(&self, method: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .map(|r| r.path)
            .collect()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let request = RecordedRequest {
            method,
            path,
            body: serde_json::from_slice(&body).unwrap_or(Value::Null),
        };
        requests.lock().unwrap().push(request.clone());

        match handler(&request) {
            MockReply::Drop => return,
            MockReply::Json(status, value) => {
                let payload = value.to_string();
                let response = format!(
                    "HTTP/1.1 {status} MOCK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{payload}",
                    payload.len()
                );
                if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                let _ = reader.get_mut().flush().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock stub-socket hook
// ---------------------------------------------------------------------------

/// How the mock hook answers one command.
pub enum StubReply {
    Result(Value),
    Error(String),
    /// Close the connection without answering.
    Drop,
}

/// Starts a hook that accepts any number of connections and answers each
/// request line through `handler`. Returns the address and a counter of
/// accepted connections.
pub async fn mock_stub_agent<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&RequestFrame) -> StubReply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let accepted = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            accepted.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    let Ok(request) = decode_request(line.as_bytes()) else {
                        return;
                    };
                    let response = match handler(&request) {
                        StubReply::Result(value) => ResponseFrame::ok(request.seq, value),
                        StubReply::Error(message) => ResponseFrame::err(request.seq, message),
                        StubReply::Drop => return,
                    };
                    let bytes = encode_response(&response).unwrap();
                    if reader.get_mut().write_all(&bytes).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, connections)
}

// ---------------------------------------------------------------------------
// Fake adb
// ---------------------------------------------------------------------------

/// Writes an `adb` stand-in into `dir`.
///
/// It reports the device as attached, answers `forward tcp:0 ...` with
/// `forward_port` and appends every invocation to `dir/adb.log`.
#[cfg(unix)]
pub fn fake_adb(dir: &Path, forward_port: u16) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("adb");
    let script = format!(
        "#!/bin/sh\n\
         echo \"$*\" >> '{log}'\n\
         case \"$3\" in\n\
         get-state) echo device ;;\n\
         forward) [ \"$4\" = tcp:0 ] && echo {forward_port} ;;\n\
         esac\n\
         exit 0\n",
        log = dir.join("adb.log").display(),
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lines the fake adb has logged so far.
pub fn adb_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("adb.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// In-process driver
// ---------------------------------------------------------------------------

/// A device that never touches hardware. `forward` answers with a fixed port.
pub struct FakeDevice {
    pub forward_port: u16,
}

#[async_trait]
impl Device for FakeDevice {
    fn uuid(&self) -> &str {
        "fake-device"
    }

    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    async fn forward(&self, _local_port: u16, _remote_port: u16) -> Result<u16> {
        Ok(self.forward_port)
    }
}

/// A call observed by [`RecordingDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Tap(Point),
    Swipe(Point, Point),
    Input(String),
    Home,
}

/// Driver that records gestures and serves a fixed-size PNG screenshot.
pub struct RecordingDriver {
    device: Arc<FakeDevice>,
    session: DriverSession,
    window: Size,
    screenshot: Vec<u8>,
    pub calls: Mutex<Vec<Call>>,
    pub window_fetches: AtomicUsize,
    pub screenshots: AtomicUsize,
}

impl RecordingDriver {
    /// `window` is the device size; the screenshot has `image` pixels.
    pub fn new(window: Size, image: Size) -> Self {
        Self::with_forward_port(window, image, 0)
    }

    pub fn with_forward_port(window: Size, image: Size, forward_port: u16) -> Self {
        Self {
            device: Arc::new(FakeDevice { forward_port }),
            session: DriverSession::new(fast_settings()).unwrap(),
            window,
            screenshot: png(image.width as u32, image.height as u32),
            calls: Mutex::new(Vec::new()),
            window_fetches: AtomicUsize::new(0),
            screenshots: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn taps(&self) -> Vec<Point> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Tap(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn swipes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Swipe(..)))
            .count()
    }
}

#[async_trait]
impl AutomationDriver for RecordingDriver {
    fn device(&self) -> Arc<dyn Device> {
        self.device.clone()
    }

    fn session(&self) -> &DriverSession {
        &self.session
    }

    async fn status(&self) -> Result<BackendStatus> {
        Ok(BackendStatus::ready())
    }

    async fn fetch_window_size(&self) -> Result<Size> {
        self.window_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.window)
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(self.screenshot.clone())
    }

    async fn tap_abs_xy(&self, x: f64, y: f64, _opts: &ActionOptions) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Tap(Point::new(x, y)));
        Ok(())
    }

    async fn swipe_abs(&self, from: Point, to: Point, _opts: &ActionOptions) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Swipe(from, to));
        Ok(())
    }

    async fn input(&self, text: &str, _opts: &ActionOptions) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Input(text.to_string()));
        Ok(())
    }

    async fn home(&self) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Home);
        Ok(())
    }
}

/// Encodes a black PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::new(width.max(1), height.max(1));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

// ---------------------------------------------------------------------------
// Scripted recognizer
// ---------------------------------------------------------------------------

/// Recognizer that replays scripted answers in order and repeats the last
/// one once the script runs out.
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Result<Recognition>>>,
    last: Mutex<Recognition>,
    pub calls: AtomicUsize,
    pub requested: Mutex<Vec<ScreenShotOptions>>,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<Result<Recognition>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Recognition::default()),
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn always(recognition: Recognition) -> Self {
        Self::new(vec![Ok(recognition)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageRecognizer for ScriptedRecognizer {
    async fn recognize(&self, _image: &[u8], opts: &ScreenShotOptions) -> Result<Recognition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(opts.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(recognition)) => {
                *self.last.lock().unwrap() = recognition.clone();
                Ok(recognition)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

/// OCR-only recognition with the given text boxes.
pub fn ocr(boxes: &[(&str, Rect)]) -> Recognition {
    Recognition {
        texts: OcrTexts(boxes.iter().map(|(t, r)| OcrText::new(*t, *r)).collect()),
        ..Recognition::default()
    }
}

/// Popup recognition with a close button at `close`.
pub fn popup(close: Rect) -> Recognition {
    Recognition {
        popup: Some(PopupInfo {
            kind: Some("ad".into()),
            popup_area: Some(Rect::new(0.0, 0.0, 500.0, 800.0)),
            close_area: Some(close),
            text: None,
        }),
        ..Recognition::default()
    }
}

pub fn recognition_down() -> Result<Recognition> {
    Err(DriverError::Recognition("model down".into()))
}
