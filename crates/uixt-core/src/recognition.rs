//! Screenshot recognition: OCR, UI-icon detection and popup detection.
//!
//! [`RecognitionClient`] uploads a screenshot to the remote recognition
//! service as a multipart form and parses the JSON answer into a
//! [`Recognition`]. [`ScreenResult`] combines that answer with the raw image
//! and its resolution, and offers the lookups used by the vision layer:
//! [`OcrTexts::find_text`], [`OcrTexts::find_texts`] and
//! [`UiResults::find_ui`].
//!
//! ## Wire contract
//!
//! Request: `POST <url>` with repeated `actions` fields (`ocr`, `ui`,
//! `close`, `liveType`, `livePopularity`), repeated `uiTypes`, `ocrCluster`,
//! `timeout` and an `image` file part.
//!
//! Response: `{code, message, result: {url, ocrResult, uiResult, liveType,
//! livePopularity, closeResult}}`. A non-200 status or non-zero `code` is a
//! failure; the client retries up to `max_attempts` times before surfacing a
//! [`DriverError::Recognition`].

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RecognitionConfig;
use crate::driver::{DriverError, Result};
use crate::geometry::{Point, Rect, Size};
use crate::options::{ActionOptions, ScreenShotOptions};
use crate::session::build_http_client;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Option<WireResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResult {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    ocr_result: Vec<WireOcr>,
    #[serde(default)]
    ui_result: HashMap<String, Vec<WireUi>>,
    #[serde(default)]
    live_type: Option<String>,
    #[serde(default)]
    live_popularity: Option<i64>,
    #[serde(default)]
    close_result: Option<WireClose>,
}

#[derive(Debug, Clone, Deserialize)]
struct WirePoint {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireOcr {
    text: String,
    points: Vec<WirePoint>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUi {
    #[serde(rename = "type", default)]
    ui_type: Option<String>,
    point: WirePoint,
    width: f64,
    height: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireRect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireClose {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    popup_area: Option<WireRect>,
    #[serde(default)]
    close_area: Option<WireRect>,
    #[serde(default)]
    text: Option<String>,
}

impl From<WireRect> for Rect {
    fn from(r: WireRect) -> Self {
        Rect::new(r.x, r.y, r.width, r.height)
    }
}

/// Bounding rectangle of a polygon given as corner points.
fn bounding_rect(points: &[WirePoint]) -> Rect {
    if points.is_empty() {
        return Rect::new(0.0, 0.0, 0.0, 0.0);
    }
    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// One OCR text box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrText {
    pub text: String,
    pub rect: Rect,
}

impl OcrText {
    pub fn new(text: impl Into<String>, rect: Rect) -> Self {
        Self {
            text: text.into(),
            rect,
        }
    }

    pub fn center(&self) -> Point {
        self.rect.center()
    }
}

/// OCR text boxes in scan order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OcrTexts(pub Vec<OcrText>);

impl OcrTexts {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OcrText> {
        self.0.iter()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.0.iter().map(|t| t.text.as_str()).collect()
    }

    /// Finds one text box.
    ///
    /// Matching is exact unless `opts.regex` is set. Boxes outside the
    /// configured scope are ignored. Without `opts.index` the first match
    /// in scan order wins; negative indices count from the end.
    pub fn find_text(&self, text: &str, opts: &ActionOptions, resolution: Size) -> Result<OcrText> {
        let matcher = TextMatcher::new(text, opts.regex)?;
        let scope = opts.scope_rect(resolution);
        let matches: Vec<&OcrText> = self
            .0
            .iter()
            .filter(|t| scope.map_or(true, |s| s.contains_rect(&t.rect)))
            .filter(|t| matcher.is_match(&t.text))
            .collect();
        pick_index(&matches, opts.index)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("text {text:?}")))
    }

    /// Finds several texts.
    ///
    /// With `opts.match_one` the first text that is found is returned on its
    /// own; otherwise every text must be found.
    pub fn find_texts(
        &self,
        texts: &[String],
        opts: &ActionOptions,
        resolution: Size,
    ) -> Result<Vec<OcrText>> {
        if texts.is_empty() {
            return Err(DriverError::InvalidParams("no texts to find".into()));
        }
        let mut found = Vec::with_capacity(texts.len());
        for text in texts {
            match self.find_text(text, opts, resolution) {
                Ok(hit) if opts.match_one => return Ok(vec![hit]),
                Ok(hit) => found.push(hit),
                Err(e) if e.is_not_found() && opts.match_one => continue,
                Err(e) => return Err(e),
            }
        }
        if found.is_empty() {
            return Err(DriverError::NotFound(format!("none of texts {texts:?}")));
        }
        Ok(found)
    }
}

enum TextMatcher {
    Exact(String),
    Pattern(Regex),
}

impl TextMatcher {
    fn new(text: &str, regex: bool) -> Result<Self> {
        if regex {
            Regex::new(text)
                .map(TextMatcher::Pattern)
                .map_err(|e| DriverError::InvalidParams(format!("invalid regex {text:?}: {e}")))
        } else {
            Ok(TextMatcher::Exact(text.to_string()))
        }
    }

    fn is_match(&self, candidate: &str) -> bool {
        match self {
            TextMatcher::Exact(t) => t == candidate,
            TextMatcher::Pattern(re) => re.is_match(candidate),
        }
    }
}

fn pick_index<'a, T>(items: &[&'a T], index: Option<i64>) -> Option<&'a T> {
    let len = items.len() as i64;
    let idx = index.unwrap_or(0);
    let idx = if idx < 0 { len + idx } else { idx };
    if idx < 0 || idx >= len {
        return None;
    }
    items.get(idx as usize).copied()
}

/// One detected UI icon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiBox {
    pub ui_type: String,
    pub rect: Rect,
}

/// Detected icons keyed by icon type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UiResults(pub HashMap<String, Vec<UiBox>>);

impl UiResults {
    /// Finds an icon of any of `ui_types`, honouring scope and index.
    pub fn find_ui(&self, ui_types: &[String], opts: &ActionOptions, resolution: Size) -> Result<UiBox> {
        let scope = opts.scope_rect(resolution);
        let candidates: Vec<&UiBox> = ui_types
            .iter()
            .filter_map(|t| self.0.get(t))
            .flatten()
            .filter(|b| scope.map_or(true, |s| s.contains_rect(&b.rect)))
            .collect();
        pick_index(&candidates, opts.index)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("ui types {ui_types:?}")))
    }

    pub fn total(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

/// Popup-detection outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopupInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popup_area: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_area: Option<Rect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl PopupInfo {
    /// The close-button center, when both a popup and a close button exist.
    pub fn close_point(&self) -> Option<Point> {
        match (&self.popup_area, &self.close_area) {
            (Some(popup), Some(close)) if !popup.is_empty() && !close.is_empty() => {
                Some(close.center())
            }
            _ => None,
        }
    }
}

/// Parsed answer of the recognition service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub url: Option<String>,
    pub texts: OcrTexts,
    pub icons: UiResults,
    pub popup: Option<PopupInfo>,
    pub live_type: Option<String>,
    pub live_popularity: Option<i64>,
}

impl From<WireResult> for Recognition {
    fn from(w: WireResult) -> Self {
        let texts = w
            .ocr_result
            .into_iter()
            .map(|o| OcrText::new(o.text, bounding_rect(&o.points)))
            .collect();
        let icons = w
            .ui_result
            .into_iter()
            .map(|(key, boxes)| {
                let boxes = boxes
                    .into_iter()
                    .map(|b| UiBox {
                        ui_type: b.ui_type.unwrap_or_else(|| key.clone()),
                        rect: Rect::new(b.point.x, b.point.y, b.width, b.height),
                    })
                    .collect();
                (key, boxes)
            })
            .collect();
        let popup = w.close_result.map(|c| PopupInfo {
            kind: c.kind,
            popup_area: c.popup_area.map(Rect::from),
            close_area: c.close_area.map(Rect::from),
            text: c.text,
        });
        Recognition {
            url: w.url,
            texts: OcrTexts(texts),
            icons: UiResults(icons),
            popup,
            live_type: w.live_type,
            live_popularity: w.live_popularity,
        }
    }
}

/// Parses a raw service response body.
pub fn parse_response(body: &[u8]) -> Result<Recognition> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| DriverError::Recognition(format!("malformed response: {e}")))?;
    if envelope.code != 0 {
        return Err(DriverError::Recognition(format!(
            "code {}: {}",
            envelope.code, envelope.message
        )));
    }
    Ok(envelope.result.unwrap_or_default().into())
}

/// A screenshot together with everything derived from it.
///
/// Created once per screen capture and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ScreenResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub image: Arc<Vec<u8>>,
    pub resolution: Size,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub texts: OcrTexts,
    pub icons: UiResults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popup: Option<PopupInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_popularity: Option<i64>,
    pub elapsed_ms: u64,
}

impl ScreenResult {
    pub fn new(image: Vec<u8>, resolution: Size, recognition: Recognition, elapsed: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            image: Arc::new(image),
            resolution,
            url: recognition.url,
            texts: recognition.texts,
            icons: recognition.icons,
            popup: recognition.popup,
            live_type: recognition.live_type,
            live_popularity: recognition.live_popularity,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn find_text(&self, text: &str, opts: &ActionOptions) -> Result<OcrText> {
        self.texts.find_text(text, opts, self.resolution)
    }

    pub fn find_texts(&self, texts: &[String], opts: &ActionOptions) -> Result<Vec<OcrText>> {
        self.texts.find_texts(texts, opts, self.resolution)
    }

    pub fn find_ui(&self, ui_types: &[String], opts: &ActionOptions) -> Result<UiBox> {
        self.icons.find_ui(ui_types, opts, self.resolution)
    }
}

/// Reads the pixel dimensions of an encoded image.
pub fn image_resolution(image: &[u8]) -> Result<Size> {
    let reader = image::ImageReader::new(Cursor::new(image))
        .with_guessed_format()
        .map_err(|e| DriverError::CommandFailed(format!("unreadable screenshot: {e}")))?;
    let (w, h) = reader
        .into_dimensions()
        .map_err(|e| DriverError::CommandFailed(format!("unreadable screenshot: {e}")))?;
    Ok(Size::new(w as f64, h as f64))
}

fn image_mime(image: &[u8]) -> (&'static str, &'static str) {
    match image::guess_format(image) {
        Ok(image::ImageFormat::Jpeg) => ("image/jpeg", "screenshot.jpeg"),
        _ => ("image/png", "screenshot.png"),
    }
}

// ---------------------------------------------------------------------------
// Recognizer seam
// ---------------------------------------------------------------------------

/// Anything that can turn a screenshot into recognition facts.
#[async_trait]
pub trait ImageRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8], opts: &ScreenShotOptions) -> Result<Recognition>;
}

/// HTTP client for the remote recognition service.
pub struct RecognitionClient {
    config: RecognitionConfig,
    http: reqwest::Client,
}

impl RecognitionClient {
    pub fn new(config: RecognitionConfig) -> Result<Self> {
        let http = build_http_client(
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs + 20)),
        )?;
        Ok(Self { config, http })
    }

    /// Builds a client from `UIXT_RECOGNITION_URL` / `UIXT_RECOGNITION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        Self::new(RecognitionConfig::from_env()?)
    }

    pub fn config(&self) -> &RecognitionConfig {
        &self.config
    }

    fn build_form(&self, image: &[u8], opts: &ScreenShotOptions) -> Result<Form> {
        let mut form = Form::new();
        for action in opts.actions() {
            form = form.text("actions", action);
        }
        for ui_type in &opts.with_ui_types {
            form = form.text("uiTypes", ui_type.clone());
        }
        if let Some(cluster) = &opts.ocr_cluster {
            form = form.text("ocrCluster", cluster.clone());
        }
        form = form.text("timeout", self.config.timeout_secs.to_string());

        let (mime, file_name) = image_mime(image);
        let part = Part::bytes(image.to_vec())
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| DriverError::Recognition(e.to_string()))?;
        Ok(form.part("image", part))
    }

    async fn recognize_once(&self, image: &[u8], opts: &ScreenShotOptions) -> Result<Recognition> {
        let form = self.build_form(image, opts)?;
        let mut request = self.http.post(&self.config.url).multipart(form);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DriverError::Recognition(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| DriverError::Recognition(format!("read failed: {e}")))?;
        if status != reqwest::StatusCode::OK {
            return Err(DriverError::Recognition(format!("HTTP {}", status.as_u16())));
        }
        parse_response(&body)
    }
}

#[async_trait]
impl ImageRecognizer for RecognitionClient {
    async fn recognize(&self, image: &[u8], opts: &ScreenShotOptions) -> Result<Recognition> {
        let attempts = self.config.max_attempts.max(1);
        let mut last_err = DriverError::Recognition("no attempt made".into());
        for attempt in 1..=attempts {
            let started = Instant::now();
            match self.recognize_once(image, opts).await {
                Ok(result) => {
                    debug!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        texts = result.texts.len(),
                        icons = result.icons.total(),
                        "recognition completed"
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "recognition attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}
