//! Cross-cutting options for driver and vision operations.
//!
//! [`ActionOptions`] is the single options record threaded through every
//! contract call. It is assembled once per call, either from the `with_*`
//! builder methods or by deserializing the `options` object of an action
//! descriptor, and is not mutated afterwards.
//!
//! ```
//! use uixt_core::options::{ActionOptions, Direction};
//!
//! let opts = ActionOptions::new()
//!     .with_max_retry_times(5)
//!     .with_interval(0.5)
//!     .with_direction(Direction::Up)
//!     .with_index(-1);
//! assert_eq!(opts.max_retry_times(), 5);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::geometry::{Point, Rect, Size};

const DEFAULT_MAX_RETRY_TIMES: usize = 10;
const DEFAULT_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_SWIPE_DURATION_SECS: f64 = 0.5;
const DEFAULT_PRESS_DURATION_SECS: f64 = 1.0;

/// A named swipe direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// Either a named direction or a custom `[from_x, from_y, to_x, to_y]`
/// relative vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SwipeDirection {
    Named(Direction),
    Custom([f64; 4]),
}

impl SwipeDirection {
    /// Returns the relative `[from_x, from_y, to_x, to_y]` vector.
    ///
    /// Named directions describe finger movement: `Up` drags from the center
    /// towards the top edge, which scrolls content downwards.
    pub fn to_relative(self) -> [f64; 4] {
        match self {
            SwipeDirection::Named(Direction::Up) => [0.5, 0.5, 0.5, 0.1],
            SwipeDirection::Named(Direction::Down) => [0.5, 0.5, 0.5, 0.9],
            SwipeDirection::Named(Direction::Left) => [0.5, 0.5, 0.1, 0.5],
            SwipeDirection::Named(Direction::Right) => [0.5, 0.5, 0.9, 0.5],
            SwipeDirection::Custom(v) => v,
        }
    }
}

impl From<Direction> for SwipeDirection {
    fn from(d: Direction) -> Self {
        SwipeDirection::Named(d)
    }
}

/// Options controlling a screenshot and the recognition passes run on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenShotOptions {
    /// Run OCR on the screenshot.
    pub with_ocr: bool,
    /// Run UI-icon detection for these icon types.
    pub with_ui_types: Vec<String>,
    /// Run popup detection.
    pub with_close_popup: bool,
    /// Run live-stream type classification.
    pub with_live_type: bool,
    /// Run live-stream popularity extraction.
    pub with_live_popularity: bool,
    /// Cluster adjacent OCR boxes on the service side.
    pub ocr_cluster: Option<String>,
}

impl ScreenShotOptions {
    /// Returns the recognition action names to send to the service.
    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions = Vec::new();
        if self.with_ocr {
            actions.push("ocr");
        }
        if !self.with_ui_types.is_empty() {
            actions.push("ui");
        }
        if self.with_close_popup {
            actions.push("close");
        }
        if self.with_live_type {
            actions.push("liveType");
        }
        if self.with_live_popularity {
            actions.push("livePopularity");
        }
        actions
    }

    /// True when at least one recognition pass is requested.
    pub fn needs_recognition(&self) -> bool {
        !self.actions().is_empty()
    }
}

/// The options record shared by all driver operations.
///
/// Every field is optional on the wire; accessors supply the documented
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionOptions {
    /// Caller-supplied identifier echoed into logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retry_times: Option<usize>,
    /// Seconds between retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
    /// Gesture duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Press duration in seconds for touch-and-hold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub press_duration: Option<f64>,
    /// Interpolation steps for drag gestures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<SwipeDirection>,
    /// Relative `[x1, y1, x2, y2]` search scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<[f64; 4]>,
    /// Absolute `[x1, y1, x2, y2]` search scope in pixels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abs_scope: Option<[f64; 4]>,
    pub regex: bool,
    /// Which match to pick; negative values count from the end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
    /// For multi-text lookups: succeed as soon as one text matches.
    pub match_one: bool,
    /// Pixel offset added to tap points.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<[f64; 2]>,
    /// Random extra offset range `[min, max]` applied to both axes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_random_range: Option<[i64; 2]>,
    /// Turn not-found failures into no-ops.
    pub ignore_not_found: bool,
    /// Seconds before giving up on a backend-side wait.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    /// Typing frequency (characters per second) for WDA keyboard input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u32>,
    #[serde(flatten)]
    pub screenshot: ScreenShotOptions,
    /// Backend-specific extension fields.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
}

impl ActionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_max_retry_times(mut self, n: usize) -> Self {
        self.max_retry_times = Some(n);
        self
    }

    pub fn with_interval(mut self, secs: f64) -> Self {
        self.interval = Some(secs);
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self
    }

    pub fn with_press_duration(mut self, secs: f64) -> Self {
        self.press_duration = Some(secs);
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_direction(mut self, direction: impl Into<SwipeDirection>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    pub fn with_custom_direction(mut self, from_x: f64, from_y: f64, to_x: f64, to_y: f64) -> Self {
        self.direction = Some(SwipeDirection::Custom([from_x, from_y, to_x, to_y]));
        self
    }

    pub fn with_scope(mut self, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        self.scope = Some([x1, y1, x2, y2]);
        self
    }

    pub fn with_abs_scope(mut self, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        self.abs_scope = Some([x1, y1, x2, y2]);
        self
    }

    pub fn with_regex(mut self, regex: bool) -> Self {
        self.regex = regex;
        self
    }

    pub fn with_index(mut self, index: i64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_match_one(mut self, match_one: bool) -> Self {
        self.match_one = match_one;
        self
    }

    pub fn with_offset(mut self, dx: f64, dy: f64) -> Self {
        self.offset = Some([dx, dy]);
        self
    }

    pub fn with_offset_random_range(mut self, min: i64, max: i64) -> Self {
        self.offset_random_range = Some([min.min(max), min.max(max)]);
        self
    }

    pub fn with_ignore_not_found(mut self, ignore: bool) -> Self {
        self.ignore_not_found = ignore;
        self
    }

    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn with_screenshot_ocr(mut self) -> Self {
        self.screenshot.with_ocr = true;
        self
    }

    pub fn with_screenshot_ui_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.screenshot.with_ui_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_screenshot_close_popup(mut self) -> Self {
        self.screenshot.with_close_popup = true;
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors with defaults
    // -----------------------------------------------------------------------

    pub fn max_retry_times(&self) -> usize {
        self.max_retry_times.unwrap_or(DEFAULT_MAX_RETRY_TIMES)
    }

    pub fn interval(&self) -> Duration {
        secs_to_duration(self.interval.unwrap_or(DEFAULT_INTERVAL_SECS))
    }

    pub fn swipe_duration(&self) -> Duration {
        secs_to_duration(self.duration.unwrap_or(DEFAULT_SWIPE_DURATION_SECS))
    }

    pub fn press_duration(&self) -> Duration {
        secs_to_duration(
            self.press_duration
                .or(self.duration)
                .unwrap_or(DEFAULT_PRESS_DURATION_SECS),
        )
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(secs_to_duration)
    }

    /// Resolves the configured scope into an absolute rectangle.
    ///
    /// An absolute scope wins over a relative one.
    pub fn scope_rect(&self, resolution: Size) -> Option<Rect> {
        if let Some(abs) = self.abs_scope {
            return Some(Rect::from_corners(abs));
        }
        self.scope.map(|[x1, y1, x2, y2]| {
            Rect::from_corners([
                x1 * resolution.width,
                y1 * resolution.height,
                x2 * resolution.width,
                y2 * resolution.height,
            ])
        })
    }

    /// Applies the fixed offset and, if configured, a random offset to a
    /// tap point. A reversed random range is treated as `[max, min]`.
    pub fn apply_offset(&self, point: Point) -> Point {
        let [dx, dy] = self.offset.unwrap_or([0.0, 0.0]);
        let (rx, ry) = match self.offset_random_range {
            Some([a, b]) if a != b => {
                let (min, max) = (a.min(b), a.max(b));
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(min..=max) as f64,
                    rng.gen_range(min..=max) as f64,
                )
            }
            Some([fixed, _]) => (fixed as f64, fixed as f64),
            None => (0.0, 0.0),
        };
        Point::new(point.x + dx + rx, point.y + dy + ry)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let opts = ActionOptions::new();
        assert_eq!(opts.max_retry_times(), 10);
        assert_eq!(opts.interval(), Duration::from_secs(1));
        assert_eq!(opts.swipe_duration(), Duration::from_millis(500));
        assert!(opts.timeout().is_none());
    }

    #[test]
    fn direction_deserializes_named_and_custom() {
        let named: ActionOptions = serde_json::from_str(r#"{"direction":"up"}"#).unwrap();
        assert_eq!(named.direction, Some(SwipeDirection::Named(Direction::Up)));

        let custom: ActionOptions =
            serde_json::from_str(r#"{"direction":[0.1,0.2,0.3,0.4]}"#).unwrap();
        assert_eq!(
            custom.direction.map(SwipeDirection::to_relative),
            Some([0.1, 0.2, 0.3, 0.4])
        );
    }

    #[test]
    fn screenshot_fields_are_flattened() {
        let opts: ActionOptions = serde_json::from_str(
            r#"{"with_ocr":true,"with_ui_types":["close"],"index":-1,"regex":true}"#,
        )
        .unwrap();
        assert!(opts.screenshot.with_ocr);
        assert_eq!(opts.screenshot.actions(), vec!["ocr", "ui"]);
        assert_eq!(opts.index, Some(-1));
        assert!(opts.regex);
    }

    #[test]
    fn relative_scope_scales_with_resolution() {
        let opts = ActionOptions::new().with_scope(0.0, 0.5, 1.0, 1.0);
        let rect = opts.scope_rect(Size::new(1000.0, 2000.0)).unwrap();
        assert_eq!(rect, Rect::new(0.0, 1000.0, 1000.0, 1000.0));
    }

    #[test]
    fn absolute_scope_wins() {
        let opts = ActionOptions::new()
            .with_scope(0.0, 0.0, 1.0, 1.0)
            .with_abs_scope(10.0, 10.0, 20.0, 20.0);
        let rect = opts.scope_rect(Size::new(1000.0, 2000.0)).unwrap();
        assert_eq!(rect, Rect::new(10.0, 10.0, 10.0, 10.0));
    }

    #[test]
    fn offsets_are_applied() {
        let fixed = ActionOptions::new().with_offset(5.0, -5.0);
        assert_eq!(fixed.apply_offset(Point::new(10.0, 10.0)), Point::new(15.0, 5.0));

        let random = ActionOptions::new().with_offset_random_range(-3, 3);
        for _ in 0..50 {
            let p = random.apply_offset(Point::new(100.0, 100.0));
            assert!((97.0..=103.0).contains(&p.x));
            assert!((97.0..=103.0).contains(&p.y));
        }
    }

    #[test]
    fn reversed_random_range_from_json_still_spreads() {
        let opts: ActionOptions =
            serde_json::from_value(serde_json::json!({ "offset_random_range": [3, -3] })).unwrap();
        let xs: Vec<f64> = (0..200)
            .map(|_| opts.apply_offset(Point::new(100.0, 100.0)).x)
            .collect();
        assert!(xs.iter().all(|x| (97.0..=103.0).contains(x)));
        assert!(xs.iter().any(|&x| x < 100.0));
        assert!(xs.iter().any(|&x| x > 100.0));
    }

    #[test]
    fn custom_fields_survive_roundtrip() {
        let opts = ActionOptions::new().with_custom("wda_bundle", serde_json::json!("com.x"));
        let json = serde_json::to_value(&opts).unwrap();
        assert_eq!(json["custom"]["wda_bundle"], "com.x");
    }
}
