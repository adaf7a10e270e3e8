//! Payload helpers shared by the WebDriver-style HTTP backends (UIA2, WDA).
//!
//! Both servers wrap answers in a `{"value": ...}` envelope, hand out a
//! session id at `POST /session`, and accept W3C pointer action chains for
//! gestures. [`PointerActions`] builds those chains.

use base64::Engine;
use serde_json::{json, Value};

use crate::driver::{DriverError, Result};
use crate::geometry::{Point, Size};

/// Unwraps the `value` field of a WebDriver response.
pub fn unwrap_value(response: Value) -> Value {
    match response {
        Value::Object(mut map) if map.contains_key("value") => {
            map.remove("value").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Finds the session id in a `POST /session` answer.
///
/// Servers disagree on placement: top level, inside `value`, or both.
pub fn session_id(response: &Value) -> Option<String> {
    response
        .get("sessionId")
        .or_else(|| response.get("value").and_then(|v| v.get("sessionId")))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Reads `{width, height}` from an unwrapped value.
pub fn parse_size(value: &Value) -> Result<Size> {
    let width = value.get("width").and_then(Value::as_f64);
    let height = value.get("height").and_then(Value::as_f64);
    match (width, height) {
        (Some(w), Some(h)) => Ok(Size::new(w, h)),
        _ => Err(DriverError::JsonParse(format!("expected {{width, height}}, got {value}"))),
    }
}

/// Decodes a base64 screenshot value (whitespace tolerated).
pub fn decode_image(value: &Value) -> Result<Vec<u8>> {
    let encoded = value
        .as_str()
        .ok_or_else(|| DriverError::JsonParse("screenshot value is not a string".into()))?;
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map_err(|e| DriverError::JsonParse(format!("invalid base64 screenshot: {e}")))
}

/// Builder for a single-finger W3C pointer action chain.
#[derive(Debug, Clone, Default)]
pub struct PointerActions {
    steps: Vec<Value>,
}

impl PointerActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn move_to(mut self, point: Point, duration_ms: u64) -> Self {
        self.steps.push(json!({
            "type": "pointerMove",
            "duration": duration_ms,
            "x": point.x.round(),
            "y": point.y.round(),
            "origin": "viewport",
        }));
        self
    }

    pub fn down(mut self) -> Self {
        self.steps.push(json!({ "type": "pointerDown", "button": 0 }));
        self
    }

    pub fn up(mut self) -> Self {
        self.steps.push(json!({ "type": "pointerUp", "button": 0 }));
        self
    }

    pub fn pause(mut self, duration_ms: u64) -> Self {
        self.steps.push(json!({ "type": "pause", "duration": duration_ms }));
        self
    }

    pub fn tap(point: Point) -> Self {
        Self::new().move_to(point, 0).down().pause(50).up()
    }

    pub fn double_tap(point: Point) -> Self {
        Self::new()
            .move_to(point, 0)
            .down()
            .pause(50)
            .up()
            .pause(100)
            .down()
            .pause(50)
            .up()
    }

    pub fn long_press(point: Point, hold_ms: u64) -> Self {
        Self::new().move_to(point, 0).down().pause(hold_ms).up()
    }

    pub fn swipe(from: Point, to: Point, duration_ms: u64) -> Self {
        Self::new()
            .move_to(from, 0)
            .down()
            .pause(50)
            .move_to(to, duration_ms)
            .up()
    }

    /// Wraps the chain into a `POST /actions` body.
    pub fn into_payload(self) -> Value {
        json!({
            "actions": [{
                "type": "pointer",
                "id": "finger1",
                "parameters": { "pointerType": "touch" },
                "actions": self.steps,
            }]
        })
    }
}

/// Builds a `POST /actions` body typing `text` key by key.
pub fn key_actions(text: &str) -> Value {
    let steps: Vec<Value> = text
        .chars()
        .flat_map(|c| {
            let key = c.to_string();
            [
                json!({ "type": "keyDown", "value": key }),
                json!({ "type": "keyUp", "value": key }),
            ]
        })
        .collect();
    json!({
        "actions": [{ "type": "key", "id": "keyboard", "actions": steps }]
    })
}
