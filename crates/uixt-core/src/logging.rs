//! Tracing subscriber setup and payload redaction.
//!
//! Library code only emits `tracing` events; binaries and tests that embed the
//! crate call [`init`] once to install a subscriber. Request and response
//! bodies pass through [`redact_json`] / [`redact_bytes`] before being logged
//! or recorded so that screenshots never end up verbatim in a log file.

use std::path::PathBuf;

use serde_json::Value;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable read for the log filter directive.
pub const LOG_ENV: &str = "UIXT_LOG";

/// Strings longer than this are treated as binary payloads in logs.
pub const REDACT_THRESHOLD: usize = 1024;

/// Subscriber options.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directive used when `UIXT_LOG` is unset (defaults to `info`).
    pub default_filter: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Write to `<dir>/<file_name>` instead of stderr.
    pub file: Option<(PathBuf, String)>,
}

/// Installs the global subscriber.
///
/// Returns the appender guard when logging to a file; it must be held for
/// the lifetime of the program. Fails if a global subscriber is already set.
pub fn init(config: LogConfig) -> Result<Option<WorkerGuard>, String> {
    let default = config.default_filter.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    match config.file {
        Some((dir, name)) => {
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false);
            let result = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            result.map_err(|e| e.to_string())?;
            Ok(Some(guard))
        }
        None => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr);
            let result = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            result.map_err(|e| e.to_string())?;
            Ok(None)
        }
    }
}

/// Placeholder text for a redacted payload of `len` bytes.
pub fn redact_bytes(len: usize) -> String {
    format!("<{len} bytes redacted>")
}

/// Returns a copy of `value` with every oversized string replaced by a
/// redaction marker.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::String(s) if s.len() > REDACT_THRESHOLD => Value::String(redact_bytes(s.len())),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_json(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Renders a raw response body for logging.
///
/// JSON bodies are redacted field-by-field; anything else that is not short
/// UTF-8 text is replaced entirely.
pub fn redact_body(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        return redact_json(&json).to_string();
    }
    match std::str::from_utf8(body) {
        Ok(text) if text.len() <= REDACT_THRESHOLD => text.to_string(),
        _ => redact_bytes(body.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_strings_are_redacted() {
        let shot = "A".repeat(5000);
        let value = json!({"value": shot, "sessionId": "abc"});
        let redacted = redact_json(&value);
        assert_eq!(redacted["value"], "<5000 bytes redacted>");
        assert_eq!(redacted["sessionId"], "abc");
    }

    #[test]
    fn nested_arrays_are_walked() {
        let value = json!({"a": [{"b": "x".repeat(2000)}, 1]});
        assert_eq!(redact_json(&value)["a"][0]["b"], "<2000 bytes redacted>");
        assert_eq!(redact_json(&value)["a"][1], 1);
    }

    #[test]
    fn binary_bodies_are_replaced() {
        let png = [0x89u8, b'P', b'N', b'G', 0xff, 0xfe];
        assert_eq!(redact_body(&png), "<6 bytes redacted>");
        assert_eq!(redact_body(b"OK"), "OK");
    }
}
