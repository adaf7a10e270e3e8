//! Newline-delimited JSON protocol spoken by the in-app stub hook.
//!
//! Each request is one line:
//!
//! ```text
//! {"Seq": 7, "Cmd": "login", "Phone": "...", "Captcha": "..."}\n
//! ```
//!
//! and each response is one line:
//!
//! ```text
//! {"Seq": 7, "Result": {...}, "Error": null}\n
//! ```
//!
//! `Seq` increases monotonically per connection. The hook may omit `Seq` in
//! responses; when present it must match the request.
//!
//! # Example
//!
//! ```
//! use uixt_core::stub_protocol::{StubCommand, encode_request, decode_request};
//!
//! let wire = encode_request(3, &StubCommand::Ping).unwrap();
//! let frame = decode_request(&wire).unwrap();
//! assert_eq!(frame.seq, 3);
//! assert_eq!(frame.command, StubCommand::Ping);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// The line is not a valid frame.
    #[error("invalid frame: {0}")]
    Decode(String),

    /// The hook answered a different request.
    #[error("sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },

    #[error("empty frame")]
    Empty,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands understood by the hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Cmd")]
pub enum StubCommand {
    /// Liveness probe.
    #[serde(rename = "ping")]
    Ping,

    /// Dumps the in-app view hierarchy.
    #[serde(rename = "dumpView")]
    DumpView {
        #[serde(rename = "Format", skip_serializing_if = "Option::is_none", default)]
        format: Option<String>,
    },

    #[serde(rename = "login")]
    Login {
        #[serde(rename = "Phone", skip_serializing_if = "Option::is_none", default)]
        phone: Option<String>,
        #[serde(rename = "Captcha", skip_serializing_if = "Option::is_none", default)]
        captcha: Option<String>,
        #[serde(rename = "Password", skip_serializing_if = "Option::is_none", default)]
        password: Option<String>,
    },

    #[serde(rename = "logout")]
    Logout,

    #[serde(rename = "isLogin")]
    IsLogin,

    /// Invokes a static method inside the app.
    #[serde(rename = "invokeStatic")]
    InvokeStatic {
        #[serde(rename = "Class")]
        class: String,
        #[serde(rename = "Method")]
        method: String,
        #[serde(rename = "Args", default)]
        args: Vec<Value>,
    },
}

impl StubCommand {
    /// Wire name of the command, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            StubCommand::Ping => "ping",
            StubCommand::DumpView { .. } => "dumpView",
            StubCommand::Login { .. } => "login",
            StubCommand::Logout => "logout",
            StubCommand::IsLogin => "isLogin",
            StubCommand::InvokeStatic { .. } => "invokeStatic",
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(flatten)]
    pub command: StubCommand,
}

/// A response line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "Seq", default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "Result", default)]
    pub result: Value,
    #[serde(rename = "Error", default)]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok(seq: u64, result: Value) -> Self {
        Self {
            seq: Some(seq),
            result,
            error: None,
        }
    }

    pub fn err(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq: Some(seq),
            result: Value::Null,
            error: Some(message.into()),
        }
    }

    /// Converts the frame into the call outcome. An empty error string counts
    /// as success.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(message) if !message.is_empty() => Err(message),
            _ => Ok(self.result),
        }
    }
}

fn to_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut line = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

fn from_line<'a, T: Deserialize<'a>>(line: &'a [u8]) -> Result<T, ProtocolError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    serde_json::from_slice(trimmed).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Encodes a request as one newline-terminated line.
pub fn encode_request(seq: u64, command: &StubCommand) -> Result<Vec<u8>, ProtocolError> {
    to_line(&RequestFrame {
        seq,
        command: command.clone(),
    })
}

pub fn decode_request(line: &[u8]) -> Result<RequestFrame, ProtocolError> {
    from_line(line)
}

pub fn encode_response(response: &ResponseFrame) -> Result<Vec<u8>, ProtocolError> {
    to_line(response)
}

/// Decodes a response line and checks its sequence number against `expected`.
pub fn decode_response(line: &[u8], expected: u64) -> Result<ResponseFrame, ProtocolError> {
    let frame: ResponseFrame = from_line(line)?;
    match frame.seq {
        Some(got) if got != expected => Err(ProtocolError::SequenceMismatch { expected, got }),
        _ => Ok(frame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let wire = encode_request(
            5,
            &StubCommand::Login {
                phone: Some("13800000000".into()),
                captcha: Some("1234".into()),
                password: None,
            },
        )
        .unwrap();
        assert_eq!(*wire.last().unwrap(), b'\n');
        let value: Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(
            value,
            json!({"Seq": 5, "Cmd": "login", "Phone": "13800000000", "Captcha": "1234"})
        );
    }

    #[test]
    fn unit_command_has_only_seq_and_cmd() {
        let value: Value = serde_json::from_slice(&encode_request(1, &StubCommand::Logout).unwrap()).unwrap();
        assert_eq!(value, json!({"Seq": 1, "Cmd": "logout"}));
    }

    #[test]
    fn invoke_static_decodes_back() {
        let line = br#"{"Seq":9,"Cmd":"invokeStatic","Class":"Util","Method":"reset","Args":[1,"a"]}"#;
        let frame = decode_request(line).unwrap();
        assert_eq!(frame.seq, 9);
        assert_eq!(
            frame.command,
            StubCommand::InvokeStatic {
                class: "Util".into(),
                method: "reset".into(),
                args: vec![json!(1), json!("a")],
            }
        );
    }

    #[test]
    fn response_error_and_result() {
        let ok = decode_response(br#"{"Seq":2,"Result":{"isLogin":true},"Error":null}"#, 2).unwrap();
        assert_eq!(ok.into_result().unwrap()["isLogin"], true);

        let empty_error = decode_response(br#"{"Result":"x","Error":""}"#, 4).unwrap();
        assert_eq!(empty_error.into_result().unwrap(), json!("x"));

        let err = decode_response(br#"{"Seq":3,"Result":null,"Error":"not logged in"}"#, 3).unwrap();
        assert_eq!(err.into_result().unwrap_err(), "not logged in");
    }

    #[test]
    fn response_sequence_is_checked() {
        let err = decode_response(br#"{"Seq":2,"Result":null}"#, 3).unwrap_err();
        assert_eq!(err, ProtocolError::SequenceMismatch { expected: 3, got: 2 });
    }

    #[test]
    fn malformed_and_empty_lines() {
        assert_eq!(decode_response(b"  \n", 1).unwrap_err(), ProtocolError::Empty);
        assert!(matches!(
            decode_response(b"{not json", 1).unwrap_err(),
            ProtocolError::Decode(_)
        ));
        assert!(matches!(
            decode_request(br#"{"Seq":1,"Cmd":"unknown"}"#).unwrap_err(),
            ProtocolError::Decode(_)
        ));
    }
}
