//! The newline-delimited JSON frame grammar spoken on the host <-> sandbox
//! stdio channel. One frame per line, UTF-8, no embedded newlines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Reject any line longer than this many bytes as `protocol_error`.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameError {
    pub code: i64,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Done {
        status: DoneStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Frame {
    pub fn response_ok(id: u64, result: Value) -> Self {
        Frame::Response {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Frame::Response {
            id,
            ok: false,
            result: None,
            error: Some(FrameError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Encodes the frame as a single newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<String, BridgeError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decodes one line (without its trailing newline) into a [`Frame`],
    /// rejecting over-length input per the documented line-length bound.
    pub fn decode_line(line: &str) -> Result<Frame, BridgeError> {
        if line.len() > MAX_FRAME_LEN {
            return Err(BridgeError::ProtocolError(format!(
                "frame exceeds {MAX_FRAME_LEN} byte limit"
            )));
        }
        serde_json::from_str(line)
            .map_err(|source| BridgeError::ProtocolError(format!("malformed frame: {source}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let frame = Frame::Request {
            id: 7,
            method: "call_tool".to_string(),
            params: json!({"server": "stub", "tool": "echo"}),
        };
        let line = frame.encode_line().unwrap();
        assert!(line.ends_with('\n'));
        let decoded = Frame::decode_line(line.trim_end()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn response_ok_and_err_round_trip() {
        let ok = Frame::response_ok(1, json!("hi"));
        let line = ok.encode_line().unwrap();
        assert_eq!(Frame::decode_line(line.trim_end()).unwrap(), ok);

        let err = Frame::response_err(2, -32000, "boom");
        let line = err.encode_line().unwrap();
        assert_eq!(Frame::decode_line(line.trim_end()).unwrap(), err);
    }

    #[test]
    fn done_round_trips_without_error() {
        let done = Frame::Done {
            status: DoneStatus::Ok,
            error: None,
        };
        let line = done.encode_line().unwrap();
        assert_eq!(line.trim_end(), r#"{"kind":"done","status":"ok"}"#);
        assert_eq!(Frame::decode_line(line.trim_end()).unwrap(), done);
    }

    #[test]
    fn over_length_line_is_protocol_error() {
        let huge = "x".repeat(MAX_FRAME_LEN + 1);
        let err = Frame::decode_line(&huge).unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn unrecognized_kind_is_protocol_error() {
        let err = Frame::decode_line(r#"{"kind":"bogus"}"#).unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
    }
}
