//! Frames exchanged with the sandbox, one JSON object per line.
//!
//! Requests:
//!   {"op":"dispatch","id":"1","plugin":"notes","method":"note_get",
//!    "context":{"chat_key":"chat_7"},"args":{"name":"shopping"}}
//!   {"op":"reset_session","id":"2","plugin":"notes","context":{"chat_key":"chat_7"}}
//!   {"op":"status","id":"3"}                     (optionally with "plugin")
//!
//! Operator frames: `catalog`, `load`, `unload`, `retry`,
//! `update_config` (with `settings`) and `describe_config`.
//!
//! Responses:
//!   {"id":"1","status":"success","result":"milk,eggs"}
//!   {"id":"2","status":"error","kind":"service_unavailable","message":"...","retryable":true}

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::bridge::{BridgeError, ErrorKind};
use crate::plugin::SessionContext;
use crate::wire::WireForm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Op {
    Dispatch,
    ResetSession,
    Status,
    Catalog,
    Load,
    Unload,
    Retry,
    UpdateConfig,
    DescribeConfig,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Dispatch => "dispatch",
            Op::ResetSession => "reset_session",
            Op::Status => "status",
            Op::Catalog => "catalog",
            Op::Load => "load",
            Op::Unload => "unload",
            Op::Retry => "retry",
            Op::UpdateConfig => "update_config",
            Op::DescribeConfig => "describe_config",
        }
    }
}

/// Request line as it arrives. `args` stays raw text, so a dispatch
/// payload is never built into a tree here.
#[derive(Deserialize)]
struct RawFrame<'a> {
    op: Op,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    plugin: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    context: Option<SessionContext>,
    #[serde(default, borrow)]
    args: Option<&'a RawValue>,
    #[serde(default)]
    settings: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct IdOnly {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("invalid frame: '{op}' needs a '{field}' field")]
    MissingField { op: &'static str, field: &'static str },
}

#[derive(Debug)]
pub enum Request {
    Dispatch {
        plugin: String,
        method: String,
        context: SessionContext,
        /// Absent or null args are an empty map.
        args: WireForm,
    },
    ResetSession {
        plugin: String,
        context: SessionContext,
    },
    /// Every plugin, or only the named one.
    Status {
        plugin: Option<String>,
    },
    Catalog,
    Load {
        plugin: String,
    },
    Unload {
        plugin: String,
    },
    Retry {
        plugin: String,
    },
    UpdateConfig {
        plugin: String,
        settings: serde_json::Map<String, serde_json::Value>,
    },
    DescribeConfig {
        plugin: String,
    },
}

/// One parsed request line.
#[derive(Debug)]
pub struct Frame {
    pub id: Option<String>,
    pub request: Request,
}

impl Frame {
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let raw: RawFrame<'_> = serde_json::from_str(line)?;
        let op = raw.op;
        let request = match op {
            Op::Dispatch => Request::Dispatch {
                plugin: required(op, "plugin", raw.plugin)?,
                method: required(op, "method", raw.method)?,
                context: raw.context.unwrap_or_default(),
                args: raw
                    .args
                    .map_or_else(|| WireForm::new("{}"), |args| WireForm::new(args.get())),
            },
            Op::ResetSession => Request::ResetSession {
                plugin: required(op, "plugin", raw.plugin)?,
                context: required(op, "context", raw.context)?,
            },
            Op::Status => Request::Status { plugin: raw.plugin },
            Op::Catalog => Request::Catalog,
            Op::Load => Request::Load {
                plugin: required(op, "plugin", raw.plugin)?,
            },
            Op::Unload => Request::Unload {
                plugin: required(op, "plugin", raw.plugin)?,
            },
            Op::Retry => Request::Retry {
                plugin: required(op, "plugin", raw.plugin)?,
            },
            Op::UpdateConfig => Request::UpdateConfig {
                plugin: required(op, "plugin", raw.plugin)?,
                settings: required(op, "settings", raw.settings)?,
            },
            Op::DescribeConfig => Request::DescribeConfig {
                plugin: required(op, "plugin", raw.plugin)?,
            },
        };
        Ok(Self { id: raw.id, request })
    }

    /// The caller's id from a line that did not parse as a request.
    pub fn salvage_id(line: &str) -> Option<String> {
        serde_json::from_str::<IdOnly>(line).ok().and_then(|f| f.id)
    }
}

fn required<T>(op: Op, field: &'static str, value: Option<T>) -> Result<T, FrameError> {
    value.ok_or(FrameError::MissingField {
        op: op.as_str(),
        field,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set when the same request may succeed later
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl Response {
    pub fn success(id: String, result: Box<RawValue>) -> Self {
        Self {
            id,
            status: Status::Success,
            result: Some(result),
            kind: None,
            message: None,
            retryable: false,
        }
    }

    /// Success carrying an already encoded result.
    pub fn success_wire(id: String, wire: WireForm) -> Self {
        match RawValue::from_string(wire.into_string()) {
            Ok(raw) => Self::success(id, raw),
            Err(e) => Self::error(id, ErrorKind::Serialization, format!("unencodable result: {e}")),
        }
    }

    /// Success with a `null` result.
    pub fn ok(id: String) -> Self {
        Self::success_wire(id, WireForm::new("null"))
    }

    pub fn error(id: String, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            result: None,
            kind: Some(kind),
            message: Some(message.into()),
            retryable: kind.is_retryable(),
        }
    }

    pub fn from_error(id: String, err: &BridgeError) -> Self {
        Self::error(id, err.kind(), err.to_string())
    }

    /// Success with any serializable result.
    pub fn json<T: Serialize>(id: String, result: &T) -> Self {
        match serde_json::value::to_raw_value(result) {
            Ok(raw) => Self::success(id, raw),
            Err(e) => Self::error(id, ErrorKind::Serialization, e.to_string()),
        }
    }

    pub fn from_result<T: Serialize>(id: String, result: Result<T, BridgeError>) -> Self {
        match result {
            Ok(value) => Self::json(id, &value),
            Err(e) => Self::from_error(id, &e),
        }
    }

    /// Serialized frame, newline included.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"id":{},"status":"error","kind":"serialization","message":{}}}"#,
                serde_json::Value::String(self.id.clone()),
                serde_json::Value::String(e.to_string())
            )
        });
        line.push('\n');
        line
    }
}
