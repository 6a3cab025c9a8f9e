//! Values crossing the sandbox/host boundary and their wire form.
//!
//! The wire form is compact JSON with sorted object keys, so equal values
//! always encode to identical bytes. Only plain data is accepted: host
//! paths must be translated back to sandbox paths first, and live resource
//! handles are never encodable.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde_json::Number;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::config::BridgeConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SerializationError {
    #[error("live {0} handles cannot cross the sandbox boundary")]
    LiveResource(ResourceKind),

    #[error("host path '{0}' must be translated before it is returned")]
    UntranslatedPath(String),

    #[error("result path cannot be returned to the sandbox: {0}")]
    UnreturnablePath(String),

    #[error("payload is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("payload nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("number {0} is not representable")]
    UnsupportedNumber(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Kinds of live handle a plugin might try to hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Socket,
    Connection,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::File => "file",
            ResourceKind::Socket => "socket",
            ResourceKind::Connection => "connection",
        })
    }
}

/// A host-side value passed to or returned from a plugin method.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A host filesystem path. Translated to its sandbox form by the
    /// bridge before encoding.
    Path(PathBuf),
    /// A live handle (open file, socket, connection). Never encodable.
    Resource(ResourceKind),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&std::path::Path> {
        match self {
            Value::Path(p) => Some(p),
            _ => None,
        }
    }

    /// Short kind name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Path(_) => "path",
            Value::Resource(_) => "resource",
        }
    }

    /// Builds a map value from `(key, value)` pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Encoded payload as it travels across the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireForm(String);

impl WireForm {
    pub fn new(json: impl Into<String>) -> Self {
        Self(json.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Hex SHA-1 of the wire bytes. Stable because encoding is canonical.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha1::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for WireForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates and converts values crossing the boundary.
#[derive(Debug, Clone)]
pub struct SerializationGuard {
    max_bytes: usize,
    max_depth: usize,
}

impl SerializationGuard {
    pub fn new(max_bytes: usize, max_depth: usize) -> Self {
        Self { max_bytes, max_depth }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.max_payload_bytes, config.max_depth)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn encode(&self, value: &Value) -> Result<WireForm, SerializationError> {
        let json = self.to_json(value, 0)?;
        let text = serde_json::to_string(&json)
            .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        self.check_size(text.len())?;
        Ok(WireForm(text))
    }

    pub fn decode(&self, wire: &WireForm) -> Result<Value, SerializationError> {
        self.check_size(wire.len())?;
        let json: serde_json::Value = serde_json::from_str(wire.as_str())
            .map_err(|e| SerializationError::Malformed(e.to_string()))?;
        self.from_json(json, 0)
    }

    fn check_size(&self, size: usize) -> Result<(), SerializationError> {
        if size > self.max_bytes {
            return Err(SerializationError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    fn check_depth(&self, depth: usize) -> Result<(), SerializationError> {
        if depth > self.max_depth {
            return Err(SerializationError::TooDeep(self.max_depth));
        }
        Ok(())
    }

    fn to_json(&self, value: &Value, depth: usize) -> Result<serde_json::Value, SerializationError> {
        self.check_depth(depth)?;
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            // -0.0 == 0.0, so both must encode the same way
            Value::Float(f) => Number::from_f64(if *f == 0.0 { 0.0 } else { *f })
                .map(serde_json::Value::Number)
                .ok_or_else(|| SerializationError::UnsupportedNumber(f.to_string()))?,
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| self.to_json(v, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.to_json(v, depth + 1)?)))
                    .collect::<Result<_, SerializationError>>()?,
            ),
            Value::Path(p) => {
                return Err(SerializationError::UntranslatedPath(p.display().to_string()))
            }
            Value::Resource(kind) => return Err(SerializationError::LiveResource(*kind)),
        })
    }

    fn from_json(&self, json: serde_json::Value, depth: usize) -> Result<Value, SerializationError> {
        self.check_depth(depth)?;
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_u64() {
                    return Err(SerializationError::UnsupportedNumber(n.to_string()));
                } else {
                    n.as_f64()
                        .map(Value::Float)
                        .ok_or_else(|| SerializationError::UnsupportedNumber(n.to_string()))?
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.from_json(v, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.from_json(v, depth + 1)?)))
                    .collect::<Result<_, SerializationError>>()?,
            ),
        })
    }
}
