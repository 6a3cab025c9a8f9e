//! Data-only description of a plugin's configuration.
//!
//! Built once at registration and consumed by two parties: the registry,
//! which resolves operator settings against it, and the external UI
//! renderer, which draws a form from [`ConfigSchema::to_ui_descriptor`].

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown config field '{0}'")]
    UnknownField(String),

    #[error("config field '{field}' expects {expected}, got {got}")]
    WrongKind {
        field: String,
        expected: &'static str,
        got: String,
    },

    #[error("config field '{0}' is required")]
    Missing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// A string the UI must mask and never echo back
    Secret,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            FieldKind::String | FieldKind::Secret => "a string",
            FieldKind::Integer => "an integer",
            FieldKind::Number => "a number",
            FieldKind::Boolean => "a boolean",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String | FieldKind::Secret => value.is_string(),
            FieldKind::Integer => value.is_i64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigField {
    pub name: String,
    pub kind: FieldKind,
    /// `None` makes the field required
    pub default: Option<Value>,
    pub label: String,
    pub description: String,
}

impl ConfigField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            kind,
            default: None,
            description: String::new(),
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: ConfigField) -> Self {
        self.fields.push(field);
        self
    }

    /// Merges operator settings over the declared defaults.
    pub fn resolve(&self, settings: &Map<String, Value>) -> Result<Map<String, Value>, SchemaError> {
        if let Some(unknown) = settings
            .keys()
            .find(|k| !self.fields.iter().any(|f| &f.name == *k))
        {
            return Err(SchemaError::UnknownField(unknown.clone()));
        }

        let mut resolved = Map::new();
        for field in &self.fields {
            let value = match settings.get(&field.name).or(field.default.as_ref()) {
                Some(v) => v,
                None => return Err(SchemaError::Missing(field.name.clone())),
            };
            if !field.kind.accepts(value) {
                return Err(SchemaError::WrongKind {
                    field: field.name.clone(),
                    expected: field.kind.name(),
                    got: value.to_string(),
                });
            }
            resolved.insert(field.name.clone(), value.clone());
        }
        Ok(resolved)
    }

    /// Form descriptor for the UI renderer. Secret defaults are withheld.
    pub fn to_ui_descriptor(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|f| {
                let default = match f.kind {
                    FieldKind::Secret => Value::Null,
                    _ => f.default.clone().unwrap_or(Value::Null),
                };
                json!({
                    "name": f.name,
                    "kind": f.kind,
                    "label": f.label,
                    "description": f.description,
                    "default": default,
                    "required": f.default.is_none(),
                })
            })
            .collect();
        json!({ "fields": fields })
    }
}
