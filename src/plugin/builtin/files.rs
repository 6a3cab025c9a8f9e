//! Builtin plugin: text file access inside the session's mounted areas.
//!
//! Every path parameter is declared as a path, so the bridge has already
//! mapped it to the host by the time a handler runs. Paths handed back are
//! returned as host paths too and mapped into the sandbox on the way out.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::plugin::schema::{ConfigField, FieldKind};
use crate::plugin::{
    handler_fn, ConfigSchema, InvalidPluginId, MethodCall, MethodDescriptor, MethodKind, ParamKind,
    ParamSpec, Plugin, PluginIdentity,
};
use crate::wire::Value;

/// Default cap on how much of a file `read_text` returns.
const DEFAULT_MAX_READ_BYTES: i64 = 64 * 1024;

pub struct FilesPlugin {
    identity: PluginIdentity,
}

impl FilesPlugin {
    pub fn new() -> Result<Self, InvalidPluginId> {
        Ok(Self {
            identity: super::identity("files")?,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn file_info(call: MethodCall) -> anyhow::Result<Value> {
    let path = call.path_arg("path")?;
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot stat {}", file_name(path)))?;

    Ok(Value::map([
        ("name", Value::Str(file_name(path))),
        ("size", Value::Int(meta.len() as i64)),
        ("is_dir", Value::Bool(meta.is_dir())),
        ("path", Value::Path(path.to_path_buf())),
    ]))
}

async fn write_text(call: MethodCall) -> anyhow::Result<Value> {
    let path = call.path_arg("path")?;
    let content = call.str_arg("content")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content.as_bytes())
        .await
        .with_context(|| format!("Cannot write {}", file_name(path)))?;

    debug!("Wrote {} bytes to {}", content.len(), path.display());
    Ok(Value::Path(path.to_path_buf()))
}

async fn read_text(call: MethodCall) -> anyhow::Result<Value> {
    let path = call.path_arg("path")?;
    let limit = call.config_i64("max_read_bytes", DEFAULT_MAX_READ_BYTES).max(0) as u64;

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", file_name(path)))?;
    let mut bytes = Vec::new();
    file.take(limit).read_to_end(&mut bytes).await?;

    // A cut may land inside a multi-byte character.
    Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
}

#[async_trait]
impl Plugin for FilesPlugin {
    fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    fn description(&self) -> &str {
        "Reads and writes text files in the chat's uploads and the sandbox's shared area."
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new().field(
            ConfigField::new("max_read_bytes", FieldKind::Integer)
                .default_value(DEFAULT_MAX_READ_BYTES)
                .label("Read limit")
                .description("Largest number of bytes read_text returns"),
        )
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::new(
                "file_info",
                MethodKind::Tool,
                "Describe a file: its name, size, and sandbox path.",
                handler_fn(|call| Box::pin(file_info(call))),
            )
            .param(ParamSpec::required("path", ParamKind::Path, "File to describe")),
            MethodDescriptor::new(
                "write_text",
                MethodKind::Action,
                "Write text to a file, creating parent directories. Returns the file's path.",
                handler_fn(|call| Box::pin(write_text(call))),
            )
            .param(ParamSpec::required("path", ParamKind::Path, "Destination file"))
            .param(ParamSpec::required("content", ParamKind::String, "Text to write")),
            MethodDescriptor::new(
                "read_text",
                MethodKind::Tool,
                "Read a text file, up to the configured size limit.",
                handler_fn(|call| Box::pin(read_text(call))),
            )
            .param(ParamSpec::required("path", ParamKind::Path, "File to read")),
        ]
    }
}
