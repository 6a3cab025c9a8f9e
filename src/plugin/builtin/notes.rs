//! Builtin plugin: short named notes kept in the scoped store.
//!
//! Notes live in the chat scope unless the caller asks for `user` or
//! `global`. Resetting a chat forgets that chat's notes; user and global
//! notes survive.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::plugin::schema::{ConfigField, FieldKind};
use crate::plugin::{
    handler_fn, ConfigSchema, HookContext, InvalidPluginId, MethodCall, MethodDescriptor,
    MethodKind, ParamKind, ParamSpec, Plugin, PluginIdentity, SessionContext,
};
use crate::store::{Scope, ScopeError, ScopeKind};
use crate::wire::Value;

/// Default upper bound on a single note, in bytes.
const DEFAULT_MAX_NOTE_BYTES: i64 = 4096;

pub struct NotesPlugin {
    identity: PluginIdentity,
}

impl NotesPlugin {
    pub fn new() -> Result<Self, InvalidPluginId> {
        Ok(Self {
            identity: super::identity("notes")?,
        })
    }
}

/// Chat and user keys selecting the scope named by the optional `scope`
/// argument. Both `None` is the global scope.
fn scope_keys(call: &MethodCall) -> anyhow::Result<(Option<&str>, Option<&str>)> {
    let kind: ScopeKind = call.opt_str_arg("scope").unwrap_or("chat").parse()?;
    let keys = match kind {
        ScopeKind::Global => (None, None),
        ScopeKind::User => match call.session.user_id.as_deref() {
            Some(user) if !user.is_empty() => (None, Some(user)),
            _ => return Err(ScopeError::MissingScopeId(kind).into()),
        },
        ScopeKind::Chat if call.session.chat_key.is_empty() => {
            return Err(ScopeError::MissingScopeId(kind).into())
        }
        ScopeKind::Chat => (Some(call.session.chat_key.as_str()), None),
    };
    Ok(keys)
}

fn scope_param() -> ParamSpec {
    ParamSpec::optional(
        "scope",
        ParamKind::String,
        "Where the note lives: 'chat' (default), 'user' or 'global'",
    )
}

async fn note_set(call: MethodCall) -> anyhow::Result<Value> {
    let name = call.str_arg("name")?;
    let content = call.str_arg("content")?;

    let limit = call.config_i64("max_note_bytes", DEFAULT_MAX_NOTE_BYTES);
    if content.len() as i64 > limit {
        anyhow::bail!("Note is {} bytes, the limit is {limit}", content.len());
    }

    let (chat, user) = scope_keys(&call)?;
    debug!("Saving note '{name}' (chat {chat:?}, user {user:?})");
    Ok(Value::Bool(call.store.set(chat, user, name, content).await? == 1))
}

async fn note_get(call: MethodCall) -> anyhow::Result<Value> {
    let name = call.str_arg("name")?;
    let (chat, user) = scope_keys(&call)?;
    Ok(call.store.get(chat, user, name).await?.into())
}

async fn note_delete(call: MethodCall) -> anyhow::Result<Value> {
    let name = call.str_arg("name")?;
    let (chat, user) = scope_keys(&call)?;
    Ok(Value::Bool(call.store.delete(chat, user, name).await? == 1))
}

#[async_trait]
impl Plugin for NotesPlugin {
    fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    fn description(&self) -> &str {
        "Keeps short named notes for the current chat, the current user, or everyone."
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new().field(
            ConfigField::new("max_note_bytes", FieldKind::Integer)
                .default_value(DEFAULT_MAX_NOTE_BYTES)
                .label("Maximum note size")
                .description("Largest note accepted, in bytes"),
        )
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::new(
                "note_set",
                MethodKind::Action,
                "Save a note under a name, replacing any previous note with that name.",
                handler_fn(|call| Box::pin(note_set(call))),
            )
            .param(ParamSpec::required("name", ParamKind::String, "Name of the note"))
            .param(ParamSpec::required("content", ParamKind::String, "Text of the note"))
            .param(scope_param()),
            MethodDescriptor::new(
                "note_get",
                MethodKind::Tool,
                "Read a note by name. Returns null when there is no such note.",
                handler_fn(|call| Box::pin(note_get(call))),
            )
            .param(ParamSpec::required("name", ParamKind::String, "Name of the note"))
            .param(scope_param()),
            MethodDescriptor::new(
                "note_delete",
                MethodKind::Action,
                "Delete a note by name. Returns whether a note was removed.",
                handler_fn(|call| Box::pin(note_delete(call))),
            )
            .param(ParamSpec::required("name", ParamKind::String, "Name of the note"))
            .param(scope_param()),
        ]
    }

    async fn on_session_reset(&self, ctx: &HookContext, session: &SessionContext) -> anyhow::Result<()> {
        let scope = Scope::new(ScopeKind::Chat, &session.chat_key)?;
        let removed = ctx.store.clear(&scope).await?;
        info!("Cleared {removed} notes of chat {}", session.chat_key);
        Ok(())
    }
}
