//! Sandbox boundary over a line-oriented byte stream.
//!
//! The sandbox writes one request frame per line; each frame is handled on
//! its own task so a slow method never holds up the others. Responses go
//! through a single writer task and may come back out of order, matched
//! to their request by `id`.

pub mod protocol;

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::bridge::{ErrorKind, ExecutionBridge, Invocation};

use protocol::{Frame, Request, Response};

/// Room for the frame fields around a payload of the maximum size
const FRAME_OVERHEAD: usize = 64 * 1024;

pub struct SandboxServer {
    bridge: Arc<ExecutionBridge>,
}

impl SandboxServer {
    pub fn new(bridge: Arc<ExecutionBridge>) -> Self {
        Self { bridge }
    }

    /// Serves frames until the reader hits EOF or `shutdown` resolves,
    /// then waits for in-flight frames and flushes their responses.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: W,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Response>(100);

        let write_handle = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = rx.recv().await {
                let line = response.to_line();
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!("Write error: {e}");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!("Flush error: {e}");
                    break;
                }
                debug!("Sent: {}", line.trim_end());
            }
        });

        let max_line = self.bridge.guard().max_bytes().saturating_add(FRAME_OVERHEAD);
        let mut lines = LineReader::new(reader, max_line);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(Line::Text(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let bridge = self.bridge.clone();
                        let tx = tx.clone();
                        tasks.spawn(async move {
                            let response = handle_frame(&bridge, &line).await;
                            let _ = tx.send(response).await;
                        });
                    }
                    Ok(Some(Line::TooLong(size))) => {
                        warn!("Dropped a {size} byte frame, limit is {max_line}");
                        let response = Response::error(
                            new_id(),
                            ErrorKind::Serialization,
                            format!("frame is {size} bytes, limit is {max_line}"),
                        );
                        let _ = tx.send(response).await;
                    }
                    Ok(Some(Line::NotUtf8)) => {
                        warn!("Dropped a frame that is not UTF-8");
                        let response =
                            Response::error(new_id(), ErrorKind::Serialization, "frame is not valid UTF-8");
                        let _ = tx.send(response).await;
                    }
                    Ok(None) => {
                        info!("Sandbox closed the stream");
                        break;
                    }
                    Err(e) => {
                        error!("Read error: {e}");
                        break;
                    }
                },
                Some(done) = tasks.join_next(), if !tasks.is_empty() => log_join(done),
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight frames", tasks.len());
        }
        while let Some(done) = tasks.join_next().await {
            log_join(done);
        }

        drop(tx);
        write_handle.await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum Line {
    Text(String),
    /// Dropped without being buffered; carries its length
    TooLong(usize),
    NotUtf8,
}

/// Newline-delimited reader that never holds more than `max_len` bytes of
/// one line. Longer lines are skipped up to their newline.
///
/// `next_line` is cancel safe: all state lives in the struct and is only
/// changed between awaits.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
    /// Bytes skipped so far of an over-long line
    skipped: Option<usize>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            max_len,
            skipped: None,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<Line>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                // EOF; a last line may lack its newline
                if let Some(size) = self.skipped.take() {
                    return Ok(Some(Line::TooLong(size)));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            match self.skipped {
                Some(ref mut size) => *size += chunk.len(),
                None if self.buf.len() + chunk.len() > self.max_len => {
                    self.skipped = Some(self.buf.len() + chunk.len());
                    self.buf = Vec::new();
                }
                None => self.buf.extend_from_slice(chunk),
            }
            let used = chunk.len() + usize::from(newline.is_some());
            self.reader.consume(used);

            if newline.is_some() {
                if let Some(size) = self.skipped.take() {
                    return Ok(Some(Line::TooLong(size)));
                }
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> Line {
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        match String::from_utf8(bytes) {
            Ok(line) => Line::Text(line),
            Err(_) => Line::NotUtf8,
        }
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("Frame task failed: {e}");
    }
}

/// Turns one request line into its response. Never fails: malformed
/// input becomes a `serialization` error response.
pub async fn handle_frame(bridge: &ExecutionBridge, line: &str) -> Response {
    let Frame { id, request } = match Frame::parse(line) {
        Ok(frame) => frame,
        Err(e) => {
            // Echo the caller's id even when the rest of the frame is unusable.
            let id = Frame::salvage_id(line).unwrap_or_else(new_id);
            warn!("Rejected frame {id}: {e}");
            return Response::error(id, ErrorKind::Serialization, e.to_string());
        }
    };
    let id = id.unwrap_or_else(new_id);

    match request {
        Request::Dispatch {
            plugin,
            method,
            context,
            args,
        } => {
            let invocation =
                Invocation::new(plugin, method, context, args).with_correlation_id(id.clone());
            match bridge.invoke(invocation).await {
                Ok(result) => Response::success_wire(id, result),
                Err(e) => Response::from_error(id, &e),
            }
        }
        Request::ResetSession { plugin, context } => match bridge.reset_session(&plugin, &context).await {
            Ok(()) => Response::ok(id),
            Err(e) => Response::from_error(id, &e),
        },
        Request::Status { plugin: None } => Response::json(id, &bridge.status()),
        Request::Status { plugin: Some(plugin) } => Response::from_result(id, bridge.plugin_status(&plugin)),
        Request::Catalog => Response::json(id, &bridge.catalog()),
        Request::Load { plugin } => Response::from_result(id, bridge.load(&plugin).await),
        Request::Unload { plugin } => Response::from_result(id, bridge.unload(&plugin).await),
        Request::Retry { plugin } => Response::from_result(id, bridge.retry(&plugin).await),
        Request::UpdateConfig { plugin, settings } => match bridge.update_config(&plugin, &settings) {
            Ok(()) => Response::ok(id),
            Err(e) => Response::from_error(id, &e),
        },
        Request::DescribeConfig { plugin } => Response::from_result(id, bridge.describe_config(&plugin)),
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::{json, Value};
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::config::BridgeConfig;
    use crate::lifecycle::LifecycleSupervisor;
    use crate::paths::PathTranslator;
    use crate::plugin::builtin::NotesPlugin;
    use crate::plugin::PluginRegistry;
    use crate::store::MemoryStore;
    use crate::wire::SerializationGuard;

    async fn bridge() -> Arc<ExecutionBridge> {
        bridge_with_payload_limit(BridgeConfig::default().max_payload_bytes).await
    }

    async fn bridge_with_payload_limit(max_payload_bytes: usize) -> Arc<ExecutionBridge> {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(Arc::new(NotesPlugin::new().unwrap()), &serde_json::Map::new())
            .unwrap();
        let supervisor = Arc::new(LifecycleSupervisor::new(
            registry,
            Arc::new(MemoryStore::new()),
            RetryPolicy::once(),
        ));
        supervisor.load("notes").await.unwrap();

        let config = BridgeConfig {
            uploads_root: PathBuf::from("/srv/uploads"),
            sandboxes_root: PathBuf::from("/srv/sandboxes"),
            max_payload_bytes,
            ..BridgeConfig::default()
        };
        Arc::new(ExecutionBridge::new(
            supervisor,
            PathTranslator::new(&config),
            SerializationGuard::from_config(&config),
        ))
    }

    async fn frame(bridge: &ExecutionBridge, line: &str) -> Value {
        serde_json::from_str(&handle_frame(bridge, line).await.to_line()).unwrap()
    }

    /// Runs a whole session and returns the responses keyed by id.
    async fn session(bridge: Arc<ExecutionBridge>, input: &str) -> Vec<Value> {
        let (writer, mut output) = tokio::io::duplex(1024 * 1024);
        let server = SandboxServer::new(bridge);
        server
            .serve(input.as_bytes(), writer, std::future::pending())
            .await
            .unwrap();

        let mut text = String::new();
        output.read_to_string(&mut text).await.unwrap();
        let mut responses: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        responses.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        responses
    }

    #[tokio::test]
    async fn test_dispatch_frame() {
        let bridge = bridge().await;
        let set = frame(
            &bridge,
            r#"{"op":"dispatch","id":"1","plugin":"notes","method":"note_set",
               "context":{"chat_key":"chat_7"},"args":{"name":"shopping","content":"milk,eggs"}}"#,
        )
        .await;
        assert_eq!(set, json!({"id": "1", "status": "success", "result": true}));

        let get = frame(
            &bridge,
            r#"{"op":"dispatch","id":"2","plugin":"notes","method":"note_get",
               "context":{"chat_key":"chat_7"},"args":{"name":"shopping"}}"#,
        )
        .await;
        assert_eq!(get["result"], "milk,eggs");
    }

    #[tokio::test]
    async fn test_error_frame_carries_kind() {
        let bridge = bridge().await;
        let resp = frame(
            &bridge,
            r#"{"op":"dispatch","id":"e","plugin":"ghost","method":"m","context":{"chat_key":"c"}}"#,
        )
        .await;
        assert_eq!(resp["status"], "error");
        assert_eq!(resp["kind"], "plugin_not_found");
        assert_eq!(resp["id"], "e");
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        let bridge = bridge().await;

        let garbage = frame(&bridge, "not json at all").await;
        assert_eq!(garbage["kind"], "serialization");
        assert!(!garbage["id"].as_str().unwrap().is_empty());

        let bad_op = frame(&bridge, r#"{"op":"explode","id":"x"}"#).await;
        assert_eq!(bad_op["kind"], "serialization");
        assert_eq!(bad_op["id"], "x");
    }

    #[tokio::test]
    async fn test_generated_id_when_absent() {
        let bridge = bridge().await;
        let resp = frame(&bridge, r#"{"op":"status"}"#).await;
        assert_eq!(uuid::Uuid::parse_str(resp["id"].as_str().unwrap()).unwrap().get_version_num(), 4);
        assert_eq!(resp["result"][0]["id"], "notes");
        assert_eq!(resp["result"][0]["state"], "ACTIVE");
    }

    #[tokio::test]
    async fn test_reset_session_frame() {
        let bridge = bridge().await;
        frame(
            &bridge,
            r#"{"op":"dispatch","plugin":"notes","method":"note_set",
               "context":{"chat_key":"c1"},"args":{"name":"n","content":"v"}}"#,
        )
        .await;

        let reset = frame(
            &bridge,
            r#"{"op":"reset_session","id":"r","plugin":"notes","context":{"chat_key":"c1"}}"#,
        )
        .await;
        assert_eq!(reset, json!({"id": "r", "status": "success", "result": null}));

        let get = frame(
            &bridge,
            r#"{"op":"dispatch","plugin":"notes","method":"note_get",
               "context":{"chat_key":"c1"},"args":{"name":"n"}}"#,
        )
        .await;
        assert_eq!(get["result"], Value::Null);
    }

    #[tokio::test]
    async fn test_operator_frames() {
        let bridge = bridge().await;

        let catalog = frame(&bridge, r#"{"op":"catalog","id":"c"}"#).await;
        assert_eq!(catalog["result"].as_array().unwrap().len(), 3);

        let unload = frame(&bridge, r#"{"op":"unload","id":"u","plugin":"notes"}"#).await;
        assert_eq!(unload["result"], "unloaded");
        let again = frame(&bridge, r#"{"op":"unload","id":"u2","plugin":"notes"}"#).await;
        assert_eq!(again["result"], "no_op");

        let load = frame(&bridge, r#"{"op":"load","id":"l","plugin":"notes"}"#).await;
        assert_eq!(load["result"], "ACTIVE");

        let retry = frame(&bridge, r#"{"op":"retry","id":"r","plugin":"notes"}"#).await;
        assert_eq!(retry["kind"], "service_unavailable");

        let update = frame(
            &bridge,
            r#"{"op":"update_config","id":"cfg","plugin":"notes","settings":{"max_note_bytes":3}}"#,
        )
        .await;
        assert_eq!(update["status"], "success");
        let too_big = frame(
            &bridge,
            r#"{"op":"dispatch","plugin":"notes","method":"note_set",
               "context":{"chat_key":"c"},"args":{"name":"n","content":"four"}}"#,
        )
        .await;
        assert_eq!(too_big["kind"], "method_execution");

        let bad = frame(
            &bridge,
            r#"{"op":"update_config","plugin":"notes","settings":{"nope":1}}"#,
        )
        .await;
        assert_eq!(bad["kind"], "invalid_arguments");

        let one = frame(&bridge, r#"{"op":"status","id":"s","plugin":"notes"}"#).await;
        assert_eq!(one["result"]["state"], "ACTIVE");
        let ghost = frame(&bridge, r#"{"op":"status","plugin":"ghost"}"#).await;
        assert_eq!(ghost["kind"], "plugin_not_found");

        let describe = frame(&bridge, r#"{"op":"describe_config","plugin":"notes"}"#).await;
        assert_eq!(describe["status"], "success");
        let missing = frame(&bridge, r#"{"op":"describe_config","plugin":"ghost"}"#).await;
        assert_eq!(missing["kind"], "plugin_not_found");
    }

    #[tokio::test]
    async fn test_serve_answers_every_frame() {
        let input = concat!(
            r#"{"op":"dispatch","id":"a","plugin":"notes","method":"note_set","context":{"chat_key":"c"},"args":{"name":"k","content":"v"}}"#,
            "\n\n",
            r#"{"op":"status","id":"b"}"#,
            "\n",
            "{broken\n",
            r#"{"op":"dispatch","id":"d","plugin":"notes","method":"nope","context":{"chat_key":"c"}}"#,
            "\n",
        );
        let responses = session(bridge().await, input).await;
        assert_eq!(responses.len(), 4);

        let by_id = |id: &str| responses.iter().find(|r| r["id"] == id).cloned().unwrap();
        assert_eq!(by_id("a")["status"], "success");
        assert_eq!(by_id("b")["status"], "success");
        assert_eq!(by_id("d")["kind"], "method_not_found");
        assert_eq!(
            responses
                .iter()
                .filter(|r| r["kind"] == "serialization")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_serve_rejects_oversized_frame() {
        let bridge = bridge_with_payload_limit(1024).await;
        let huge = format!(
            r#"{{"op":"dispatch","id":"big","plugin":"notes","method":"note_set","context":{{"chat_key":"c"}},"args":{{"name":"k","content":"{}"}}}}"#,
            "x".repeat(FRAME_OVERHEAD + 4096)
        );
        let input = format!("{huge}\n{}\n", r#"{"op":"status","id":"after"}"#);
        let responses = session(bridge, &input).await;
        assert_eq!(responses.len(), 2);

        let rejected = responses.iter().find(|r| r["id"] != "after").unwrap();
        assert_eq!(rejected["kind"], "serialization");
        assert!(rejected["message"].as_str().unwrap().contains("limit"));
        let after = responses.iter().find(|r| r["id"] == "after").unwrap();
        assert_eq!(after["status"], "success");
    }

    #[tokio::test]
    async fn test_args_over_payload_limit_within_frame_limit() {
        let bridge = bridge_with_payload_limit(1024).await;
        let line = format!(
            r#"{{"op":"dispatch","id":"a","plugin":"notes","method":"note_set","context":{{"chat_key":"c"}},"args":{{"name":"k","content":"{}"}}}}"#,
            "x".repeat(2048)
        );
        let resp = frame(&bridge, &line).await;
        assert_eq!(resp["id"], "a");
        assert_eq!(resp["kind"], "serialization");
    }

    // ── Line reader ─────────────────────────────────────

    #[tokio::test]
    async fn test_line_reader_skips_long_lines() {
        let long = "y".repeat(20_000);
        let input = format!("short\n{long}\nafter\r\nlast");
        let mut reader = LineReader::new(input.as_bytes(), 10);

        assert_eq!(reader.next_line().await.unwrap(), Some(Line::Text("short".into())));
        assert_eq!(reader.next_line().await.unwrap(), Some(Line::TooLong(20_000)));
        assert!(reader.buf.capacity() <= 10);
        assert_eq!(reader.next_line().await.unwrap(), Some(Line::Text("after".into())));
        assert_eq!(reader.next_line().await.unwrap(), Some(Line::Text("last".into())));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_reader_flags_invalid_utf8() {
        let input: &[u8] = b"\xff\xfe\n{}\n";
        let mut reader = LineReader::new(input, 64);
        assert_eq!(reader.next_line().await.unwrap(), Some(Line::NotUtf8));
        assert_eq!(reader.next_line().await.unwrap(), Some(Line::Text("{}".into())));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let (writer, mut output) = tokio::io::duplex(64 * 1024);
        // A reader that never yields a line.
        let (_keep_open, reader) = tokio::io::duplex(64);
        let server = SandboxServer::new(bridge().await);

        server
            .serve(reader, writer, async {})
            .await
            .unwrap();

        let mut text = String::new();
        output.read_to_string(&mut text).await.unwrap();
        assert!(text.is_empty());
    }
}
