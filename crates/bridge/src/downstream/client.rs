//! A single persistent stdio JSON-RPC session to one downstream MCP server.
//!
//! A writer task owns the child's stdin, a reader task demultiplexes stdout
//! lines into a pending-request map keyed by numeric id, and `Drop` aborts
//! the pump tasks and kills the child if it's still alive.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{config::ServerRecord, error::BridgeError, tool::ToolDescriptor};

/// Lifecycle state of a [`DownstreamClient`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Cold,
    Starting,
    Ready,
    Failed,
    Closing,
}

type PendingRequests = std::sync::Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>>>>;

/// The part of a transport that concurrent `call()`s need. Kept behind an
/// `Arc` and cloned out from under the client's state lock so that two calls
/// in flight at once never block on each other (only state transitions do).
struct Shared {
    writer: mpsc::UnboundedSender<String>,
    pending: PendingRequests,
    next_id: AtomicU64,
    /// Cleared by the reader task the moment the child's stdout hits EOF.
    /// `call()` checks this before sending so a request issued after the
    /// transport has already died fails fast with `downstream_unavailable`
    /// instead of hanging until the invocation deadline.
    alive: std::sync::atomic::AtomicBool,
}

struct RunningTransport {
    shared: std::sync::Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    child: Child,
}

enum Inner {
    Cold,
    Ready {
        transport: RunningTransport,
        tools: Vec<ToolDescriptor>,
    },
    Failed(String),
}

/// One persistent stdio session to one downstream MCP server.
pub struct DownstreamClient {
    record: ServerRecord,
    inner: Mutex<Inner>,
}

impl DownstreamClient {
    pub fn new(record: ServerRecord) -> Self {
        Self {
            record,
            inner: Mutex::new(Inner::Cold),
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub async fn state(&self) -> ClientState {
        match &*self.inner.lock().await {
            Inner::Cold => ClientState::Cold,
            Inner::Ready { .. } => ClientState::Ready,
            Inner::Failed(_) => ClientState::Failed,
        }
    }

    /// Spawns the server (if cold or failed) and performs `initialize` + an
    /// initial `tools/list`. Idempotent while already `ready`.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut guard = self.inner.lock().await;
        if let Inner::Ready { transport, .. } = &*guard {
            if transport.shared.alive.load(Ordering::SeqCst) {
                return Ok(());
            }
        }

        match spawn_transport(&self.record).await {
            Ok(transport) => {
                let shared = transport.shared.clone();
                let init_id = shared.next_id.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = send_request(
                    &shared,
                    init_id,
                    "initialize",
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "clientInfo": {"name": "mcp-code-execution-bridge", "version": env!("CARGO_PKG_VERSION")},
                    }),
                    Duration::from_secs(10),
                )
                .await
                {
                    *guard = Inner::Failed(err.to_string());
                    return Err(err);
                }

                send_notification(&shared, "notifications/initialized", Value::Null);

                let list_id = shared.next_id.fetch_add(1, Ordering::SeqCst);
                let tools = match send_request(
                    &shared,
                    list_id,
                    "tools/list",
                    Value::Null,
                    Duration::from_secs(10),
                )
                .await
                {
                    Ok(result) => parse_tool_list(&self.record.name, result),
                    Err(err) => {
                        *guard = Inner::Failed(err.to_string());
                        return Err(err);
                    }
                };

                *guard = Inner::Ready { transport, tools };
                Ok(())
            }
            Err(err) => {
                *guard = Inner::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Returns the cached tool list, starting the client first if it's cold.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, BridgeError> {
        self.start().await?;
        let guard = self.inner.lock().await;
        match &*guard {
            Inner::Ready { tools, .. } => Ok(tools.clone()),
            Inner::Failed(reason) => Err(BridgeError::DownstreamUnavailable {
                server: self.record.name.clone(),
                reason: reason.clone(),
            }),
            Inner::Cold => unreachable!("start() leaves Ready or Failed"),
        }
    }

    /// Sends `tools/call` and awaits the response by id, honoring `deadline`.
    pub async fn call(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value, BridgeError> {
        let shared = {
            let guard = self.inner.lock().await;
            match &*guard {
                Inner::Ready { transport, .. } => transport.shared.clone(),
                Inner::Failed(reason) => {
                    return Err(BridgeError::DownstreamUnavailable {
                        server: self.record.name.clone(),
                        reason: reason.clone(),
                    })
                }
                Inner::Cold => {
                    return Err(BridgeError::DownstreamUnavailable {
                        server: self.record.name.clone(),
                        reason: "not started".to_string(),
                    })
                }
            }
        };

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let params = json!({"name": tool, "arguments": arguments});
        let result = send_request(&shared, id, "tools/call", params, deadline).await;

        result.map_err(|err| match err {
            BridgeError::DownstreamError { .. } => err,
            other => {
                BridgeError::DownstreamUnavailable {
                    server: self.record.name.clone(),
                    reason: other.to_string(),
                }
            }
        })
    }

    /// Sends `shutdown`, closes stdin, waits a grace period, then kills.
    pub async fn close(&self, grace: Duration) {
        let mut guard = self.inner.lock().await;
        if let Inner::Ready { mut transport, .. } =
            std::mem::replace(&mut *guard, Inner::Failed("closed".to_string()))
        {
            let id = transport.shared.next_id.fetch_add(1, Ordering::SeqCst);
            let _ = send_request(&transport.shared, id, "shutdown", Value::Null, grace).await;
            send_notification(&transport.shared, "exit", Value::Null);

            for task in &transport.tasks {
                task.abort();
            }

            match time::timeout(grace, transport.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = transport.child.start_kill();
                }
            }
        }
    }

    pub fn record(&self) -> &ServerRecord {
        &self.record
    }
}

async fn spawn_transport(record: &ServerRecord) -> Result<RunningTransport, BridgeError> {
    let mut command = Command::new(&record.command);
    command
        .args(&record.args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    if let Some(cwd) = &record.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &record.env {
        command.env(key, value);
    }

    let command_debug = format!("{command:?}");
    let mut backoff = Duration::from_millis(2);
    let mut child = loop_spawn(&mut command, &command_debug, &mut backoff)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Internal("downstream stdout unavailable".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Internal("downstream stdin unavailable".into()))?;
    let stderr = child.stderr.take();

    let pending: PendingRequests = std::sync::Arc::new(Mutex::new(HashMap::new()));
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();

    let shared = std::sync::Arc::new(Shared {
        writer: writer_tx,
        pending,
        next_id: AtomicU64::new(1),
        alive: std::sync::atomic::AtomicBool::new(true),
    });

    let writer_handle = tokio::spawn(writer_task(stdin, writer_rx));
    let reader_handle = tokio::spawn(reader_task(stdout, shared.clone(), record.name.clone()));
    let mut tasks = vec![writer_handle, reader_handle];
    if let Some(stderr) = stderr {
        let server_name = record.name.clone();
        tasks.push(tokio::spawn(stderr_task(stderr, server_name)));
    }

    Ok(RunningTransport {
        shared,
        tasks,
        child,
    })
}

fn loop_spawn(
    command: &mut Command,
    command_debug: &str,
    backoff: &mut Duration,
) -> Result<Child, BridgeError> {
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(*backoff);
                    *backoff = std::cmp::min(*backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(BridgeError::Spawn {
                    command: command_debug.to_string(),
                    source,
                });
            }
        }
    }
    unreachable!("loop_spawn should return before exhausting retries")
}

async fn send_request(
    shared: &Shared,
    id: u64,
    method: &str,
    params: Value,
    deadline: Duration,
) -> Result<Value, BridgeError> {
    if !shared.alive.load(Ordering::SeqCst) {
        return Err(BridgeError::Internal("downstream transport already closed".into()));
    }

    let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    let serialized = serde_json::to_string(&message)?;
    let (tx, rx) = oneshot::channel();
    {
        let mut guard = shared.pending.lock().await;
        guard.insert(id, tx);
    }
    if shared.writer.send(serialized).is_err() {
        shared.pending.lock().await.remove(&id);
        return Err(BridgeError::Internal("downstream writer closed".into()));
    }

    match time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(BridgeError::Internal("downstream channel closed".into())),
        Err(_) => {
            shared.pending.lock().await.remove(&id);
            Err(BridgeError::Internal(format!(
                "downstream request `{method}` timed out after {deadline:?}"
            )))
        }
    }
}

fn send_notification(shared: &Shared, method: &str, params: Value) {
    let message = json!({"jsonrpc": "2.0", "method": method, "params": params});
    if let Ok(serialized) = serde_json::to_string(&message) {
        let _ = shared.writer.send(serialized);
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(message) = rx.recv().await {
        if stdin.write_all(message.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
    let _ = stdin.shutdown().await;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Value,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

async fn reader_task(stdout: ChildStdout, shared: std::sync::Arc<Shared>, server_name: String) {
    let pending = &shared.pending;
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                warn!("failed to parse downstream stdout as JSON: {err}");
                continue;
            }
        };
        // Only responses (carry an `id`) matter to the pending map; bare
        // notifications from the downstream server are logged and dropped.
        if value.get("id").is_none() {
            debug!(?value, "ignoring downstream notification");
            continue;
        }
        let response: RpcResponse = match serde_json::from_value(value) {
            Ok(response) => response,
            Err(err) => {
                warn!("malformed downstream response: {err}");
                continue;
            }
        };
        let Some(id) = response.id.as_u64() else {
            warn!("downstream response had a non-numeric id");
            continue;
        };
        let sender = pending.lock().await.remove(&id);
        let Some(tx) = sender else { continue };
        if let Some(error) = response.error {
            let _ = tx.send(Err(BridgeError::DownstreamError {
                server: server_name.clone(),
                code: error.code,
                message: error.message,
            }));
        } else if let Some(result) = response.result {
            let _ = tx.send(Ok(result));
        } else {
            let _ = tx.send(Err(BridgeError::Internal(
                "downstream response missing result and error".into(),
            )));
        }
    }

    shared.alive.store(false, Ordering::SeqCst);
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(BridgeError::Internal(
            "downstream transport closed".into(),
        )));
    }
}

async fn stderr_task(stderr: tokio::process::ChildStderr, server_name: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(server = %server_name, "downstream stderr: {line}");
    }
}

fn parse_tool_list(server_name: &str, result: Value) -> Vec<ToolDescriptor> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let aliases = crate::tool::assign_aliases(tools.iter().map(|t| {
        (
            server_name,
            t.get("name").and_then(Value::as_str).unwrap_or(""),
        )
    }));
    tools
        .into_iter()
        .zip(aliases)
        .map(|(tool, alias)| ToolDescriptor {
            server_name: server_name.to_string(),
            tool_name: tool
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            alias,
            description: tool
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input_schema: tool
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object"})),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_stub_server(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("stub_server.js");
        let script = r#"
const rl = require('readline').createInterface({ input: process.stdin });
rl.on('line', (line) => {
  const msg = JSON.parse(line);
  if (msg.method === 'initialize') {
    console.log(JSON.stringify({ jsonrpc: '2.0', id: msg.id, result: { capabilities: {}, protocolVersion: '2024-11-05', serverInfo: { name: 'stub', version: '0' } } }));
  } else if (msg.method === 'notifications/initialized') {
    // no response
  } else if (msg.method === 'tools/list') {
    console.log(JSON.stringify({ jsonrpc: '2.0', id: msg.id, result: { tools: [{ name: 'echo', description: 'echoes input', inputSchema: { type: 'object' } }] } }));
  } else if (msg.method === 'tools/call') {
    const message = (msg.params && msg.params.arguments && msg.params.arguments.message) || '';
    console.log(JSON.stringify({ jsonrpc: '2.0', id: msg.id, result: { content: [{ type: 'text', text: message }] } }));
  } else if (msg.method === 'shutdown') {
    console.log(JSON.stringify({ jsonrpc: '2.0', id: msg.id, result: {} }));
  }
});
"#;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(script.as_bytes())
            .unwrap();
        path
    }

    fn has_node() -> bool {
        std::process::Command::new("node")
            .arg("--version")
            .output()
            .is_ok()
    }

    #[tokio::test]
    async fn start_list_tools_and_call_round_trip() {
        if !has_node() {
            eprintln!("skipping: node not available");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = write_stub_server(dir.path());
        let record = ServerRecord {
            name: "stub".to_string(),
            command: "node".to_string(),
            args: vec![script.to_string_lossy().to_string()],
            env: Default::default(),
            cwd: None,
        };
        let client = DownstreamClient::new(record);
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].alias, "echo");
        assert_eq!(client.state().await, ClientState::Ready);

        let result = client
            .call("echo", json!({"message": "hi"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            result["content"][0]["text"].as_str().unwrap(),
            "hi"
        );

        client.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn call_before_start_is_downstream_unavailable() {
        let record = ServerRecord {
            name: "stub".to_string(),
            command: "true".to_string(),
            args: vec![],
            env: Default::default(),
            cwd: None,
        };
        let client = DownstreamClient::new(record);
        let err = client
            .call("echo", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "downstream_unavailable");
    }
}
