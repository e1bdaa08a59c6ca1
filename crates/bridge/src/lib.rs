//! Engine behind a single `run_python` MCP tool: sandbox lifecycle, host <->
//! sandbox RPC dispatch, a persistent downstream MCP client pool, and lazy
//! tool discovery. The outer MCP server skeleton that registers `run_python`
//! and speaks MCP to a client is an external collaborator; this crate exposes
//! plain async functions for that skeleton (or `bridge-cli`) to call.

#![forbid(unsafe_code)]

mod config;
mod container;
mod discovery;
mod downstream;
mod entrypoint;
mod error;
mod frame;
mod render;
mod runtime;
mod sandbox;
mod settings;
mod tool;

use std::{sync::Arc, time::Duration};

pub use config::{index_by_name, load_servers, parse_servers, ServerRecord};
pub use discovery::{DocDetail, Discovery, ToolDocSummary};
pub use downstream::{ClientPool, ClientState, DownstreamClient};
pub use entrypoint::CATALOG_ENV_VAR;
pub use error::BridgeError;
pub use frame::{DoneStatus, Frame, FrameError, MAX_FRAME_LEN};
pub use render::{render, McpToolResult, RunPythonResult, RunStatus};
pub use runtime::RuntimeSelector;
pub use sandbox::{Invocation, RunPythonOutcome, RunPythonRequest, Status};
pub use settings::{OutputMode, Settings};
pub use tool::ToolDescriptor;

/// The bridge engine: owns the downstream client pool, the discovery view
/// over it, and the runtime selector, all shared across invocations.
pub struct Bridge {
    settings: Settings,
    pool: Arc<ClientPool>,
    discovery: Arc<Discovery>,
    runtime: Arc<RuntimeSelector>,
    idle_watcher: tokio::task::JoinHandle<()>,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs one `run_python` call end-to-end and renders its MCP tool
    /// result. Never returns `Err` for failures that originate from the
    /// snippet or a downstream server — those are folded into the envelope's
    /// `status`/`error` fields, per the bridge's "never panics the outer MCP
    /// server" contract. Only a failure to validate or to acquire a runtime
    /// before spawning anything surfaces as `Err`.
    pub async fn run_python(&self, request: RunPythonRequest) -> Result<McpToolResult, BridgeError> {
        let invocation = Invocation::new(&self.settings, self.pool.clone(), self.discovery.clone(), &self.runtime);
        let outcome = invocation.run(request).await?;
        let result = RunPythonResult {
            status: match outcome.status {
                Status::Ok => RunStatus::Ok,
                Status::Error => RunStatus::Error,
                Status::Timeout => RunStatus::Timeout,
            },
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            error: outcome.error,
            servers: outcome.servers,
        };
        Ok(render(&result, self.settings.output_mode))
    }

    /// The body of the `resource://<bridge>/capabilities` resource: a
    /// capability summary and the list of in-sandbox helper names, never the
    /// individual downstream tool schemas.
    pub fn capabilities_resource(&self) -> serde_json::Value {
        serde_json::json!({
            "summary": self.discovery.capability_summary(),
            "helpers": [
                "discovered_servers", "list_servers", "list_servers_sync",
                "list_tools", "list_tools_sync", "query_tool_docs", "query_tool_docs_sync",
                "search_tool_docs", "search_tool_docs_sync", "capability_summary",
                "describe_server", "list_loaded_server_metadata", "call_tool",
            ],
        })
    }

    /// Concurrently closes every started downstream client with a global
    /// grace period, and shuts down a warmed runtime VM if one was started.
    pub async fn shutdown(&self) {
        self.idle_watcher.abort();
        self.pool.shutdown().await;
        self.runtime.idle_shutdown().await;
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.idle_watcher.abort();
    }
}

#[derive(Default)]
pub struct BridgeBuilder {
    settings: Option<Settings>,
    servers: Vec<ServerRecord>,
}

impl BridgeBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn servers(mut self, servers: Vec<ServerRecord>) -> Self {
        self.servers = servers;
        self
    }

    pub fn build(self) -> Bridge {
        let settings = self.settings.unwrap_or_default();
        let pool = Arc::new(ClientPool::new(self.servers.clone()));
        let discovery = Arc::new(Discovery::new(self.servers, pool.clone()));
        let runtime = Arc::new(RuntimeSelector::new(
            settings.runtime.clone(),
            settings.runtime_idle_timeout,
        ));
        let idle_watcher = spawn_idle_watcher(runtime.clone(), settings.runtime_idle_timeout);
        Bridge {
            settings,
            pool,
            discovery,
            runtime,
            idle_watcher,
        }
    }
}

/// Periodically checks the runtime's idle clock and issues a VM shutdown
/// once it's expired, so a warmed-but-unused runtime doesn't stay up for the
/// life of the process. Polls at a quarter of the idle timeout, floored at a
/// second so a very short configured timeout still gets checked promptly.
fn spawn_idle_watcher(
    runtime: Arc<RuntimeSelector>,
    idle_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    let poll_interval = (idle_timeout / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            if runtime.idle_expired() {
                runtime.idle_shutdown().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hello_world_via_builder() {
        let bridge = Bridge::builder()
            .settings(Settings {
                runtime: Some("true".to_string()),
                ..Settings::default()
            })
            .build();
        assert!(!bridge.capabilities_resource()["helpers"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_the_idle_watcher_task() {
        let bridge = Bridge::builder()
            .settings(Settings {
                runtime: Some("true".to_string()),
                runtime_idle_timeout: Duration::from_millis(5),
                ..Settings::default()
            })
            .build();
        bridge.shutdown().await;
        tokio::task::yield_now().await;
        assert!(bridge.idle_watcher.is_finished());
    }

    #[tokio::test]
    async fn run_python_rejects_invalid_request_without_acquiring_a_runtime() {
        let bridge = Bridge::builder()
            .settings(Settings {
                // Deliberately missing: no runtime should ever be probed
                // because validation fails first.
                runtime: Some("definitely-not-a-real-binary".to_string()),
                ..Settings::default()
            })
            .build();
        let err = bridge
            .run_python(RunPythonRequest {
                code: String::new(),
                servers: vec![],
                timeout: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
}
