//! Drives one `run_python` call against a single downstream echo server,
//! using whatever container runtime podman/docker resolves to on this
//! machine.
//!
//! Requirements:
//! - A working `podman` or `docker` on `PATH` (override with `BRIDGE_RUNTIME`).
//! - `npx` able to fetch `@modelcontextprotocol/server-everything`, or set
//!   `ECHO_SERVER_COMMAND`/`ECHO_SERVER_ARGS` (space-separated) to point at
//!   any other stdio MCP server that exposes an `echo`-like tool.
//!
//! Example:
//! ```bash
//! cargo run -p bridge-cli --example run_echo
//! ```

use bridge::{Bridge, RunPythonRequest, ServerRecord, Settings};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let command = std::env::var("ECHO_SERVER_COMMAND").unwrap_or_else(|_| "npx".to_string());
    let args = std::env::var("ECHO_SERVER_ARGS")
        .unwrap_or_else(|_| "-y @modelcontextprotocol/server-everything".to_string())
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let bridge = Bridge::builder()
        .settings(Settings::from_env())
        .servers(vec![ServerRecord {
            name: "echo".to_string(),
            command,
            args,
            env: Default::default(),
            cwd: None,
        }])
        .build();

    let result = bridge
        .run_python(RunPythonRequest {
            code: "print(await mcp_echo(message='hello from the sandbox'))".to_string(),
            servers: vec!["echo".to_string()],
            timeout: None,
        })
        .await;

    bridge.shutdown().await;

    match result {
        Ok(tool_result) => println!("{}", tool_result.text),
        Err(err) => eprintln!("run_python failed before it could start: {err}"),
    }
}
