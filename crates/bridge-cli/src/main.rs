//! Development harness for the bridge engine: loads server config and
//! settings, builds a [`bridge::Bridge`], and drives one `run_python` call
//! from argv/stdin. Not the outer MCP server skeleton — see crates/bridge's
//! crate docs.

#![forbid(unsafe_code)]

use std::{io::Read, path::PathBuf};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bridge-cli")]
#[command(about = "Drives one run_python call against the code-execution bridge")]
struct Cli {
    /// Python snippet to execute. Reads stdin if omitted.
    #[arg(long)]
    code: Option<String>,

    /// Downstream server name to make available (repeatable).
    #[arg(long = "server")]
    servers: Vec<String>,

    /// Per-call timeout in seconds; defaults to the bridge's configured default.
    #[arg(long)]
    timeout: Option<i64>,

    /// TOML config file to load `[[server]]` records from (repeatable, last wins by name).
    #[arg(long = "config")]
    config_paths: Vec<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let settings = bridge::Settings::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let servers = match bridge::load_servers(&cli.config_paths) {
        Ok(servers) => servers,
        Err(err) => {
            eprintln!("failed to load server config: {err}");
            std::process::exit(1);
        }
    };

    let code = match cli.code {
        Some(code) => code,
        None => {
            let mut buf = String::new();
            if std::io::stdin().read_to_string(&mut buf).is_err() {
                eprintln!("failed to read code from stdin");
                std::process::exit(1);
            }
            buf
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    let exit_code = runtime.block_on(run(settings, servers, code, cli.servers, cli.timeout));
    std::process::exit(exit_code);
}

async fn run(
    settings: bridge::Settings,
    servers: Vec<bridge::ServerRecord>,
    code: String,
    requested_servers: Vec<String>,
    timeout: Option<i64>,
) -> i32 {
    let bridge = bridge::Bridge::builder()
        .settings(settings)
        .servers(servers)
        .build();

    let result = bridge
        .run_python(bridge::RunPythonRequest {
            code,
            servers: requested_servers,
            timeout,
        })
        .await;

    bridge.shutdown().await;

    match result {
        Ok(tool_result) => {
            println!("{}", tool_result.text);
            match serde_json::to_string_pretty(&tool_result.structured_content) {
                Ok(json) => eprintln!("{json}"),
                Err(err) => eprintln!("failed to render structuredContent: {err}"),
            }
            0
        }
        Err(err) => {
            eprintln!("run_python failed before it could start: {err}");
            1
        }
    }
}
