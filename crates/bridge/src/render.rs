//! Assembles the outgoing `run_python` result: a `structuredContent` record
//! with empty fields elided, and one `text` content block rendered either as
//! compact plain text (default) or token-oriented object notation.

use serde::Serialize;
use serde_json::{json, Value};

use crate::settings::OutputMode;

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Timeout,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunPythonResult {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub servers: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct McpToolResult {
    #[serde(rename = "structuredContent")]
    pub structured_content: Value,
    pub text: String,
}

/// Builds `structuredContent`: the result record with empty strings and
/// empty collections elided.
fn structured_content(result: &RunPythonResult) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("status".to_string(), json!(result.status));
    if !result.stdout.is_empty() {
        map.insert("stdout".to_string(), json!(result.stdout));
    }
    if !result.stderr.is_empty() {
        map.insert("stderr".to_string(), json!(result.stderr));
    }
    if let Some(error) = &result.error {
        if !error.is_empty() {
            map.insert("error".to_string(), json!(error));
        }
    }
    if !result.servers.is_empty() {
        map.insert("servers".to_string(), json!(result.servers));
    }
    Value::Object(map)
}

/// Renders the compact plain-text block used by default.
fn render_compact(result: &RunPythonResult) -> String {
    let mut lines = vec![format!("status: {}", status_str(&result.status))];
    if !result.stdout.is_empty() {
        lines.push(format!("stdout:\n{}", result.stdout.trim_end_matches('\n')));
    }
    if !result.stderr.is_empty() {
        lines.push(format!("stderr:\n{}", result.stderr.trim_end_matches('\n')));
    }
    if let Some(error) = &result.error {
        if !error.is_empty() {
            lines.push(format!("error: {error}"));
        }
    }
    if !result.servers.is_empty() {
        lines.push(format!("servers: {}", result.servers.join(", ")));
    }
    lines.join("\n")
}

fn status_str(status: &RunStatus) -> &'static str {
    match status {
        RunStatus::Ok => "ok",
        RunStatus::Error => "error",
        RunStatus::Timeout => "timeout",
    }
}

/// A compact textual encoding of a record, optimized for model tokenization:
/// `key=value` pairs separated by `; `, string values quoted only when they
/// contain whitespace or `=`/`;`.
#[cfg(feature = "token_notation")]
fn render_token_notation(result: &RunPythonResult) -> String {
    let mut parts = vec![format!("status={}", status_str(&result.status))];
    if !result.stdout.is_empty() {
        parts.push(format!("stdout={}", token_quote(&result.stdout)));
    }
    if !result.stderr.is_empty() {
        parts.push(format!("stderr={}", token_quote(&result.stderr)));
    }
    if let Some(error) = &result.error {
        if !error.is_empty() {
            parts.push(format!("error={}", token_quote(error)));
        }
    }
    if !result.servers.is_empty() {
        parts.push(format!("servers=[{}]", result.servers.join(",")));
    }
    parts.join("; ")
}

#[cfg(feature = "token_notation")]
fn token_quote(value: &str) -> String {
    if value
        .chars()
        .any(|c| c.is_whitespace() || c == '=' || c == ';')
    {
        format!("{:?}", value)
    } else {
        value.to_string()
    }
}

/// Renders the `text` block for the configured output mode, falling back to
/// indented JSON when the token-oriented encoder isn't compiled in.
fn render_text(result: &RunPythonResult, mode: OutputMode) -> String {
    match mode {
        OutputMode::Compact => render_compact(result),
        OutputMode::TokenOriented => {
            #[cfg(feature = "token_notation")]
            {
                render_token_notation(result)
            }
            #[cfg(not(feature = "token_notation"))]
            {
                serde_json::to_string_pretty(&structured_content(result))
                    .unwrap_or_else(|_| render_compact(result))
            }
        }
    }
}

pub fn render(result: &RunPythonResult, mode: OutputMode) -> McpToolResult {
    McpToolResult {
        structured_content: structured_content(result),
        text: render_text(result, mode),
    }
}
