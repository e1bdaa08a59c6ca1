//! Routes one inbound `request` frame from a sandbox to Client Pool or
//! Discovery, and turns the outcome into a `response` frame. Stateless aside
//! from the per-invocation context it's handed; concurrency comes from the
//! invocation layer spawning one `handle_request` call per inbound frame.

use std::{collections::HashSet, sync::Arc, time::Duration};

use serde_json::{json, Value};

use crate::{
    discovery::{DocDetail, Discovery},
    downstream::ClientPool,
    error::BridgeError,
    frame::Frame,
};

/// Per-invocation context the dispatcher consults for every inbound request.
pub struct DispatchContext {
    pub requested_servers: HashSet<String>,
    pub pool: Arc<ClientPool>,
    pub discovery: Arc<Discovery>,
}

/// Dispatches one request, clamping a per-call `timeout` argument to
/// `remaining` (spec's Open Question (a): clamp rather than reject).
pub async fn handle_request(
    id: u64,
    method: &str,
    params: Value,
    ctx: &DispatchContext,
    remaining: Duration,
) -> Frame {
    match method {
        "call_tool" => handle_call_tool(id, params, ctx, remaining).await,
        "discovered_servers" => Frame::response_ok(id, json!(ctx.discovery.discovered_servers())),
        "list_servers" => Frame::response_ok(id, json!(ctx.discovery.list_servers())),
        "list_tools" => handle_list_tools(id, params, ctx).await,
        "query_tool_docs" => handle_query_tool_docs(id, params, ctx).await,
        "search_tool_docs" => handle_search_tool_docs(id, params, ctx).await,
        "capability_summary" => Frame::response_ok(id, json!(ctx.discovery.capability_summary())),
        "describe_server" => handle_describe_server(id, params, ctx).await,
        other => Frame::response_err(id, UNKNOWN_METHOD, format!("unknown_method: {other}")),
    }
}

const UNKNOWN_METHOD: i64 = -32601;
const UNKNOWN_SERVER: i64 = -32001;
const DOWNSTREAM_UNAVAILABLE: i64 = -32002;
const INTERNAL: i64 = -32000;

async fn handle_call_tool(
    id: u64,
    params: Value,
    ctx: &DispatchContext,
    remaining: Duration,
) -> Frame {
    let server = params.get("server").and_then(Value::as_str).unwrap_or("");
    let tool = params.get("tool").and_then(Value::as_str).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    if !ctx.requested_servers.contains(server) {
        return Frame::response_err(
            id,
            UNKNOWN_SERVER,
            format!("unknown_server: `{server}` was not requested for this invocation"),
        );
    }

    let deadline = params
        .get("timeout")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .map(|requested| requested.min(remaining))
        .unwrap_or(remaining);

    match ctx.pool.call(server, tool, arguments, deadline).await {
        Ok(result) => Frame::response_ok(id, result),
        Err(err) => frame_err_from(id, err),
    }
}

async fn handle_list_tools(id: u64, params: Value, ctx: &DispatchContext) -> Frame {
    let server = params.get("server").and_then(Value::as_str).unwrap_or("");
    match ctx.discovery.list_tools(server).await {
        Ok(aliases) => Frame::response_ok(id, json!(aliases)),
        Err(err) => frame_err_from(id, err),
    }
}

async fn handle_query_tool_docs(id: u64, params: Value, ctx: &DispatchContext) -> Frame {
    let server = params.get("server").and_then(Value::as_str).unwrap_or("");
    let tool = params.get("tool").and_then(Value::as_str);
    let detail = match params.get("detail").and_then(Value::as_str) {
        Some("full") => DocDetail::Full,
        _ => DocDetail::Summary,
    };
    match ctx.discovery.query_tool_docs(server, tool, detail).await {
        Ok(docs) => Frame::response_ok(id, json!(docs)),
        Err(err) => frame_err_from(id, err),
    }
}

async fn handle_search_tool_docs(id: u64, params: Value, ctx: &DispatchContext) -> Frame {
    let query = params.get("query").and_then(Value::as_str).unwrap_or("");
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(10);
    match ctx.discovery.search_tool_docs(query, limit).await {
        Ok(docs) => Frame::response_ok(id, json!(docs)),
        Err(err) => frame_err_from(id, err),
    }
}

async fn handle_describe_server(id: u64, params: Value, ctx: &DispatchContext) -> Frame {
    let server = params.get("server").and_then(Value::as_str).unwrap_or("");
    match ctx.discovery.describe_server(server).await {
        Ok((record, tools)) => Frame::response_ok(
            id,
            json!({
                "name": record.name,
                "command": record.command,
                "args": record.args,
                "tools": tools.iter().map(|t| json!({
                    "tool": t.tool_name,
                    "alias": t.alias,
                    "description": t.description,
                })).collect::<Vec<_>>(),
            }),
        ),
        Err(err) => frame_err_from(id, err),
    }
}

fn frame_err_from(id: u64, err: BridgeError) -> Frame {
    if let BridgeError::DownstreamError { code, message, .. } = &err {
        return Frame::response_err(id, *code, message.clone());
    }
    let kind = err.kind();
    let code = match kind {
        "unknown_server" => UNKNOWN_SERVER,
        "downstream_unavailable" => DOWNSTREAM_UNAVAILABLE,
        _ => INTERNAL,
    };
    Frame::response_err(id, code, format!("{kind}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerRecord;

    fn ctx(requested: &[&str]) -> DispatchContext {
        let records = vec![ServerRecord {
            name: "stub".to_string(),
            command: "true".to_string(),
            args: vec![],
            env: Default::default(),
            cwd: None,
        }];
        let pool = Arc::new(ClientPool::new(records.clone()));
        let discovery = Arc::new(Discovery::new(records, pool.clone()));
        DispatchContext {
            requested_servers: requested.iter().map(|s| s.to_string()).collect(),
            pool,
            discovery,
        }
    }

    #[tokio::test]
    async fn call_tool_outside_requested_set_is_unknown_server() {
        let ctx = ctx(&[]);
        let frame = handle_request(
            1,
            "call_tool",
            json!({"server": "stub", "tool": "echo", "arguments": {}}),
            &ctx,
            Duration::from_secs(5),
        )
        .await;
        match frame {
            Frame::Response { ok, error, .. } => {
                assert!(!ok);
                assert!(error.unwrap().message.contains("unknown_server"));
            }
            other => panic!("expected a response frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let ctx = ctx(&["stub"]);
        let frame = handle_request(2, "bogus_method", json!({}), &ctx, Duration::from_secs(5)).await;
        match frame {
            Frame::Response { ok, error, .. } => {
                assert!(!ok);
                assert!(error.unwrap().message.contains("unknown_method"));
            }
            other => panic!("expected a response frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discovered_servers_is_served_without_starting_anything() {
        let ctx = ctx(&[]);
        let frame = handle_request(3, "discovered_servers", json!({}), &ctx, Duration::from_secs(5)).await;
        match frame {
            Frame::Response { ok, result, .. } => {
                assert!(ok);
                assert_eq!(result.unwrap(), json!(["stub"]));
            }
            other => panic!("expected a response frame, got {other:?}"),
        }
    }
}
