//! Generates the Python script written into the sandbox as `entrypoint.py`.
//!
//! Three equivalent proxy surfaces are generated here as plain text, keyed
//! off the tool catalog for the invocation's requested servers, rather than
//! built dynamically at runtime: flat `mcp_<alias>(**kwargs)` functions, the
//! `mcp_servers[server][tool]` dict, and an importable `mcp.<server>`
//! virtual package exposing each loaded server's tools as named submodule
//! functions. Top-level `await` in user code is supported by wrapping the
//! snippet in an `async def` and driving it with `asyncio.run`, rather than
//! needing a special compile flag.

use serde_json::json;

use crate::tool::ToolDescriptor;

/// Name of the environment variable carrying the serialized tool catalog.
pub const CATALOG_ENV_VAR: &str = "MCP_BRIDGE_CATALOG";

/// Builds the JSON catalog envelope embedded in the container's environment:
/// one entry per tool available to this invocation.
pub fn catalog_envelope(tools: &[ToolDescriptor]) -> String {
    let entries: Vec<_> = tools
        .iter()
        .map(|t| {
            json!({
                "server": t.server_name,
                "tool": t.tool_name,
                "alias": t.alias,
                "description": t.description,
            })
        })
        .collect();
    serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string())
}

/// Renders the complete `entrypoint.py` source for `user_code`, given the
/// tool catalog available to this invocation.
pub fn generate_entrypoint(user_code: &str, tools: &[ToolDescriptor]) -> String {
    let indented_user_code = indent(user_code, "    ");
    let alias_defs = render_alias_defs(tools);
    format!("{PRELUDE}\n\n{alias_defs}\n\nasync def __user_main():\n{indented_user_code}\n\n{MAIN}\n")
}

fn indent(code: &str, prefix: &str) -> String {
    if code.trim().is_empty() {
        return format!("{prefix}pass");
    }
    code.lines()
        .map(|line| {
            if line.is_empty() {
                line.to_string()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_alias_defs(tools: &[ToolDescriptor]) -> String {
    let mut out = String::new();
    for tool in tools {
        let server_literal = python_str_literal(&tool.server_name);
        let tool_literal = python_str_literal(&tool.tool_name);
        let alias = &tool.alias;
        out.push_str(&format!(
            "async def mcp_{alias}(**kwargs):\n    return await _call_tool({server_literal}, {tool_literal}, kwargs)\n"
        ));
    }
    out
}

/// Renders `value` as a double-quoted Python string literal. JSON string
/// escaping is a strict subset of Python's, so reusing `serde_json` here is
/// safe and avoids hand-rolling an escaper.
fn python_str_literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

const PRELUDE: &str = r#"import asyncio
import json
import os
import sys
import itertools
import types

_next_request_id = itertools.count(1)
_pending = {}
_catalog = json.loads(os.environ.get("MCP_BRIDGE_CATALOG", "[]"))
_stdout_lock = asyncio.Lock()


def _emit(frame):
    sys.__stdout__.write(json.dumps(frame) + "\n")
    sys.__stdout__.flush()


class _FramedStdout:
    """Redirects print()/sys.stdout.write() into `stdout` frames."""

    def write(self, data):
        if data:
            _emit({"kind": "stdout", "data": data})
        return len(data)

    def flush(self):
        pass


async def _reader_loop():
    loop = asyncio.get_event_loop()
    while True:
        line = await loop.run_in_executor(None, sys.__stdin__.readline)
        if not line:
            break
        line = line.strip()
        if not line:
            continue
        frame = json.loads(line)
        if frame.get("kind") == "response":
            future = _pending.pop(frame["id"], None)
            if future is not None and not future.done():
                if frame.get("ok"):
                    future.set_result(frame.get("result"))
                else:
                    error = frame.get("error") or {}
                    future.set_exception(
                        RuntimeError(error.get("message", "downstream error"))
                    )


async def _call_tool(server, tool, arguments, timeout=None):
    request_id = next(_next_request_id)
    loop = asyncio.get_event_loop()
    future = loop.create_future()
    _pending[request_id] = future
    params = {"server": server, "tool": tool, "arguments": arguments}
    if timeout is not None:
        params["timeout"] = timeout
    _emit({"kind": "request", "id": request_id, "method": "call_tool", "params": params})
    return await future


async def _runtime_request(method, params=None):
    request_id = next(_next_request_id)
    loop = asyncio.get_event_loop()
    future = loop.create_future()
    _pending[request_id] = future
    _emit({"kind": "request", "id": request_id, "method": method, "params": params or {}})
    return await future


class _RuntimeNamespace:
    async def discovered_servers(self):
        return await _runtime_request("discovered_servers")

    async def list_servers(self):
        return await _runtime_request("list_servers")

    def list_servers_sync(self):
        return sorted({entry["server"] for entry in _catalog})

    async def list_tools(self, server):
        return await _runtime_request("list_tools", {"server": server})

    def list_tools_sync(self, server):
        return [e["alias"] for e in _catalog if e["server"] == server]

    async def query_tool_docs(self, server, tool=None, detail=None):
        return await _runtime_request(
            "query_tool_docs", {"server": server, "tool": tool, "detail": detail}
        )

    def query_tool_docs_sync(self, server, tool=None):
        entries = [e for e in _catalog if e["server"] == server]
        if tool is not None:
            entries = [e for e in entries if e["tool"] == tool]
        return entries

    async def search_tool_docs(self, query, limit=None):
        return await _runtime_request("search_tool_docs", {"query": query, "limit": limit})

    def search_tool_docs_sync(self, query, limit=10):
        needle = query.lower()
        hits = [
            e
            for e in _catalog
            if needle in e["tool"].lower() or needle in e.get("description", "").lower()
        ]
        return hits[:limit]

    async def capability_summary(self):
        return await _runtime_request("capability_summary")

    async def describe_server(self, server):
        return await _runtime_request("describe_server", {"server": server})

    def list_loaded_server_metadata(self):
        return _catalog

    async def call_tool(self, server, tool, arguments=None, timeout=None):
        return await _call_tool(server, tool, arguments or {}, timeout)


runtime = _RuntimeNamespace()
mcp_servers = {}
for _entry in _catalog:
    mcp_servers.setdefault(_entry["server"], {})[_entry["tool"]] = (
        lambda server=_entry["server"], tool=_entry["tool"]: (
            lambda **kwargs: _call_tool(server, tool, kwargs)
        )
    )()


def _sanitize_identifier(name):
    """Mirrors the bridge's alias-sanitizing rule so `import mcp.<server>`
    lines up with the server names `runtime.discovered_servers()` reports."""
    out = []
    prev_sep = False
    for ch in name:
        if ch.isalnum() or ch == "_":
            out.append(ch.lower())
            prev_sep = False
        elif not prev_sep:
            out.append("_")
            prev_sep = True
    ident = "".join(out).strip("_") or "_"
    if ident[0].isdigit():
        ident = "_" + ident
    return ident


def _make_tool_fn(server, tool):
    async def _fn(**kwargs):
        return await _call_tool(server, tool, kwargs)
    return _fn


def _build_virtual_mcp_package():
    """Builds an importable `mcp` package with one submodule per loaded
    server, each exposing its tools as named async functions, so sandboxed
    code can `import mcp.<server>` and call `mcp.<server>.<tool>(**kwargs)`
    alongside the flatter `mcp_<alias>` and `mcp_servers` surfaces."""
    pkg = types.ModuleType("mcp")
    pkg.__path__ = []
    sys.modules["mcp"] = pkg
    by_server = {}
    for entry in _catalog:
        by_server.setdefault(entry["server"], []).append(entry)
    for server, entries in by_server.items():
        mod_name = _sanitize_identifier(server)
        submodule = types.ModuleType(f"mcp.{mod_name}")
        for entry in entries:
            setattr(
                submodule,
                _sanitize_identifier(entry["tool"]),
                _make_tool_fn(entry["server"], entry["tool"]),
            )
        setattr(pkg, mod_name, submodule)
        sys.modules[f"mcp.{mod_name}"] = submodule
    return pkg


mcp = _build_virtual_mcp_package()
"#;

const MAIN: &str = r#"async def _main():
    sys.stdout = _FramedStdout()
    reader = asyncio.ensure_future(_reader_loop())
    status = "ok"
    error_message = None
    try:
        await __user_main()
    except Exception as exc:  # noqa: BLE001 - surfaced as a stderr frame + done(error)
        status = "error"
        error_message = f"{type(exc).__name__}: {exc}"
        _emit({"kind": "stderr", "data": error_message + "\n"})
    finally:
        reader.cancel()
        _emit({"kind": "done", "status": status, "error": error_message})


asyncio.run(_main())
"#;
