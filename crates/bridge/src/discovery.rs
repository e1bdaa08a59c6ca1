//! Answers discovery queries from pool metadata without requiring every
//! downstream server to be started, except `query_tool_docs` for a
//! not-yet-loaded server, which starts it just in time.

use std::sync::Arc;

use serde::Serialize;

use crate::{config::ServerRecord, downstream::ClientPool, error::BridgeError, tool::ToolDescriptor};

#[derive(Clone, Debug, Serialize)]
pub struct ToolDocSummary {
    pub server: String,
    pub tool: String,
    pub alias: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DocDetail {
    Summary,
    Full,
}

pub struct Discovery {
    servers: Vec<ServerRecord>,
    pool: Arc<ClientPool>,
}

impl Discovery {
    pub fn new(servers: Vec<ServerRecord>, pool: Arc<ClientPool>) -> Self {
        Self { servers, pool }
    }

    /// All known server names, in configuration order.
    pub fn discovered_servers(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Servers that can currently be requested by a sandbox invocation.
    pub fn list_servers(&self) -> Vec<String> {
        // No server is "permanently broken" in this implementation; a failed
        // client still restarts on next reference, so every known server is
        // requestable.
        self.discovered_servers()
    }

    pub async fn list_tools(&self, server: &str) -> Result<Vec<String>, BridgeError> {
        let tools = self.pool.list_tools(server).await?;
        Ok(tools.into_iter().map(|t| t.alias).collect())
    }

    pub async fn query_tool_docs(
        &self,
        server: &str,
        tool: Option<&str>,
        detail: DocDetail,
    ) -> Result<Vec<ToolDocSummary>, BridgeError> {
        let tools = self.pool.list_tools(server).await?;
        Ok(tools
            .into_iter()
            .filter(|t| match tool {
                Some(wanted) => wanted == t.tool_name || wanted == t.alias,
                None => true,
            })
            .map(|t| to_summary(t, detail))
            .collect())
    }

    pub async fn search_tool_docs(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ToolDocSummary>, BridgeError> {
        let needle = query.to_lowercase();
        let mut scored: Vec<(u32, usize, usize, ToolDocSummary)> = Vec::new();

        for (server_idx, record) in self.servers.iter().enumerate() {
            let tools = match self.pool.list_tools(&record.name).await {
                Ok(tools) => tools,
                Err(_) => continue,
            };
            for (tool_idx, tool) in tools.into_iter().enumerate() {
                let score = match_score(&needle, &tool);
                if score > 0 {
                    scored.push((score, server_idx, tool_idx, to_summary(tool, DocDetail::Summary)));
                }
            }
        }

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        Ok(scored.into_iter().take(limit).map(|(_, _, _, s)| s).collect())
    }

    pub async fn describe_server(
        &self,
        server: &str,
    ) -> Result<(ServerRecord, Vec<ToolDescriptor>), BridgeError> {
        let record = self
            .servers
            .iter()
            .find(|s| s.name == server)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownServer(server.to_string()))?;
        let tools = self.pool.list_tools(server).await?;
        Ok((record, tools))
    }

    pub fn capability_summary(&self) -> String {
        format!(
            "This bridge exposes run_python, a single tool that executes a Python snippet \
             inside an isolated, networkless container. The snippet reaches {} configured \
             downstream MCP server(s) through proxy functions (mcp_<alias>(**kwargs)) and a \
             `runtime` namespace with sync (cache-only) and async (roundtrip) discovery \
             helpers: discovered_servers, list_servers, list_tools, query_tool_docs, \
             search_tool_docs, capability_summary, describe_server, call_tool. Tool schemas are \
             not preloaded into this summary; call query_tool_docs or search_tool_docs for them.",
            self.servers.len()
        )
    }
}

fn to_summary(tool: ToolDescriptor, detail: DocDetail) -> ToolDocSummary {
    ToolDocSummary {
        server: tool.server_name,
        tool: tool.tool_name,
        alias: tool.alias,
        description: tool.description,
        input_schema: (detail == DocDetail::Full).then_some(tool.input_schema),
    }
}

fn match_score(needle: &str, tool: &ToolDescriptor) -> u32 {
    let name = tool.tool_name.to_lowercase();
    let desc = tool.description.to_lowercase();
    let mut score = 0;
    if name == needle {
        score += 100;
    } else if name.contains(needle) {
        score += 50;
    }
    if desc.contains(needle) {
        score += 10;
    }
    let token_overlap = needle
        .split_whitespace()
        .filter(|word| name.contains(word) || desc.contains(word))
        .count();
    score + token_overlap as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_servers_preserves_configuration_order() {
        let servers = vec![
            ServerRecord {
                name: "b".to_string(),
                command: "true".to_string(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
            ServerRecord {
                name: "a".to_string(),
                command: "true".to_string(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
        ];
        let pool = Arc::new(ClientPool::new(servers.clone()));
        let discovery = Discovery::new(servers, pool);
        assert_eq!(discovery.discovered_servers(), vec!["b", "a"]);
    }

    #[test]
    fn match_score_prefers_exact_name() {
        let tool = ToolDescriptor {
            server_name: "s".to_string(),
            tool_name: "echo".to_string(),
            alias: "echo".to_string(),
            description: "repeats text back".to_string(),
            input_schema: serde_json::json!({}),
        };
        assert!(match_score("echo", &tool) > match_score("repeats", &tool));
        assert_eq!(match_score("nonexistent", &tool), 0);
    }
}
