//! Server records: the flat, immutable catalog of downstream MCP servers the
//! bridge may launch. Discovery and parsing of the files themselves is an
//! external collaborator in the full system; this module only owns the
//! resulting data and the precedence rule for merging several files.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::BridgeError;

/// One configured downstream MCP server.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerRecord {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct ServerFile {
    #[serde(default, rename = "server")]
    servers: Vec<ServerRecord>,
}

/// Loads and merges `[[server]]` tables from each path in order.
///
/// Servers are keyed by name; a later file's record for a name completely
/// replaces an earlier one (last-wins), and no further deduplication is
/// attempted. The returned order is first-seen-position order, which keeps
/// `discovered_servers()` stable across config edits that only change values.
pub fn load_servers(paths: &[PathBuf]) -> Result<Vec<ServerRecord>, BridgeError> {
    let mut by_name: HashMap<String, ServerRecord> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for path in paths {
        let text = std::fs::read_to_string(path).map_err(|source| BridgeError::Config {
            path: path.clone(),
            source: Box::new(source),
        })?;
        let file: ServerFile = toml::from_str(&text).map_err(|source| BridgeError::Config {
            path: path.clone(),
            source: Box::new(source),
        })?;
        for record in file.servers {
            if !by_name.contains_key(&record.name) {
                order.push(record.name.clone());
            }
            by_name.insert(record.name.clone(), record);
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect())
}

/// Builds a [`ServerRecord`] map keyed by name, preserving insertion order via
/// the caller's `Vec` ordering.
pub fn index_by_name(records: &[ServerRecord]) -> HashMap<String, ServerRecord> {
    records
        .iter()
        .map(|record| (record.name.clone(), record.clone()))
        .collect()
}

/// Test/demo helper: load a single inline TOML document instead of a file.
pub fn parse_servers(text: &str, origin: &Path) -> Result<Vec<ServerRecord>, BridgeError> {
    let file: ServerFile = toml::from_str(text).map_err(|source| BridgeError::Config {
        path: origin.to_path_buf(),
        source: Box::new(source),
    })?;
    Ok(file.servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn last_file_wins_on_name_collision() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.toml");
        let b = dir.path().join("b.toml");
        std::fs::File::create(&a)
            .unwrap()
            .write_all(br#"[[server]]
name = "stub"
command = "node"
args = ["a.js"]
"#)
            .unwrap();
        std::fs::File::create(&b)
            .unwrap()
            .write_all(br#"[[server]]
name = "stub"
command = "node"
args = ["b.js"]

[[server]]
name = "other"
command = "python3"
"#)
            .unwrap();

        let servers = load_servers(&[a, b]).unwrap();
        assert_eq!(servers.len(), 2);
        let stub = servers.iter().find(|s| s.name == "stub").unwrap();
        assert_eq!(stub.args, vec!["b.js".to_string()]);
    }

    #[test]
    fn parse_servers_defaults_env_and_args() {
        let servers = parse_servers(
            r#"[[server]]
name = "stub"
command = "node"
"#,
            Path::new("<inline>"),
        )
        .unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].args.is_empty());
        assert!(servers[0].env.is_empty());
    }
}
