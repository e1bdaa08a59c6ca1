//! Lifecycle of downstream clients: lazy start, restart-once-on-failure, and
//! graceful shutdown. Grounded on the connection-manager reference pattern of
//! spawning per-server tasks concurrently via a `JoinSet` and aggregating
//! errors by server name.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::warn;

use crate::{
    config::ServerRecord,
    downstream::client::{ClientState, DownstreamClient},
    error::BridgeError,
    tool::ToolDescriptor,
};

/// Grace period given to a downstream server's `shutdown`/`exit` handshake
/// before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Registry of downstream clients, keyed by server name, shared across
/// sandbox invocations.
pub struct ClientPool {
    clients: HashMap<String, Arc<DownstreamClient>>,
}

impl ClientPool {
    pub fn new(records: Vec<ServerRecord>) -> Self {
        let clients = records
            .into_iter()
            .map(|record| (record.name.clone(), Arc::new(DownstreamClient::new(record))))
            .collect();
        Self { clients }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<DownstreamClient>> {
        self.clients.get(name).cloned()
    }

    /// Starts every named client concurrently. Names not present in the pool
    /// are reported (not started); other failures are reported per-name too.
    pub async fn ensure(&self, names: &[String]) -> HashMap<String, BridgeError> {
        let mut missing = HashMap::new();
        let mut join_set = JoinSet::new();

        for name in names {
            match self.clients.get(name) {
                Some(client) => {
                    let client = client.clone();
                    let name = name.clone();
                    join_set.spawn(async move { (name, client.start().await) });
                }
                None => {
                    missing.insert(name.clone(), BridgeError::UnknownServer(name.clone()));
                }
            }
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    let _ = name;
                }
                Ok((name, Err(err))) => {
                    missing.insert(name, err);
                }
                Err(join_err) => {
                    warn!("client start task panicked: {join_err}");
                }
            }
        }

        missing
    }

    /// Returns a ready client, restarting it once if it has failed.
    pub async fn get(&self, name: &str) -> Result<Arc<DownstreamClient>, BridgeError> {
        let client = self
            .clients
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownServer(name.to_string()))?;

        if client.state().await == ClientState::Ready {
            return Ok(client);
        }

        // One automatic restart attempt before surfacing the failure.
        client.start().await?;
        Ok(client)
    }

    /// Forwards a `tools/call` to the named downstream client, restarting it
    /// once on failure before surfacing `downstream_unavailable`.
    pub async fn call(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Value, BridgeError> {
        let client = self.get(name).await?;
        match client.call(tool, arguments.clone(), deadline).await {
            Ok(result) => Ok(result),
            Err(BridgeError::DownstreamUnavailable { .. }) => {
                client.start().await?;
                client.call(tool, arguments, deadline).await
            }
            Err(other) => Err(other),
        }
    }

    pub async fn list_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, BridgeError> {
        let client = self
            .clients
            .get(name)
            .ok_or_else(|| BridgeError::UnknownServer(name.to_string()))?;
        client.list_tools().await
    }

    /// Concurrently closes every started client within a global grace period.
    pub async fn shutdown(&self) {
        let mut join_set = JoinSet::new();
        for client in self.clients.values() {
            let client = client.clone();
            join_set.spawn(async move { client.close(SHUTDOWN_GRACE).await });
        }
        while join_set.join_next().await.is_some() {}
    }
}
