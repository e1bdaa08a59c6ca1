//! Resolves which container binary to use (`podman` or `docker`), and tracks
//! an optional VM warm/idle-shutdown cycle for runtimes that need one
//! (rootless Podman on machines without native container support).

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info};

use crate::error::BridgeError;

/// Probe order when no explicit override is configured.
const CANDIDATES: [&str; 2] = ["podman", "docker"];

/// Resolves and, if necessary, warms up the container runtime binary.
pub struct RuntimeSelector {
    override_binary: Option<String>,
    idle_timeout: Duration,
    resolved: Mutex<Option<String>>,
    outstanding: AtomicU32,
    last_idle_at: AtomicU64,
    vm_started: Mutex<bool>,
}

impl RuntimeSelector {
    pub fn new(override_binary: Option<String>, idle_timeout: Duration) -> Self {
        Self {
            override_binary,
            idle_timeout,
            resolved: Mutex::new(None),
            outstanding: AtomicU32::new(0),
            last_idle_at: AtomicU64::new(now_secs()),
            vm_started: Mutex::new(false),
        }
    }

    /// Returns the resolved runtime binary name, probing candidates in order
    /// and retrying the version probe once on failure.
    pub async fn resolve(&self) -> Result<String, BridgeError> {
        if let Some(cached) = self.resolved.lock().await.clone() {
            return Ok(cached);
        }

        if let Some(explicit) = &self.override_binary {
            if probe_with_retry(explicit).await {
                *self.resolved.lock().await = Some(explicit.clone());
                return Ok(explicit.clone());
            }
            return Err(BridgeError::RuntimeUnavailable(format!(
                "configured runtime `{explicit}` did not respond to a version probe"
            )));
        }

        for candidate in CANDIDATES {
            if probe_with_retry(candidate).await {
                *self.resolved.lock().await = Some(candidate.to_string());
                return Ok(candidate.to_string());
            }
        }

        Err(BridgeError::RuntimeUnavailable(
            "no container runtime (podman or docker) answered a version probe".to_string(),
        ))
    }

    /// Marks the start of an invocation that will use the runtime; warms the
    /// VM on first use.
    pub async fn acquire(&self) -> Result<String, BridgeError> {
        let binary = self.resolve().await?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.maybe_warm_up(&binary).await;
        Ok(binary)
    }

    /// Marks the end of an invocation's use of the runtime.
    pub fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.last_idle_at.store(now_secs(), Ordering::SeqCst);
    }

    /// True once `idle_timeout` has elapsed with zero outstanding invocations
    /// since the last one finished; callers use this to decide whether to
    /// issue a VM shutdown.
    pub fn idle_expired(&self) -> bool {
        if self.outstanding.load(Ordering::SeqCst) > 0 {
            return false;
        }
        now_secs().saturating_sub(self.last_idle_at.load(Ordering::SeqCst))
            >= self.idle_timeout.as_secs()
    }

    async fn maybe_warm_up(&self, binary: &str) {
        if binary != "podman" {
            return;
        }
        let mut started = self.vm_started.lock().await;
        if *started {
            return;
        }
        if Command::new("podman")
            .args(["machine", "start"])
            .output()
            .await
            .is_ok()
        {
            info!("started podman machine for sandbox runtime");
        } else {
            debug!("podman machine start failed or unnecessary on this host");
        }
        *started = true;
    }

    /// Issues an idle shutdown of the warmed VM, if one was started.
    pub async fn idle_shutdown(&self) {
        let mut started = self.vm_started.lock().await;
        if !*started {
            return;
        }
        let _ = Command::new("podman")
            .args(["machine", "stop"])
            .output()
            .await;
        *started = false;
    }
}

async fn probe_with_retry(binary: &str) -> bool {
    if probe_once(binary).await {
        return true;
    }
    probe_once(binary).await
}

async fn probe_once(binary: &str) -> bool {
    Command::new(binary)
        .arg("version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_override_of_missing_binary_is_runtime_unavailable() {
        let selector = RuntimeSelector::new(
            Some("definitely-not-a-real-container-runtime".to_string()),
            Duration::from_secs(300),
        );
        let err = selector.resolve().await.unwrap_err();
        assert_eq!(err.kind(), "runtime_unavailable");
        assert!(matches!(err, BridgeError::RuntimeUnavailable(_)));
    }

    #[tokio::test]
    async fn acquire_release_tracks_outstanding_count() {
        // `true` always succeeds, standing in for a runtime binary during the probe.
        let selector = RuntimeSelector::new(Some("true".to_string()), Duration::from_millis(1));
        let binary = selector.acquire().await.unwrap();
        assert_eq!(binary, "true");
        assert!(!selector.idle_expired());
        selector.release();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(selector.idle_expired());
    }
}
