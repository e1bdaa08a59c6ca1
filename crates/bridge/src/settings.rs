//! Bridge-wide tunables, read from environment variables (all optional, with
//! the documented defaults) using the `MCP_BRIDGE_` prefix.

use std::{path::PathBuf, time::Duration};

/// Response text-block encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputMode {
    Compact,
    TokenOriented,
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Explicit container runtime override (`podman`/`docker`); `None` selects automatically.
    pub runtime: Option<String>,
    pub image: String,
    pub timeout: Duration,
    pub max_timeout: Duration,
    pub memory_mb: u64,
    pub pids: u32,
    pub cpus: Option<f64>,
    pub container_user: String,
    pub runtime_idle_timeout: Duration,
    pub state_dir: PathBuf,
    pub output_mode: OutputMode,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime: None,
            image: "python:3.12-slim".to_string(),
            timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(120),
            memory_mb: 512,
            pids: 128,
            cpus: None,
            container_user: "65534:65534".to_string(),
            runtime_idle_timeout: Duration::from_secs(300),
            state_dir: PathBuf::from("./.mcp-bridge"),
            output_mode: OutputMode::Compact,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Reads settings from `MCP_BRIDGE_*` environment variables, falling back
    /// to [`Settings::default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            runtime: env_string("RUNTIME"),
            image: env_string("IMAGE").unwrap_or(defaults.image),
            timeout: env_secs("TIMEOUT").unwrap_or(defaults.timeout),
            max_timeout: env_secs("MAX_TIMEOUT").unwrap_or(defaults.max_timeout),
            memory_mb: env_u64("MEMORY").unwrap_or(defaults.memory_mb),
            pids: env_u64("PIDS").map(|v| v as u32).unwrap_or(defaults.pids),
            cpus: env_string("CPUS").and_then(|v| v.parse().ok()),
            container_user: env_string("CONTAINER_USER").unwrap_or(defaults.container_user),
            runtime_idle_timeout: env_secs("RUNTIME_IDLE_TIMEOUT")
                .unwrap_or(defaults.runtime_idle_timeout),
            state_dir: env_string("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            output_mode: match env_string("OUTPUT_MODE").as_deref() {
                Some("token-oriented") => OutputMode::TokenOriented,
                _ => OutputMode::Compact,
            },
            log_level: env_string("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

fn env_string(suffix: &str) -> Option<String> {
    std::env::var(format!("MCP_BRIDGE_{suffix}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_u64(suffix: &str) -> Option<u64> {
    env_string(suffix).and_then(|v| v.parse().ok())
}

fn env_secs(suffix: &str) -> Option<Duration> {
    env_u64(suffix).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.max_timeout, Duration::from_secs(120));
        assert_eq!(settings.memory_mb, 512);
        assert_eq!(settings.pids, 128);
        assert_eq!(settings.container_user, "65534:65534");
        assert_eq!(settings.runtime_idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.output_mode, OutputMode::Compact);
    }
}
