//! Builds the argument vector for one container invocation, enforcing the
//! documented isolation policy: no network, read-only root, all capabilities
//! dropped, no-new-privileges, an unprivileged user, resource limits, tmpfs
//! scratch space, and the IPC directory bound in for the entrypoint.
//!
//! The IPC directory is split across two bind mounts rather than one: the
//! entrypoint script is mounted read-only so sandboxed code can't overwrite
//! or delete the file driving it, and a separate `out/` subdirectory is
//! mounted read-write for any result files the entrypoint chooses to emit.

use std::path::Path;

use crate::settings::Settings;

/// Builds `podman`/`docker`-compatible `run` arguments for one sandbox
/// invocation. `runtime_binary` only affects flag compatibility in principle;
/// both runtimes accept the flags used here.
pub fn build_run_args(
    settings: &Settings,
    ipc_dir: &Path,
    env_vars: &[(String, String)],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--network".to_string(),
        "none".to_string(),
        "--read-only".to_string(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "--user".to_string(),
        settings.container_user.clone(),
        "--memory".to_string(),
        format!("{}m", settings.memory_mb),
        "--pids-limit".to_string(),
        settings.pids.to_string(),
    ];

    if let Some(cpus) = settings.cpus {
        args.push("--cpus".to_string());
        args.push(format!("{cpus}"));
    }

    args.push("--tmpfs".to_string());
    args.push("/tmp:noexec".to_string());
    args.push("--tmpfs".to_string());
    args.push("/work:noexec".to_string());
    args.push("--workdir".to_string());
    args.push("/work".to_string());

    args.push("-v".to_string());
    args.push(format!(
        "{}:/ipc/entrypoint.py:ro",
        ipc_dir.join("entrypoint.py").display()
    ));
    args.push("-v".to_string());
    args.push(format!("{}:/ipc/out:rw", ipc_dir.join("out").display()));

    for (key, value) in env_vars {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push(settings.image.clone());
    args.push("python".to_string());
    args.push("-u".to_string());
    args.push("/ipc/entrypoint.py".to_string());

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn enforces_documented_isolation_flags() {
        let settings = Settings::default();
        let args = build_run_args(&settings, &PathBuf::from("/tmp/ipc-1"), &[]);
        assert!(args.contains(&"--network".to_string()));
        assert!(args.contains(&"none".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"ALL".to_string()));
        assert!(args.contains(&"no-new-privileges".to_string()));
        assert!(args.contains(&"65534:65534".to_string()));
        assert!(args.iter().any(|a| a == "512m"));
        assert!(args.last().unwrap() == "/ipc/entrypoint.py");
    }

    #[test]
    fn entrypoint_mount_is_read_only_and_out_mount_is_read_write() {
        let settings = Settings::default();
        let args = build_run_args(&settings, &PathBuf::from("/tmp/ipc-3"), &[]);
        assert!(args.contains(&"/tmp/ipc-3/entrypoint.py:/ipc/entrypoint.py:ro".to_string()));
        assert!(args.contains(&"/tmp/ipc-3/out:/ipc/out:rw".to_string()));
        assert!(!args.iter().any(|a| a.contains(":/ipc:rw")));
    }

    #[test]
    fn passes_declared_env_vars_only() {
        let settings = Settings::default();
        let args = build_run_args(
            &settings,
            &PathBuf::from("/tmp/ipc-2"),
            &[("MCP_BRIDGE_CATALOG".to_string(), "{}".to_string())],
        );
        assert!(args.contains(&"MCP_BRIDGE_CATALOG={}".to_string()));
    }
}
