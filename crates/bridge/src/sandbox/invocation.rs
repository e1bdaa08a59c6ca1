//! Per-call orchestrator: validates a `run_python` request, builds and spawns
//! the container, pumps framed stdio through the Host RPC Dispatcher,
//! enforces the deadline, and always removes the invocation's IPC directory.

use std::{
    collections::HashSet,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    time,
};
use tracing::warn;

use crate::{
    container,
    discovery::Discovery,
    downstream::ClientPool,
    entrypoint,
    error::BridgeError,
    frame::{DoneStatus, Frame},
    runtime::RuntimeSelector,
    sandbox::dispatcher::{self, DispatchContext},
    settings::Settings,
};

/// Short grace interval between `SIGTERM` and `SIGKILL` (also applied to a
/// normally-completed container, to bound how long teardown can take).
const SANDBOX_KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Default)]
pub struct RunPythonRequest {
    pub code: String,
    pub servers: Vec<String>,
    /// Raw seconds as received from the outer tool call; `None` uses the
    /// bridge's configured default.
    pub timeout: Option<i64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Ok,
    Error,
    Timeout,
}

#[derive(Clone, Debug)]
pub struct RunPythonOutcome {
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub servers: Vec<String>,
}

/// Orchestrates one `run_python` call against a shared pool/discovery/runtime.
pub struct Invocation<'a> {
    settings: &'a Settings,
    pool: Arc<ClientPool>,
    discovery: Arc<Discovery>,
    runtime: &'a RuntimeSelector,
}

impl<'a> Invocation<'a> {
    pub fn new(
        settings: &'a Settings,
        pool: Arc<ClientPool>,
        discovery: Arc<Discovery>,
        runtime: &'a RuntimeSelector,
    ) -> Self {
        Self {
            settings,
            pool,
            discovery,
            runtime,
        }
    }

    pub async fn run(&self, request: RunPythonRequest) -> Result<RunPythonOutcome, BridgeError> {
        let (requested_set, ordered, deadline_duration) =
            validate(&request, self.settings.timeout, self.settings.max_timeout)?;

        // Warm up every requested server concurrently before spawning the
        // sandbox. A server that's unknown or fails to start is not fatal
        // here (see the unconfigured-server Open Question decision in
        // DESIGN.md) - it's just excluded from the tool catalog below, and
        // any in-sandbox call against it surfaces as `unknown_server` at
        // dispatch time instead.
        let warm_up_failures = self.pool.ensure(&ordered).await;
        for (server, err) in &warm_up_failures {
            warn!(server = %server, error = %err, "downstream server unavailable before invocation start");
        }

        let mut tools = Vec::new();
        for server in &ordered {
            if warm_up_failures.contains_key(server) {
                continue;
            }
            match self.pool.list_tools(server).await {
                Ok(ts) => tools.extend(ts),
                Err(err) => {
                    warn!(server = %server, error = %err, "downstream server unavailable before invocation start");
                }
            }
        }

        let runtime_binary = self.runtime.acquire().await?;
        let _release_guard = ReleaseGuard(self.runtime);

        let invocation_id = uuid::Uuid::new_v4();
        let ipc_dir = self
            .settings
            .state_dir
            .join(format!("invocation-{invocation_id}"));
        tokio::fs::create_dir_all(&ipc_dir)
            .await
            .map_err(BridgeError::Io)?;
        let _ipc_guard = IpcDirGuard(ipc_dir.clone());

        // `out/` is the only part of the IPC directory bind-mounted read-write;
        // entrypoint.py itself is bind-mounted read-only (see container::build_run_args)
        // so sandboxed code can't tamper with the script that's driving it.
        tokio::fs::create_dir_all(ipc_dir.join("out"))
            .await
            .map_err(BridgeError::Io)?;

        let entrypoint_source = entrypoint::generate_entrypoint(&request.code, &tools);
        tokio::fs::write(ipc_dir.join("entrypoint.py"), entrypoint_source)
            .await
            .map_err(BridgeError::Io)?;

        let catalog = entrypoint::catalog_envelope(&tools);
        let env_vars = vec![(entrypoint::CATALOG_ENV_VAR.to_string(), catalog)];
        let args = container::build_run_args(self.settings, &ipc_dir, &env_vars);

        let mut command = Command::new(&runtime_binary);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let command_debug = format!("{command:?}");

        let mut child = command.spawn().map_err(|source| BridgeError::Spawn {
            command: command_debug,
            source,
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdin = child.stdin.take().expect("stdin was piped");

        let ctx = Arc::new(DispatchContext {
            requested_servers: requested_set,
            pool: self.pool.clone(),
            discovery: self.discovery.clone(),
        });

        let deadline = Instant::now() + deadline_duration;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ReaderEvent>();

        tokio::spawn(write_frames(stdin, writer_rx));
        tokio::spawn(read_frames(stdout, writer_tx, ctx, event_tx, deadline));
        let stderr_handle = tokio::spawn(collect_raw_stderr(stderr));

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut error_message: Option<String> = None;
        let mut status = Status::Error;
        let mut saw_done = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                status = Status::Timeout;
                break;
            }
            tokio::select! {
                _ = time::sleep(remaining) => {
                    status = Status::Timeout;
                    break;
                }
                event = event_rx.recv() => {
                    match event {
                        Some(ReaderEvent::Stdout(data)) => stdout_buf.push_str(&data),
                        Some(ReaderEvent::Stderr(data)) => stderr_buf.push_str(&data),
                        Some(ReaderEvent::Done { status: done_status, error }) => {
                            status = done_status;
                            error_message = error;
                            saw_done = true;
                            break;
                        }
                        Some(ReaderEvent::Protocol(err)) => {
                            status = Status::Error;
                            error_message = Some(err.to_string());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        terminate(&mut child, SANDBOX_KILL_GRACE).await;

        if !saw_done && matches!(status, Status::Error) {
            let raw_stderr = stderr_handle.await.unwrap_or_default();
            if !raw_stderr.trim().is_empty() {
                stderr_buf.push_str(&raw_stderr);
            }
            error_message
                .get_or_insert_with(|| "sandbox exited without a done frame".to_string());
        }

        Ok(RunPythonOutcome {
            status,
            stdout: stdout_buf,
            stderr: stderr_buf,
            error: error_message,
            servers: ordered,
        })
    }
}

struct ReleaseGuard<'a>(&'a RuntimeSelector);

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct IpcDirGuard(PathBuf);

impl Drop for IpcDirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn validate(
    request: &RunPythonRequest,
    default_timeout: Duration,
    max_timeout: Duration,
) -> Result<(HashSet<String>, Vec<String>, Duration), BridgeError> {
    if request.code.trim().is_empty() {
        return Err(BridgeError::InvalidRequest("code must not be empty".to_string()));
    }

    // Requested servers are deduplicated here but not checked against the
    // configured catalog: a server that isn't configured is still a valid
    // name to request, and surfaces as `unknown_server` from the
    // dispatcher/pool the first time the sandbox actually calls it, not as
    // an upfront rejection here.
    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    for name in &request.servers {
        if seen.insert(name.clone()) {
            ordered.push(name.clone());
        }
    }

    let timeout = match request.timeout {
        None => default_timeout,
        Some(seconds) if seconds <= 0 => {
            return Err(BridgeError::InvalidRequest(
                "timeout must be a positive number of seconds".to_string(),
            ))
        }
        Some(seconds) if seconds as u64 > max_timeout.as_secs() => {
            return Err(BridgeError::InvalidRequest(format!(
                "timeout must not exceed max_timeout ({}s)",
                max_timeout.as_secs()
            )))
        }
        Some(seconds) => Duration::from_secs(seconds as u64),
    };

    Ok((seen, ordered, timeout))
}

enum ReaderEvent {
    Stdout(String),
    Stderr(String),
    Done { status: Status, error: Option<String> },
    Protocol(BridgeError),
}

async fn read_frames(
    stdout: tokio::process::ChildStdout,
    writer_tx: mpsc::UnboundedSender<String>,
    ctx: Arc<DispatchContext>,
    event_tx: mpsc::UnboundedSender<ReaderEvent>,
    deadline: Instant,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                let _ = event_tx.send(ReaderEvent::Protocol(BridgeError::ProtocolError(
                    err.to_string(),
                )));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = match Frame::decode_line(&line) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = event_tx.send(ReaderEvent::Protocol(err));
                break;
            }
        };
        match frame {
            Frame::Stdout { data } => {
                let _ = event_tx.send(ReaderEvent::Stdout(data));
            }
            Frame::Stderr { data } => {
                let _ = event_tx.send(ReaderEvent::Stderr(data));
            }
            Frame::Done { status, error } => {
                let status = match status {
                    DoneStatus::Ok => Status::Ok,
                    DoneStatus::Error => Status::Error,
                    DoneStatus::Timeout => Status::Timeout,
                };
                let _ = event_tx.send(ReaderEvent::Done { status, error });
                break;
            }
            Frame::Request { id, method, params } => {
                let ctx = ctx.clone();
                let writer_tx = writer_tx.clone();
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::spawn(async move {
                    let response =
                        dispatcher::handle_request(id, &method, params, &ctx, remaining).await;
                    if let Ok(line) = response.encode_line() {
                        let _ = writer_tx.send(line);
                    }
                });
            }
            Frame::Response { .. } => {
                // The sandbox never sends `response` frames upstream; ignore defensively.
            }
        }
    }
}

async fn write_frames(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
    let _ = stdin.shutdown().await;
}

async fn collect_raw_stderr(stderr: tokio::process::ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut buf = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        buf.push_str(&line);
        buf.push('\n');
    }
    buf
}

async fn terminate(child: &mut Child, grace: Duration) {
    send_sigterm(child);
    if time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn has_python3() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok()
    }

    /// A stand-in for `podman`/`docker`: finds the read-only
    /// `-v <host>/entrypoint.py:/ipc/entrypoint.py:ro` bind mount among the
    /// isolation flags, exports each `--env KEY=VALUE` pair the way a real
    /// container runtime would, `cd`s into the directory holding the
    /// entrypoint, and execs the trailing `python -u /ipc/entrypoint.py`
    /// invocation against the host path.
    fn write_stub_runtime(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("stub-runtime.sh");
        let script = "#!/bin/sh\nif [ \"$1\" = version ]; then exit 0; fi\nentry_host=\"\"\nprev=\"\"\nfor arg in \"$@\"; do\n    case \"$prev\" in\n        -v)\n            case \"$arg\" in\n                *:/ipc/entrypoint.py:ro) entry_host=\"${arg%:/ipc/entrypoint.py:ro}\" ;;\n            esac\n            ;;\n        --env) export \"$arg\" ;;\n    esac\n    prev=\"$arg\"\ndone\nshift $(($#-3))\nrel=\"${3#/ipc/}\"\ncd \"$(dirname \"$entry_host\")\" && exec \"$1\" \"$2\" \"$rel\"\n";
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(script.as_bytes()).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn settings_with(state_dir: PathBuf, image: &str) -> Settings {
        Settings {
            state_dir,
            image: image.to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn unconfigured_servers_are_not_rejected_before_spawn() {
        // An unconfigured server is a valid request that reaches the sandbox
        // and fails per-call as `unknown_server`, not an upfront
        // `invalid_request`.
        let (_, ordered, _) = validate(
            &RunPythonRequest {
                code: "print(1)".to_string(),
                servers: vec!["ghost".to_string()],
                timeout: None,
            },
            Duration::from_secs(30),
            Duration::from_secs(120),
        )
        .unwrap();
        assert_eq!(ordered, vec!["ghost".to_string()]);
    }

    #[test]
    fn duplicate_servers_are_deduplicated_preserving_order() {
        let (set, ordered, _) = validate(
            &RunPythonRequest {
                code: "print(1)".to_string(),
                servers: vec!["b".to_string(), "a".to_string(), "b".to_string()],
                timeout: None,
            },
            Duration::from_secs(30),
            Duration::from_secs(120),
        )
        .unwrap();
        assert_eq!(ordered, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn empty_code_is_rejected() {
        let settings = Settings::default();
        let pool = Arc::new(ClientPool::new(vec![]));
        let discovery = Arc::new(Discovery::new(vec![], pool.clone()));
        let runtime = RuntimeSelector::new(Some("true".to_string()), Duration::from_secs(300));
        let invocation = Invocation::new(&settings, pool, discovery, &runtime);

        let err = invocation
            .run(RunPythonRequest {
                code: "   ".to_string(),
                servers: vec![],
                timeout: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let settings = Settings::default();
        let pool = Arc::new(ClientPool::new(vec![]));
        let discovery = Arc::new(Discovery::new(vec![], pool.clone()));
        let runtime = RuntimeSelector::new(Some("true".to_string()), Duration::from_secs(300));
        let invocation = Invocation::new(&settings, pool, discovery, &runtime);

        let err = invocation
            .run(RunPythonRequest {
                code: "print(1)".to_string(),
                servers: vec![],
                timeout: Some(0),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn hello_world_end_to_end() {
        if !has_python3() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let state_dir = tempfile::tempdir().unwrap();
        let runtime_dir = tempfile::tempdir().unwrap();
        let stub = write_stub_runtime(runtime_dir.path());

        let settings = settings_with(state_dir.path().to_path_buf(), "unused:latest");
        let pool = Arc::new(ClientPool::new(vec![]));
        let discovery = Arc::new(Discovery::new(vec![], pool.clone()));
        let runtime = RuntimeSelector::new(
            Some(stub.to_string_lossy().to_string()),
            Duration::from_secs(300),
        );
        let invocation = Invocation::new(&settings, pool, discovery, &runtime);

        let outcome = invocation
            .run(RunPythonRequest {
                code: "print(1 + 1)".to_string(),
                servers: vec![],
                timeout: Some(10),
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.stdout, "2\n");
        assert_eq!(outcome.stderr, "");
        let leftovers = std::fs::read_dir(state_dir.path()).unwrap().count();
        assert_eq!(leftovers, 0, "invocation IPC directory must be removed on teardown");
    }

    #[tokio::test]
    async fn timeout_kills_the_sandbox_quickly() {
        if !has_python3() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let state_dir = tempfile::tempdir().unwrap();
        let runtime_dir = tempfile::tempdir().unwrap();
        let stub = write_stub_runtime(runtime_dir.path());

        let settings = settings_with(state_dir.path().to_path_buf(), "unused:latest");
        let pool = Arc::new(ClientPool::new(vec![]));
        let discovery = Arc::new(Discovery::new(vec![], pool.clone()));
        let runtime = RuntimeSelector::new(
            Some(stub.to_string_lossy().to_string()),
            Duration::from_secs(300),
        );
        let invocation = Invocation::new(&settings, pool, discovery, &runtime);

        let started = std::time::Instant::now();
        let outcome = invocation
            .run(RunPythonRequest {
                code: "import time; time.sleep(10)".to_string(),
                servers: vec![],
                timeout: Some(1),
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, Status::Timeout);
        assert!(started.elapsed() <= Duration::from_secs(5));
    }
}
