//! Hypervisor process supervision.
//!
//! [`Supervisor::start`] compiles a configuration, spawns the hypervisor and
//! hands back an [`InstanceHandle`] straight away. A background task owns the
//! child process, the cloud-init directory and the socket files: it waits for
//! exit, removes those resources and then fires the completion signal.
//! [`Supervisor::attach`] does the same for a process started elsewhere by
//! polling its pid.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use qvm_core::{HostPlatform, InstanceId};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::args::ArgsCompiler;
use crate::binary::which_binary;
use crate::config::{InstanceConfig, SocketPaths};
use crate::handle::{check_alive, Completion, InstanceHandle, InstanceState};
use crate::ExecutorError;

/// How often an attached process is checked for liveness.
pub const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the hypervisor's stdout and stderr go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdioMode {
    /// Discard both streams.
    #[default]
    Null,
    /// Append to the given files, creating them if needed.
    Files { stdout: PathBuf, stderr: PathBuf },
    /// Deliver trimmed, non-empty lines on the handle's receivers.
    Lines,
}

/// Starts and watches hypervisor processes.
#[derive(Debug)]
pub struct Supervisor {
    binary: PathBuf,
    compiler: ArgsCompiler,
}

impl Supervisor {
    /// Create a supervisor for the given hypervisor binary.
    ///
    /// A bare name is looked up on `PATH` at start time.
    #[must_use]
    pub fn new(binary: PathBuf, compiler: ArgsCompiler) -> Self {
        Self { binary, compiler }
    }

    /// Supervisor using the host's `qemu-system-*` binary and tools.
    #[must_use]
    pub fn for_host(host: &HostPlatform) -> Self {
        Self::new(PathBuf::from(host.qemu_binary()), ArgsCompiler::for_host(host))
    }

    /// Replace the hypervisor binary.
    #[must_use]
    pub fn with_binary(mut self, binary: PathBuf) -> Self {
        self.binary = binary;
        self
    }

    /// Compile `config`, spawn the hypervisor and return its handle.
    ///
    /// Returns as soon as the process is spawned; use
    /// [`InstanceHandle::wait`] to observe its exit.
    ///
    /// # Errors
    /// - [`ExecutorError::BinaryNotFound`] before anything is created.
    /// - Any compile error from [`ArgsCompiler::compile`].
    /// - [`ExecutorError::Io`] if a stale socket or an output file cannot be
    ///   handled.
    /// - [`ExecutorError::SpawnFailed`] if the process cannot be started.
    pub async fn start(
        &self,
        config: &InstanceConfig,
        stdio: StdioMode,
    ) -> Result<InstanceHandle, ExecutorError> {
        let binary = which_binary(&self.binary)?;
        let (args, cloud_init_dir) = self.compiler.compile(config).await?.into_parts();
        let sockets = config.socket_paths();
        let id = config.id.clone();

        let mut child = match spawn(&binary, &args, &sockets, &stdio).await {
            Ok(child) => child,
            Err(e) => {
                remove_dir(&id, &cloud_init_dir).await;
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            remove_dir(&id, &cloud_init_dir).await;
            return Err(ExecutorError::SpawnFailed(
                "process exited before its pid could be read".to_owned(),
            ));
        };

        tracing::info!(instance = %id, pid, binary = %binary.display(), "instance started");

        let (tx, completion) = Completion::channel();
        let mut handle = InstanceHandle::new(id.clone(), pid, sockets.clone(), completion);

        if stdio == StdioMode::Lines {
            match (child.stdout.take(), child.stderr.take()) {
                (Some(stdout), Some(stderr)) => {
                    handle = handle.with_lines(forward_lines(stdout), forward_lines(stderr));
                }
                _ => tracing::warn!(instance = %id, "output pipes unavailable, line mode disabled"),
            }
        }

        tokio::spawn(watch_child(child, id, pid, Some(cloud_init_dir), sockets, tx));

        Ok(handle)
    }

    /// Watch a hypervisor process that was started elsewhere.
    ///
    /// Must be called from within a Tokio runtime. The returned handle's
    /// completion fires once the pid disappears and the sockets are removed.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ProcessLookup`] if `pid` does not exist.
    pub fn attach(
        pid: u32,
        id: InstanceId,
        sockets: SocketPaths,
    ) -> Result<InstanceHandle, ExecutorError> {
        check_alive(pid)?;

        let (tx, completion) = Completion::channel();
        let poller = tokio::spawn(poll_pid(pid, id.clone(), sockets.clone(), tx));

        tracing::info!(instance = %id, pid, "attached to instance");

        Ok(InstanceHandle::new(id, pid, sockets, completion).with_poller(poller))
    }
}

async fn spawn(
    binary: &Path,
    args: &[String],
    sockets: &SocketPaths,
    stdio: &StdioMode,
) -> Result<Child, ExecutorError> {
    remove_stale_sockets(sockets).await?;

    let mut command = Command::new(binary);
    command.args(args).stdin(Stdio::null()).process_group(0);
    match stdio {
        StdioMode::Null => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        StdioMode::Files { stdout, stderr } => {
            command
                .stdout(open_append(stdout).await?)
                .stderr(open_append(stderr).await?);
        }
        StdioMode::Lines => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }

    command
        .spawn()
        .map_err(|e| ExecutorError::SpawnFailed(format!("exec {}: {e}", binary.display())))
}

async fn open_append(path: &Path) -> Result<Stdio, ExecutorError> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(Stdio::from(file.into_std().await))
}

async fn remove_stale_sockets(sockets: &SocketPaths) -> Result<(), ExecutorError> {
    for path in [&sockets.qmp, &sockets.qga] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn forward_lines<R>(stream: R) -> mpsc::UnboundedReceiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        // Keep draining after the receiver is gone so the child never blocks
        // on a full pipe.
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() {
                let _ = tx.send(line.to_owned());
            }
        }
    });
    rx
}

async fn watch_child(
    mut child: Child,
    id: InstanceId,
    pid: u32,
    cloud_init_dir: Option<PathBuf>,
    sockets: SocketPaths,
    done: watch::Sender<InstanceState>,
) {
    let waited = child.wait().await;
    // The pid is free for reuse from here on.
    done.send_replace(InstanceState::Exited);
    match waited {
        Ok(status) if status.success() => tracing::info!(instance = %id, pid, "instance exited"),
        Ok(status) => tracing::warn!(instance = %id, pid, %status, "instance exited with failure"),
        Err(e) => tracing::error!(instance = %id, pid, error = %e, "failed to wait for instance"),
    }
    cleanup(&id, cloud_init_dir.as_deref(), &sockets).await;
    done.send_replace(InstanceState::Completed);
}

async fn poll_pid(
    pid: u32,
    id: InstanceId,
    sockets: SocketPaths,
    done: watch::Sender<InstanceState>,
) {
    let mut ticker = tokio::time::interval(ATTACH_POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if check_alive(pid).is_err() {
            break;
        }
    }
    done.send_replace(InstanceState::Exited);
    tracing::info!(instance = %id, pid, "attached instance exited");
    cleanup(&id, None, &sockets).await;
    done.send_replace(InstanceState::Completed);
}

async fn cleanup(id: &InstanceId, cloud_init_dir: Option<&Path>, sockets: &SocketPaths) {
    if let Some(dir) = cloud_init_dir {
        remove_dir(id, dir).await;
    }
    for path in [&sockets.qmp, &sockets.qga] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(instance = %id, path = %path.display(), error = %e, "failed to remove socket"),
        }
    }
}

async fn remove_dir(id: &InstanceId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(instance = %id, path = %dir.display(), error = %e, "failed to remove cloud-init directory"),
    }
}
