//! Instance handle: a running (or attached) hypervisor process.

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use qvm_core::InstanceId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SocketPaths;
use crate::ExecutorError;

/// Lifecycle of a supervised process as seen by its watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    /// The process has been reaped; cleanup may still be in progress. Its
    /// pid must not be signalled any more.
    Exited,
    /// Exited and cleaned up.
    Completed,
}

/// Fires once when the instance has exited and its resources are cleaned up.
///
/// Clones observe the same signal; waiting on any of them is cancel safe.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<InstanceState>,
}

impl Completion {
    /// Returns the completion and the sender the watcher drives.
    pub(crate) fn channel() -> (watch::Sender<InstanceState>, Self) {
        let (tx, rx) = watch::channel(InstanceState::Running);
        (tx, Self { rx })
    }

    /// Resolves once the instance is done or nothing can report it any more.
    ///
    /// Returns `true` if the instance completed, `false` if its watcher went
    /// away first (an attached handle was dropped, or the runtime is shutting
    /// down). In the latter case the process may well still be running.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        let completed = rx
            .wait_for(|state| *state == InstanceState::Completed)
            .await
            .is_ok();
        completed
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        *self.rx.borrow()
    }

    /// Returns `true` once the instance has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() == InstanceState::Completed
    }
}

/// A handle to a hypervisor process started or attached by the supervisor.
///
/// Dropping a handle does not stop the process. For a started process the
/// background watcher keeps running so cleanup still happens; for an attached
/// one the poll watcher is aborted and outstanding [`Completion`] waiters
/// return `false`.
#[derive(Debug)]
#[non_exhaustive]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub pid: u32,
    pub sockets: SocketPaths,
    pub created_at: DateTime<Utc>,
    completion: Completion,
    stdout: Option<mpsc::UnboundedReceiver<String>>,
    stderr: Option<mpsc::UnboundedReceiver<String>>,
    poller: Option<JoinHandle<()>>,
}

impl InstanceHandle {
    pub(crate) fn new(id: InstanceId, pid: u32, sockets: SocketPaths, completion: Completion) -> Self {
        Self {
            id,
            pid,
            sockets,
            created_at: Utc::now(),
            completion,
            stdout: None,
            stderr: None,
            poller: None,
        }
    }

    pub(crate) fn with_lines(
        mut self,
        stdout: mpsc::UnboundedReceiver<String>,
        stderr: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }

    pub(crate) fn with_poller(mut self, poller: JoinHandle<()>) -> Self {
        self.poller = Some(poller);
        self
    }

    /// A clonable view of the completion signal.
    #[must_use]
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Wait until the process has exited and cleanup has finished.
    ///
    /// See [`Completion::wait`] for the meaning of the result; while this
    /// handle is alive its watcher is too, so it only returns `false` when
    /// the runtime is going away.
    pub async fn wait(&self) -> bool {
        self.completion.wait().await
    }

    /// `false` as soon as the process has been reaped, before cleanup ends.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.completion.state() == InstanceState::Running
    }

    /// Take the stdout line receiver. `None` unless started in line mode, or
    /// if already taken.
    pub fn take_stdout(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stdout.take()
    }

    /// Take the stderr line receiver.
    pub fn take_stderr(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.stderr.take()
    }

    /// Ask the process to shut down with `SIGTERM`. Does not wait.
    ///
    /// # Errors
    /// Returns [`ExecutorError::ProcessLookup`] if the instance has already
    /// exited (the pid may have been reused) or the process is gone.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        if !self.is_running() {
            return Err(ExecutorError::ProcessLookup {
                pid: self.pid,
                reason: "instance has already exited".to_owned(),
            });
        }
        tracing::info!(instance = %self.id, pid = self.pid, "stopping instance");
        stop_pid(self.pid)
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

fn to_pid(pid: u32) -> Result<Pid, ExecutorError> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| ExecutorError::ProcessLookup {
            pid,
            reason: "not a valid process id".to_owned(),
        })
}

fn lookup_error(pid: u32, errno: Errno) -> ExecutorError {
    ExecutorError::ProcessLookup {
        pid,
        reason: errno.desc().to_owned(),
    }
}

/// Send `SIGTERM` to `pid`.
///
/// # Errors
/// Returns [`ExecutorError::ProcessLookup`] if no such process exists, or
/// [`ExecutorError::Io`] for any other signalling failure.
pub fn stop_pid(pid: u32) -> Result<(), ExecutorError> {
    match signal::kill(to_pid(pid)?, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(lookup_error(pid, Errno::ESRCH)),
        Err(errno) => Err(ExecutorError::Io(errno.into())),
    }
}

/// Check that `pid` exists by sending it signal 0.
///
/// `EPERM` means the process exists but belongs to someone else, which still
/// counts as alive.
pub(crate) fn check_alive(pid: u32) -> Result<(), ExecutorError> {
    match signal::kill(to_pid(pid)?, None::<Signal>) {
        Ok(()) | Err(Errno::EPERM) => Ok(()),
        Err(errno) => Err(lookup_error(pid, errno)),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    fn handle_for(pid: u32, completion: Completion) -> InstanceHandle {
        let id = match InstanceId::new("handle-test") {
            Ok(id) => id,
            Err(e) => panic!("bad id: {e}"),
        };
        let sockets = SocketPaths {
            qmp: PathBuf::from("/tmp/handle-test.sock"),
            qga: PathBuf::from("/tmp/qga-handle-test.sock"),
        };
        InstanceHandle::new(id, pid, sockets, completion)
    }

    fn handle(completion: Completion) -> InstanceHandle {
        handle_for(u32::MAX, completion)
    }

    #[tokio::test]
    async fn completion_fires_for_every_clone() {
        let (tx, completion) = Completion::channel();
        let a = completion.clone();
        let b = completion.clone();
        assert!(!a.is_done());

        let waiter = tokio::spawn(async move { b.wait().await });
        let _ = tx.send(InstanceState::Exited);
        assert!(!a.is_done(), "reaped is not yet completed");
        let _ = tx.send(InstanceState::Completed);

        assert!(a.wait().await);
        match tokio::time::timeout(Duration::from_secs(1), waiter).await {
            Ok(Ok(true)) => {}
            other => panic!("second observer did not complete: {other:?}"),
        }
        assert!(completion.is_done());
    }

    #[tokio::test]
    async fn completion_without_observers_does_not_block_sender() {
        let (tx, completion) = Completion::channel();
        drop(completion);
        assert!(tx.send(InstanceState::Completed).is_err(), "no receivers left");
    }

    #[tokio::test]
    async fn dropped_sender_releases_waiters_as_cancelled() {
        let (tx, completion) = Completion::channel();
        drop(tx);
        match tokio::time::timeout(Duration::from_secs(1), completion.wait()).await {
            Ok(completed) => assert!(!completed, "a vanished watcher is not a completion"),
            Err(_) => panic!("waiter was not released"),
        }
        assert!(!completion.is_done());
    }

    #[test]
    fn stop_after_completion_is_lookup_error_without_signal() {
        let (tx, completion) = Completion::channel();
        let _ = tx.send(InstanceState::Completed);
        let handle = handle(completion);
        assert!(!handle.is_running());
        assert!(matches!(handle.stop(), Err(ExecutorError::ProcessLookup { .. })));
    }

    #[tokio::test]
    async fn stop_after_reap_does_not_signal_the_pid() {
        let mut child = match tokio::process::Command::new("sleep").arg("30").spawn() {
            Ok(child) => child,
            Err(e) => panic!("spawn sleep: {e}"),
        };
        let pid = match child.id() {
            Some(pid) => pid,
            None => panic!("sleep has no pid"),
        };

        // Stand-in for a reaped process whose pid now belongs to `sleep`.
        let (tx, completion) = Completion::channel();
        let _ = tx.send(InstanceState::Exited);
        let handle = handle_for(pid, completion);
        assert!(!handle.is_running());
        assert!(matches!(handle.stop(), Err(ExecutorError::ProcessLookup { .. })));

        assert!(check_alive(pid).is_ok(), "sleep must not have been signalled");
        assert!(matches!(child.try_wait(), Ok(None)));
        let _ = child.kill().await;
    }

    #[test]
    fn out_of_range_pid_is_lookup_error() {
        assert!(matches!(stop_pid(0), Err(ExecutorError::ProcessLookup { pid: 0, .. })));
        assert!(matches!(stop_pid(u32::MAX), Err(ExecutorError::ProcessLookup { .. })));
        assert!(check_alive(u32::MAX).is_err());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(check_alive(std::process::id()).is_ok());
    }
}
