//! Live process handles and OS-level termination.
//!
//! Workers are spawned as process-group leaders, so every signal here goes
//! to the whole group: a `sh -c` wrapper and whatever it forked die together
//! and release the output pipes.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{JobError, Result};
use crate::types::{ExitInfo, JobId};

/// Poll cadence when waiting on a process we only know by pid.
const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the owning worker task has observed about its child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(ExitInfo),
}

impl ProcessState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited(_))
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        match self {
            ProcessState::Exited(info) => Some(*info),
            ProcessState::Running => None,
        }
    }
}

/// Cloneable view of a running worker: its pid plus a feed of the exit
/// status published by the worker task that owns the `Child`.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    state: watch::Receiver<ProcessState>,
}

impl ProcessHandle {
    /// Create a handle and the sender the worker task uses to report exit.
    pub fn new(pid: u32) -> (Self, watch::Sender<ProcessState>) {
        let (tx, rx) = watch::channel(ProcessState::Running);
        (Self { pid, state: rx }, tx)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Exit status, if the worker has already reaped the process.
    pub fn exit(&self) -> Option<ExitInfo> {
        self.state.borrow().exit_info()
    }

    /// Wait up to `timeout` for the worker to report exit.
    pub async fn wait_exit(&mut self, timeout: Duration) -> Option<ExitInfo> {
        match tokio::time::timeout(timeout, self.state.wait_for(ProcessState::is_exited)).await {
            Ok(Ok(state)) => state.exit_info(),
            _ => None,
        }
    }
}

/// Registry of live process handles keyed by job id.
///
/// Purely an in-memory accelerator: after a restart it starts empty and
/// callers fall back to the pid persisted in the job record.
#[derive(Debug, Default)]
pub struct ProcessTable {
    handles: DashMap<JobId, ProcessHandle>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: JobId, handle: ProcessHandle) {
        self.handles.insert(id, handle);
    }

    pub fn get(&self, id: &JobId) -> Option<ProcessHandle> {
        self.handles.get(id).map(|h| h.value().clone())
    }

    pub fn remove(&self, id: &JobId) -> Option<ProcessHandle> {
        self.handles.remove(id).map(|(_, h)| h)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// The two bounded waits of the stop protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grace {
    /// After SIGTERM.
    pub terminate: Duration,
    /// After escalating to SIGKILL.
    pub kill: Duration,
}

impl Grace {
    pub fn from_secs(terminate: u64, kill: u64) -> Self {
        Self {
            terminate: Duration::from_secs(terminate),
            kill: Duration::from_secs(kill),
        }
    }

    fn total_ms(&self) -> u64 {
        (self.terminate + self.kill).as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

/// Result of a successful termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// Known only when we hold a live handle.
    pub exit: Option<ExitInfo>,
    /// SIGTERM was not enough.
    pub escalated: bool,
}

/// Terminate a worker we spawned ourselves: SIGTERM, wait, SIGKILL, wait.
pub async fn terminate_handle(mut handle: ProcessHandle, grace: Grace) -> Result<Termination> {
    if let Some(exit) = handle.exit() {
        return Ok(Termination {
            exit: Some(exit),
            escalated: false,
        });
    }

    let pid = handle.pid();
    send_signal(pid, Signal::Terminate)?;
    if let Some(exit) = handle.wait_exit(grace.terminate).await {
        return Ok(Termination {
            exit: Some(exit),
            escalated: false,
        });
    }

    warn!(pid, grace_ms = grace.terminate.as_millis() as u64, "worker ignored SIGTERM; sending SIGKILL");
    send_signal(pid, Signal::Kill)?;
    if let Some(exit) = handle.wait_exit(grace.kill).await {
        return Ok(Termination {
            exit: Some(exit),
            escalated: true,
        });
    }

    Err(JobError::TerminationTimeout {
        pid,
        waited_ms: grace.total_ms(),
    })
}

/// Terminate a worker known only by its persisted pid (e.g. spawned by a
/// previous orchestrator instance). The exit status is not observable.
pub async fn terminate_pid(pid: u32, grace: Grace) -> Result<Termination> {
    if !is_alive(pid) {
        debug!(pid, "process already gone");
        return Ok(Termination {
            exit: None,
            escalated: false,
        });
    }

    send_signal(pid, Signal::Terminate)?;
    if wait_gone(pid, grace.terminate).await {
        return Ok(Termination {
            exit: None,
            escalated: false,
        });
    }

    warn!(pid, grace_ms = grace.terminate.as_millis() as u64, "process ignored SIGTERM; sending SIGKILL");
    send_signal(pid, Signal::Kill)?;
    if wait_gone(pid, grace.kill).await {
        return Ok(Termination {
            exit: None,
            escalated: true,
        });
    }

    Err(JobError::TerminationTimeout {
        pid,
        waited_ms: grace.total_ms(),
    })
}

async fn wait_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PID_POLL_INTERVAL).await;
    }
}

/// Whether `pid` can safely be signalled as a worker. 0 and 1 (and values
/// that wrap negative) would address our own group, init, or every process.
pub fn is_signal_target(pid: u32) -> bool {
    pid > 1 && i32::try_from(pid).is_ok()
}

/// Signal the process group led by `pid`, falling back to the single process
/// when `pid` does not lead a group. A process that no longer exists is not
/// an error.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    if !is_signal_target(pid) {
        return Err(JobError::Signal {
            pid,
            reason: "refusing to signal a reserved pid".to_string(),
        });
    }
    match raw_signal(pid, signal) {
        Ok(()) => Ok(()),
        Err(e) if is_no_such_process(&e) => {
            debug!(pid, ?signal, "signal target already gone");
            Ok(())
        }
        Err(e) => Err(JobError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(unix)]
fn raw_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;
    // Safety: kill(2) takes plain integers and has no memory preconditions.
    if unsafe { libc::kill(-pid, sig) } == 0 {
        return Ok(());
    }
    let group_err = std::io::Error::last_os_error();
    if !is_no_such_process(&group_err) {
        return Err(group_err);
    }
    if unsafe { libc::kill(pid, sig) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn raw_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    // No graceful variant exists here; both steps are a forced tree kill.
    let _ = signal;
    let status = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("taskkill exited with {status}"),
        ))
    }
}

#[cfg(unix)]
fn is_no_such_process(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_no_such_process(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

/// Whether `pid` still names a live process (a zombie counts as alive).
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // Safety: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;

    fn spawn_group(script: &str) -> std::process::Child {
        std::process::Command::new("sh")
            .args(["-c", script])
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn handle_reports_published_exit() {
        let (mut handle, tx) = ProcessHandle::new(1234);
        assert_eq!(handle.exit(), None);
        assert_eq!(handle.wait_exit(Duration::from_millis(20)).await, None);

        let info = ExitInfo {
            code: Some(0),
            signal: None,
        };
        tx.send_replace(ProcessState::Exited(info));
        assert_eq!(handle.exit(), Some(info));
        assert_eq!(handle.wait_exit(Duration::from_millis(20)).await, Some(info));
    }

    #[tokio::test]
    async fn already_exited_handle_is_not_signalled() {
        // pid 0 would signal our own group if it were ever used.
        let (handle, tx) = ProcessHandle::new(0);
        let info = ExitInfo {
            code: Some(2),
            signal: None,
        };
        tx.send_replace(ProcessState::Exited(info));
        let t = terminate_handle(handle, Grace::from_secs(1, 1)).await.unwrap();
        assert_eq!(t.exit, Some(info));
        assert!(!t.escalated);
    }

    #[test]
    fn table_tracks_handles_by_job() {
        let table = ProcessTable::new();
        let id = JobId::new();
        let (handle, _tx) = ProcessHandle::new(42);
        table.insert(id.clone(), handle);
        assert!(table.contains(&id));
        assert_eq!(table.get(&id).unwrap().pid(), 42);
        assert_eq!(table.len(), 1);
        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
        assert!(table.get(&id).is_none());
    }

    #[tokio::test]
    async fn terminate_pid_stops_a_process_group() {
        let mut child = spawn_group("sleep 30");
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait().unwrap());

        let t = terminate_pid(pid, Grace::from_secs(5, 2)).await.unwrap();
        assert!(!t.escalated);
        assert_eq!(t.exit, None);

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(reaper.join().unwrap().signal(), Some(libc::SIGTERM));
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn terminate_pid_escalates_when_term_is_ignored() {
        let mut child = spawn_group("trap '' TERM; sleep 30");
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait().unwrap());
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let grace = Grace {
            terminate: Duration::from_millis(300),
            kill: Duration::from_secs(2),
        };
        let t = terminate_pid(pid, grace).await.unwrap();
        assert!(t.escalated);

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(reaper.join().unwrap().signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn terminate_pid_on_dead_process_is_ok() {
        let mut child = spawn_group("exit 0");
        let pid = child.id();
        child.wait().unwrap();
        let t = terminate_pid(pid, Grace::from_secs(1, 1)).await.unwrap();
        assert_eq!(
            t,
            Termination {
                exit: None,
                escalated: false
            }
        );
    }

    #[test]
    fn reserved_pids_are_never_signalled() {
        for pid in [0, 1, u32::MAX, i32::MAX as u32 + 1] {
            assert!(!is_signal_target(pid), "{pid}");
            assert!(matches!(
                send_signal(pid, Signal::Terminate),
                Err(JobError::Signal { .. })
            ));
        }
        assert!(is_signal_target(std::process::id()));
    }
}
