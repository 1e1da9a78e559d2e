use std::collections::BTreeMap;
use std::io::{BufRead, PipeReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rubik_core::{JobSpec, RubikConfig, TriggeredBy};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::chain::ChainTrigger;
use crate::error::{JobError, Result};
use crate::logs::LogSink;
use crate::process::{self, Grace, ProcessHandle, ProcessState, ProcessTable};
use crate::progress::parse_progress_line;
use crate::store::JobStore;
use crate::types::{ExitInfo, ExitOutcome, Job, JobId, JobStatus};

/// Lines buffered between the pipe reader and the log writer.
const LINE_BUFFER: usize = 256;

/// After the worker exits, how long to keep draining output that a
/// lingering grandchild may still be holding open.
const OUTPUT_DRAIN_IDLE: Duration = Duration::from_secs(3);

/// Launches registry jobs and owns their lifecycle until finalization.
pub struct Supervisor {
    registry: Vec<JobSpec>,
    base_dir: PathBuf,
    env: BTreeMap<String, String>,
    grace: Grace,
    store: Arc<JobStore>,
    logs: Arc<LogSink>,
    processes: Arc<ProcessTable>,
    chain: ChainTrigger,
}

impl Supervisor {
    pub fn new(
        config: &RubikConfig,
        store: Arc<JobStore>,
        logs: Arc<LogSink>,
        processes: Arc<ProcessTable>,
    ) -> Self {
        Self {
            registry: config.jobs.clone(),
            base_dir: config.supervisor.base_dir.clone(),
            env: config.supervisor.worker_env(),
            grace: Grace::from_secs(
                config.supervisor.terminate_grace_secs,
                config.supervisor.kill_grace_secs,
            ),
            store,
            logs,
            processes,
            chain: ChainTrigger::new(config.chains.clone()),
        }
    }

    /// Override the termination waits (sub-second values are useful in tests).
    pub fn with_grace(mut self, grace: Grace) -> Self {
        self.grace = grace;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn logs(&self) -> &Arc<LogSink> {
        &self.logs
    }

    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    pub fn has_job_type(&self, job_type: &str) -> bool {
        self.registry.iter().any(|s| s.job_type == job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.registry.iter().map(|s| s.job_type.as_str())
    }

    /// Start a job of `job_type`.
    ///
    /// The `running` record is created atomically before the process is
    /// spawned, so a concurrent start of the same type gets `AlreadyRunning`
    /// and never launches a second process. Must be called from within a
    /// Tokio runtime; the worker task is spawned onto it.
    #[instrument(skip(self))]
    pub fn start(self: &Arc<Self>, job_type: &str, triggered_by: TriggeredBy) -> Result<Job> {
        let spec = self
            .registry
            .iter()
            .find(|s| s.job_type == job_type)
            .ok_or_else(|| JobError::UnknownJobType {
                job_type: job_type.to_string(),
            })?;
        let (mut command, output) = self.build_command(spec)?;

        let job = self.store.create_running(job_type, triggered_by)?;

        let spawned = command.spawn();
        // The command holds our copies of the pipe's write end; the reader
        // only sees EOF once they are gone.
        drop(command);
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let reason = e.to_string();
                error!(job_id = %job.id, "spawn failed: {reason}");
                self.store
                    .finalize(&job.id, &ExitOutcome::Error(format!("spawn failed: {reason}")))?;
                return Err(JobError::Spawn {
                    id: job.id.to_string(),
                    job_type: job_type.to_string(),
                    reason,
                });
            }
        };

        let (job, state_tx) = match child.id() {
            Some(pid) => {
                let (handle, state_tx) = ProcessHandle::new(pid);
                self.processes.insert(job.id.clone(), handle);
                let job = match self.store.set_pid(&job.id, pid) {
                    Ok(job) => job,
                    Err(e) => {
                        warn!(job_id = %job.id, pid, "failed to persist pid: {e}");
                        job
                    }
                };
                (job, Some(state_tx))
            }
            None => (job, None),
        };

        let worker = Arc::clone(self);
        let id = job.id.clone();
        tokio::spawn(async move {
            worker.run_worker(id, child, output, state_tx).await;
        });

        info!(job_id = %job.id, pid = ?job.details.pid, "job started");
        Ok(job)
    }

    /// Stop a running job: mark it `stopped`, then SIGTERM its process group
    /// and escalate to SIGKILL after the grace period.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &JobId) -> Result<Job> {
        let job = self.store.get(id)?;
        if job.status != JobStatus::Running {
            return Err(JobError::NotRunning {
                id: id.to_string(),
                status: job.status,
            });
        }

        let handle = self.processes.get(id);
        let persisted = job.details.pid.filter(|&pid| process::is_signal_target(pid));
        let Some(pid) = handle.as_ref().map(ProcessHandle::pid).or(persisted) else {
            warn!(job_id = %id, "no handle or pid for running job");
            return Err(JobError::HandleUnavailable { id: id.to_string() });
        };

        // Status first, signal second: the worker's exit handler must find
        // the record already stopped.
        if self.store.mark_stopped(id)?.is_none() {
            let current = self.store.get(id)?;
            return Err(JobError::NotRunning {
                id: id.to_string(),
                status: current.status,
            });
        }
        info!(job_id = %id, pid, live_handle = handle.is_some(), "stopping job");

        let terminated = match handle {
            Some(handle) => process::terminate_handle(handle, self.grace).await,
            None => process::terminate_pid(pid, self.grace).await,
        };

        match terminated {
            Ok(t) => {
                if t.escalated {
                    warn!(job_id = %id, pid, "job needed SIGKILL");
                }
                self.store.attach_exit(id, t.exit)
            }
            Err(e) => {
                error!(job_id = %id, pid, "termination failed: {e}");
                self.store.record_error(id, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Close a job record without signalling anything. For records whose
    /// process is already gone or unreachable.
    pub fn force_mark_stopped(&self, id: &JobId) -> Result<Job> {
        self.store.force_stop(id)
    }

    /// Running records with no live handle in this process, typically left
    /// behind by an orchestrator restart.
    pub fn stuck_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .store
            .list_running()?
            .into_iter()
            .filter(|job| !self.processes.contains(&job.id))
            .collect())
    }

    /// Both stdout and stderr of the worker go to one pipe, so the log keeps
    /// the order in which lines were written across the two streams.
    fn build_command(&self, spec: &JobSpec) -> Result<(Command, PipeReader)> {
        let program = self.resolve_program(spec)?;
        let mut command = Command::new(program);

        if let Some(script) = &spec.script {
            let path = self.base_dir.join(script);
            if !path.is_file() {
                return Err(JobError::ExecutableMissing {
                    job_type: spec.job_type.clone(),
                    path: path.display().to_string(),
                });
            }
            command.arg(path);
        }

        let (reader, writer) = std::io::pipe()?;
        command
            .args(&spec.args)
            .current_dir(&self.base_dir)
            .envs(&self.env)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer)
            .kill_on_drop(false);

        #[cfg(unix)]
        command.process_group(0);

        Ok((command, reader))
    }

    /// Bare names go through `PATH`; anything with a separator is taken
    /// relative to `base_dir`.
    fn resolve_program(&self, spec: &JobSpec) -> Result<PathBuf> {
        let missing = |path: String| JobError::ExecutableMissing {
            job_type: spec.job_type.clone(),
            path,
        };

        let program = Path::new(&spec.program);
        if program.components().count() > 1 || program.is_absolute() {
            let path = self.base_dir.join(program);
            if path.is_file() {
                Ok(path)
            } else {
                Err(missing(path.display().to_string()))
            }
        } else {
            which::which(&spec.program).map_err(|_| missing(spec.program.clone()))
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        id: JobId,
        child: Child,
        output: PipeReader,
        state_tx: Option<watch::Sender<ProcessState>>,
    ) {
        let outcome = self
            .stream_output(&id, child, output, state_tx.as_ref())
            .await;

        let finalized = self.store.finalize(&id, &outcome);
        self.processes.remove(&id);

        match finalized {
            Ok(job) => {
                info!(
                    job_id = %id,
                    job_type = %job.job_type,
                    status = %job.status,
                    exit_code = ?job.details.exit_code,
                    signal = ?job.details.signal,
                    "job finished"
                );
                self.chain.on_finalized(&self, &job);
            }
            Err(e) => error!(job_id = %id, "failed to finalize job: {e}"),
        }
    }

    /// Forward every output line to the log sink until the process has
    /// exited and the output pipe is closed (or went idle after exit).
    async fn stream_output(
        &self,
        id: &JobId,
        mut child: Child,
        output: PipeReader,
        state_tx: Option<&watch::Sender<ProcessState>>,
    ) -> ExitOutcome {
        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_BUFFER);
        tokio::task::spawn_blocking(move || pump_lines(output, line_tx));

        let wait = child.wait();
        tokio::pin!(wait);

        let mut outcome: Option<ExitOutcome> = None;
        let mut output_open = true;

        while output_open || outcome.is_none() {
            tokio::select! {
                line = line_rx.recv(), if output_open => match line {
                    Some(line) => self.record_line(id, &line),
                    None => output_open = false,
                },
                status = &mut wait, if outcome.is_none() => {
                    let result = match status {
                        Ok(status) => ExitOutcome::Exited(status.into()),
                        Err(e) => ExitOutcome::Error(format!("wait failed: {e}")),
                    };
                    if let Some(tx) = state_tx {
                        let info = match &result {
                            ExitOutcome::Exited(info) => *info,
                            ExitOutcome::Error(_) => ExitInfo { code: None, signal: None },
                        };
                        tx.send_replace(ProcessState::Exited(info));
                    }
                    debug!(job_id = %id, outcome = ?result, "worker exited");
                    outcome = Some(result);
                },
                _ = tokio::time::sleep(OUTPUT_DRAIN_IDLE), if outcome.is_some() && output_open => {
                    warn!(job_id = %id, "output still open after worker exit; finalizing without it");
                    output_open = false;
                },
                else => break,
            }
        }

        outcome.unwrap_or_else(|| ExitOutcome::Error("worker exit status unavailable".to_string()))
    }

    fn record_line(&self, id: &JobId, line: &str) {
        if let Err(e) = self.logs.append(id, line) {
            error!(job_id = %id, "failed to append job output: {e}");
        }
        if let Some(update) = parse_progress_line(line) {
            if let Err(e) = self.store.update_progress(id, update) {
                warn!(job_id = %id, "failed to record progress: {e}");
            }
        }
    }
}

/// Read `reader` line by line (keeping the newline) and forward each line.
/// Non-UTF-8 bytes are replaced rather than dropped. Blocks; run it on the
/// blocking pool.
fn pump_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = std::io::BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("output stream closed with error: {e}");
                break;
            }
        }
    }
}
