use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rubik_core::RubikConfig;
use rubik_jobs::{JobFilter, JobId};
use rubik_orchestrator::cli::{Cli, Command, JobsArgs, ScheduleCommand};
use rubik_orchestrator::router::spawn_fire_router;
use rubik_orchestrator::{Orchestrator, OrchestratorError, Result};
use rubik_scheduler::{ScheduleId, ScheduleSpec, ScheduleUpdate};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const RUN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rubik_orchestrator=info,rubik_jobs=info,rubik_scheduler=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = RubikConfig::load(cli.config.as_deref())?;

    let (orchestrator, fired_rx) = Orchestrator::open(&config)?;
    if let Err(e) = dispatch(orchestrator, fired_rx, cli.command).await {
        eprintln!("error [{}]: {e}", e.code());
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(
    orch: Orchestrator,
    fired_rx: mpsc::Receiver<rubik_scheduler::ScheduleFire>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Serve => serve(orch, fired_rx).await,
        Command::Run { job_type } => run(&orch, &job_type).await,
        Command::Stop { id } => print_json(&orch.stop_job(&JobId::from(id)).await?),
        Command::ForceStop { id } => print_json(&orch.force_mark_stopped(&JobId::from(id))?),
        Command::Jobs(JobsArgs {
            job_type,
            status,
            triggered_by,
            limit,
        }) => print_json(&orch.list_jobs(&JobFilter {
            job_type,
            status,
            triggered_by,
            limit,
        })?),
        Command::Job { id } => print_json(&orch.get_job(&JobId::from(id))?),
        Command::Log { id } => {
            print!("{}", orch.get_job_log(&JobId::from(id))?);
            Ok(())
        }
        Command::Status { job_type, lines } => print_json(&orch.job_status(&job_type, lines)?),
        Command::Stuck => print_json(&orch.stuck_jobs()?),
        Command::Schedules(cmd) => schedules(&orch, cmd),
    }
}

fn schedules(orch: &Orchestrator, cmd: ScheduleCommand) -> Result<()> {
    match cmd {
        ScheduleCommand::List { job_type } => print_json(&orch.list_schedules(job_type.as_deref())?),
        ScheduleCommand::Add {
            job_type,
            schedule_type,
            schedule_value,
            inactive,
        } => {
            let spec = parse_spec(&schedule_type, &schedule_value)?;
            print_json(&orch.create_schedule(&job_type, spec, !inactive)?)
        }
        ScheduleCommand::Update {
            id,
            schedule_type,
            schedule_value,
            active,
        } => {
            let spec = match (schedule_type, schedule_value) {
                (Some(t), Some(v)) => Some(parse_spec(&t, &v)?),
                _ => None,
            };
            let update = ScheduleUpdate {
                spec,
                is_active: active,
            };
            print_json(&orch.update_schedule(&ScheduleId::from(id), update)?)
        }
        ScheduleCommand::Remove { id } => {
            orch.delete_schedule(&ScheduleId::from(id))?;
            Ok(())
        }
    }
}

fn parse_spec(schedule_type: &str, schedule_value: &str) -> Result<ScheduleSpec> {
    let value = serde_json::from_str(schedule_value)
        .map_err(|e| OrchestratorError::InvalidInput(format!("schedule_value: {e}")))?;
    Ok(ScheduleSpec::from_parts(schedule_type, value)?)
}

/// Arm every active schedule and start jobs as they fire, until Ctrl-C.
async fn serve(
    orch: Orchestrator,
    fired_rx: mpsc::Receiver<rubik_scheduler::ScheduleFire>,
) -> Result<()> {
    for job in orch.stuck_jobs()? {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            pid = ?job.details.pid,
            "job is marked running but has no live process here; use force-stop if it is gone"
        );
    }

    let router = spawn_fire_router(Arc::clone(orch.supervisor()), fired_rx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(Arc::clone(orch.engine()).run(shutdown_rx));
    info!("orchestrator serving; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine.await {
        warn!("schedule engine task ended abnormally: {e}");
    }
    router.abort();
    orch.shutdown().await;
    Ok(())
}

/// Start `job_type` and wait for it, plus anything it chains into, to finish.
/// The first Ctrl-C stops the job; the final record is printed either way.
async fn run(orch: &Orchestrator, job_type: &str) -> Result<()> {
    let job = orch.start_job(job_type)?;
    info!(job_id = %job.id, "job started");

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(RUN_POLL_INTERVAL) => {}
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                info!(job_id = %job.id, "interrupt received; stopping job");
                if let Err(e) = orch.stop_job(&job.id).await {
                    warn!(job_id = %job.id, "stop failed: {e}");
                }
            }
        }
        let current = orch.get_job(&job.id)?;
        if current.status.is_terminal() && orch.supervisor().processes().is_empty() {
            return print_json(&current);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
