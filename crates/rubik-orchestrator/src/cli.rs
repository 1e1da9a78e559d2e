use clap::{Args, Parser, Subcommand};
use rubik_core::TriggeredBy;
use rubik_jobs::JobStatus;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("RUBIK_GIT_SHA"), ")");

/// Background job orchestrator for the RubikView data pipeline.
#[derive(Debug, Parser)]
#[command(name = "rubik-orchestrator", version = VERSION, about)]
pub struct Cli {
    /// Path to the TOML config file (defaults to ./rubik.toml).
    #[arg(short, long, global = true, env = "RUBIK_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the schedule engine and supervise fired jobs until Ctrl-C.
    Serve,

    /// Start a job manually and follow it (and any chained job) to the end.
    Run {
        job_type: String,
    },

    /// Stop a running job: SIGTERM, then SIGKILL after the grace period.
    Stop {
        id: String,
    },

    /// Mark a running record stopped without signalling anything.
    ForceStop {
        id: String,
    },

    /// List recent jobs, newest first.
    Jobs(JobsArgs),

    /// Show one job record.
    Job {
        id: String,
    },

    /// Print a job's captured output.
    Log {
        id: String,
    },

    /// Summarize the latest run of a job type.
    Status {
        job_type: String,
        /// Number of trailing output lines to include.
        #[arg(short, long, default_value_t = 20)]
        lines: usize,
    },

    /// Running records whose process this instance does not own.
    Stuck,

    /// Manage recurring schedules.
    #[command(subcommand)]
    Schedules(ScheduleCommand),
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[arg(long = "type")]
    pub job_type: Option<String>,
    #[arg(long, value_parser = parse_status)]
    pub status: Option<JobStatus>,
    #[arg(long, value_parser = parse_triggered_by)]
    pub triggered_by: Option<TriggeredBy>,
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCommand {
    List {
        #[arg(long = "type")]
        job_type: Option<String>,
    },

    /// Example: `schedules add ohlcv_load daily '{"hour": 18, "minute": 30}'`
    Add {
        job_type: String,
        /// daily, weekly, interval or cron.
        schedule_type: String,
        /// JSON object with the schedule's parameters.
        schedule_value: String,
        /// Store the schedule without arming it.
        #[arg(long)]
        inactive: bool,
    },

    Update {
        id: String,
        #[arg(long, requires = "schedule_value")]
        schedule_type: Option<String>,
        #[arg(long, requires = "schedule_type")]
        schedule_value: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },

    Remove {
        id: String,
    },
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse()
}

fn parse_triggered_by(s: &str) -> Result<TriggeredBy, String> {
    s.parse().map_err(|e: rubik_core::CoreError| e.to_string())
}
