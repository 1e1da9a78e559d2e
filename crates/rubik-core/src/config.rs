use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "rubik.toml";
pub const DEFAULT_DB_PATH: &str = "./data/rubik.db";
pub const DEFAULT_TERMINATE_GRACE_SECS: u64 = 10;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Top-level config (rubik.toml + RUBIK_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubikConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Job registry: every job type the orchestrator may launch.
    #[serde(default = "default_jobs")]
    pub jobs: Vec<JobSpec>,
    /// Dependent job types started after a successful upstream run.
    #[serde(default = "default_chains")]
    pub chains: Vec<ChainRule>,
}

impl Default for RubikConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            supervisor: SupervisorConfig::default(),
            scheduler: SchedulerConfig::default(),
            jobs: default_jobs(),
            chains: default_chains(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Separate SQLite file for job output. Falls back to `path` when unset.
    #[serde(default)]
    pub log_path: Option<String>,
}

impl DatabaseConfig {
    pub fn log_path(&self) -> &str {
        self.log_path.as_deref().unwrap_or(&self.path)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Working directory for every worker; relative `script` paths resolve here.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// How long a worker gets to exit after SIGTERM.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_secs: u64,
    /// How long to wait after escalating to SIGKILL.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// Extra environment for every worker, applied before per-job `env`.
    /// Use [`SupervisorConfig::worker_env`] to get the effective set.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SupervisorConfig {
    /// `env` layered over the variables every worker must see.
    pub fn worker_env(&self) -> BTreeMap<String, String> {
        let mut env = worker_env_contract();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            terminate_grace_secs: DEFAULT_TERMINATE_GRACE_SECS,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cadence at which live timers are re-synced with the schedules table.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
        }
    }
}

/// One entry of the job registry.
///
/// The worker is launched as `program [script] args...` from
/// `supervisor.base_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    pub program: String,
    /// Script handed to `program` as its first argument. Must exist at start time.
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for this job only (applied after `supervisor.env`).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Start `downstream` after a `completed` run of `upstream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRule {
    pub upstream: String,
    pub downstream: String,
}

impl RubikConfig {
    /// Load config from a TOML file with RUBIK_* env var overrides.
    ///
    /// Path resolution: explicit argument, then `RUBIK_CONFIG`, then
    /// `./rubik.toml`. A missing file is not an error; defaults apply.
    /// Nested keys use a double underscore: `RUBIK_SUPERVISOR__KILL_GRACE_SECS=3`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("RUBIK_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        let config: Self = Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;
        debug!(
            path = %path,
            file_present = Path::new(&path).is_file(),
            jobs = config.jobs.len(),
            chains = config.chains.len(),
            "config loaded"
        );
        Ok(config)
    }

    fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUBIK_").ignore(&["config"]).split("__"))
    }

    /// Look up a registry entry by job type.
    pub fn job(&self, job_type: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.job_type == job_type)
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}
fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_terminate_grace() -> u64 {
    DEFAULT_TERMINATE_GRACE_SECS
}
fn default_kill_grace() -> u64 {
    DEFAULT_KILL_GRACE_SECS
}
fn default_reconcile_interval() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_SECS
}

/// Workers must not open the spreadsheet progress side-channel and must
/// flush every line as it is written.
fn worker_env_contract() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("RUBIKVIEW_DISABLE_EXCEL".to_string(), "1".to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
    ])
}

fn default_jobs() -> Vec<JobSpec> {
    vec![
        JobSpec {
            job_type: "ohlcv_load".to_string(),
            program: "python3".to_string(),
            script: Some(PathBuf::from("Data/OHCLV Data/update_stocks_ohlcv.py")),
            args: Vec::new(),
            env: BTreeMap::new(),
        },
        JobSpec {
            job_type: "signal_process".to_string(),
            program: "python3".to_string(),
            script: Some(PathBuf::from("Engine/indicator_runner.py")),
            args: Vec::new(),
            env: BTreeMap::new(),
        },
    ]
}

fn default_chains() -> Vec<ChainRule> {
    vec![ChainRule {
        upstream: "ohlcv_load".to_string(),
        downstream: "signal_process".to_string(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_mirror_the_shipped_pipeline() {
        let cfg = RubikConfig::default();
        assert!(cfg.job("ohlcv_load").is_some());
        assert!(cfg.job("signal_process").is_some());
        assert!(cfg.job("nope").is_none());
        assert_eq!(cfg.chains[0].upstream, "ohlcv_load");
        assert_eq!(cfg.supervisor.terminate_grace_secs, 10);
        assert_eq!(cfg.supervisor.kill_grace_secs, 5);
        assert_eq!(cfg.supervisor.worker_env()["PYTHONUNBUFFERED"], "1");
        assert_eq!(cfg.database.log_path(), cfg.database.path);
    }

    #[test]
    fn toml_file_overrides_registry_and_tuning() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
chains = []

[database]
path = "/tmp/x.db"
log_path = "/tmp/logs.db"

[supervisor]
terminate_grace_secs = 2

[[jobs]]
job_type = "echo"
program = "sh"
args = ["-c", "echo hi"]
"#
        )
        .unwrap();

        let cfg: RubikConfig = RubikConfig::figment(file.path()).extract().unwrap();
        assert_eq!(cfg.database.log_path(), "/tmp/logs.db");
        assert_eq!(cfg.supervisor.terminate_grace_secs, 2);
        // Unset keys keep their defaults.
        assert_eq!(cfg.supervisor.kill_grace_secs, 5);
        assert_eq!(cfg.jobs.len(), 1);
        assert_eq!(cfg.jobs[0].args, vec!["-c", "echo hi"]);
        assert!(cfg.job("ohlcv_load").is_none());
        assert!(cfg.chains.is_empty());
    }

    #[test]
    fn custom_worker_env_keeps_the_unbuffered_contract() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[supervisor.env]
HTTP_PROXY = "http://proxy"
RUBIKVIEW_DISABLE_EXCEL = "0"
"#
        )
        .unwrap();

        let cfg: RubikConfig = RubikConfig::figment(file.path()).extract().unwrap();
        let env = cfg.supervisor.worker_env();
        assert_eq!(env["HTTP_PROXY"], "http://proxy");
        assert_eq!(env["PYTHONUNBUFFERED"], "1");
        // Explicit entries still win.
        assert_eq!(env["RUBIKVIEW_DISABLE_EXCEL"], "0");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg: RubikConfig = RubikConfig::figment("/definitely/not/here.toml")
            .extract()
            .unwrap();
        assert_eq!(cfg.jobs.len(), 2);
    }
}
