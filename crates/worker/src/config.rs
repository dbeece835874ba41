//! Worker process configuration.
//!
//! | Variable                        | Default                              |
//! |---------------------------------|--------------------------------------|
//! | `FUSION_WORKER_PROGRAM`         | `fusion-stub-engine` beside this exe |
//! | `FUSION_WORKER_ARGS`            | none (whitespace separated)          |
//! | `WORKER_WATCHDOG_INTERVAL_SECS` | `5`                                  |
//! | `WORKER_RECV_POLL_MS`           | `1000`                               |
//! | `WORKER_STOP_TIMEOUT_SECS`      | `60`                                 |

use std::path::{Path, PathBuf};
use std::time::Duration;

use fusion_core::config::{env_opt, env_or, ConfigError};

/// How often the watchdog checks worker liveness.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Longest the broadcaster blocks on the response queue before re-checking
/// for shutdown.
pub const DEFAULT_RECV_POLL: Duration = Duration::from_millis(1000);

/// How long a graceful stop may take before the worker is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable carrying the data directory to the worker.
pub const ENV_DATA_DIR: &str = "FUSION_DATA_DIR";

/// Environment variable carrying the settings JSON to the worker.
pub const ENV_WORKER_SETTINGS: &str = "FUSION_WORKER_SETTINGS";

const STUB_ENGINE_NAME: &str = "fusion-stub-engine";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub data_dir: PathBuf,
    /// Extra environment for the worker process.
    pub env: Vec<(String, String)>,
    pub watchdog_interval: Duration,
    pub recv_poll: Duration,
    pub stop_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            data_dir: data_dir.into(),
            env: Vec::new(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            recv_poll: DEFAULT_RECV_POLL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn from_env(data_dir: &Path) -> Result<Self, ConfigError> {
        let program = match env_opt::<PathBuf>("FUSION_WORKER_PROGRAM")? {
            Some(program) => program,
            None => default_program(),
        };
        let args = std::env::var("FUSION_WORKER_ARGS")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Self {
            args,
            watchdog_interval: Duration::from_secs(env_or(
                "WORKER_WATCHDOG_INTERVAL_SECS",
                DEFAULT_WATCHDOG_INTERVAL.as_secs(),
            )?),
            recv_poll: Duration::from_millis(env_or(
                "WORKER_RECV_POLL_MS",
                DEFAULT_RECV_POLL.as_millis() as u64,
            )?),
            stop_timeout: Duration::from_secs(env_or(
                "WORKER_STOP_TIMEOUT_SECS",
                DEFAULT_STOP_TIMEOUT.as_secs(),
            )?),
            ..Self::new(program, data_dir)
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// The stub engine installed next to the running executable, or a bare
/// name resolved through `PATH`.
fn default_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(STUB_ENGINE_NAME)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(STUB_ENGINE_NAME))
}
