//! One worker OS process: spawn, stdin/stdout pumps, and exit reaping.
//!
//! Each spawned process gets a generation number. The request pump stamps
//! every request it writes with that generation, which is how the watchdog
//! later knows which in-flight requests died with which process.
//!
//! A handle goes through two stages after its process exits: it is *dead*
//! as soon as the exit is observed, and *exited* once stdout has drained.
//! Liveness and the request pump follow the first; orphaning follows the
//! second, so responses written just before the exit are never overtaken.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use fusion_core::protocol::WorkerResponse;
use fusion_core::settings::Settings;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{WorkerConfig, ENV_DATA_DIR, ENV_WORKER_SETTINGS};
use crate::error::WorkerError;
use crate::supervisor::{ActiveRequests, QueuedRequest};

/// How long the reaper waits for stdout to drain after the process exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared receiving end of the request queue. Only the live process's
/// request pump holds the lock.
pub(crate) type RequestQueue = Arc<Mutex<mpsc::UnboundedReceiver<QueuedRequest>>>;

/// Cheap, cloneable handle to a spawned worker process.
#[derive(Debug, Clone)]
pub(crate) struct ProcessHandle {
    pub pid: Option<u32>,
    pub generation: u64,
    /// Cancelled as soon as the process exit is observed.
    dead: CancellationToken,
    /// Cancelled once the process is dead and its stdout is drained.
    exited: CancellationToken,
    /// Cancel to force-kill the process.
    kill: CancellationToken,
}

impl ProcessHandle {
    pub fn is_alive(&self) -> bool {
        !self.dead.is_cancelled()
    }

    /// Dead with every response it wrote already forwarded.
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub async fn wait_exit(&self) {
        self.exited.cancelled().await;
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }
}

/// Everything a new process needs from its supervisor.
pub(crate) struct SpawnContext<'a> {
    pub config: &'a WorkerConfig,
    pub settings: &'a Settings,
    pub generation: u64,
    pub requests: RequestQueue,
    pub responses: mpsc::Sender<WorkerResponse>,
    pub active: Arc<ActiveRequests>,
    /// Child of the supervisor's master token; cancelling kills the process.
    pub kill: CancellationToken,
}

pub(crate) fn spawn(ctx: SpawnContext<'_>) -> Result<ProcessHandle, WorkerError> {
    let settings_json = serde_json::to_string(ctx.settings)?;

    let mut child = Command::new(&ctx.config.program)
        .args(&ctx.config.args)
        .envs(ctx.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env(ENV_DATA_DIR, &ctx.config.data_dir)
        .env(ENV_WORKER_SETTINGS, settings_json)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| WorkerError::Spawn {
            program: ctx.config.program.display().to_string(),
            source,
        })?;

    let pid = child.id();
    let generation = ctx.generation;
    let dead = CancellationToken::new();
    let exited = CancellationToken::new();

    // Both pipes were requested above, so they are always present.
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(WorkerError::Spawn {
            program: ctx.config.program.display().to_string(),
            source: std::io::Error::other("worker stdio pipes unavailable"),
        });
    };

    tokio::spawn(pump_requests(
        stdin,
        generation,
        ctx.requests,
        ctx.active,
        dead.clone(),
    ));
    let reader = tokio::spawn(pump_responses(stdout, generation, ctx.responses));
    tokio::spawn(reap(
        child,
        generation,
        reader,
        dead.clone(),
        exited.clone(),
        ctx.kill.clone(),
    ));

    tracing::info!(pid, generation, program = %ctx.config.program.display(), "Worker process spawned");

    Ok(ProcessHandle {
        pid,
        generation,
        dead,
        exited,
        kill: ctx.kill,
    })
}

/// Write queued requests to the worker's stdin until the process dies.
/// The queue lock is released at that point so a replacement process can
/// take over while this one's stdout is still draining.
async fn pump_requests(
    mut stdin: ChildStdin,
    generation: u64,
    requests: RequestQueue,
    active: Arc<ActiveRequests>,
    dead: CancellationToken,
) {
    let mut queue = tokio::select! {
        guard = requests.lock() => guard,
        _ = dead.cancelled() => return,
    };

    loop {
        let queued = tokio::select! {
            biased;
            _ = dead.cancelled() => break,
            next = queue.recv() => match next {
                Some(queued) => queued,
                None => break,
            },
        };

        if !queued.is_for(generation) {
            tracing::debug!(generation, "Dropping control request aimed at another worker");
            continue;
        }

        if let Some(id) = queued.request.request_id {
            if !active.mark_sent(id, generation) {
                tracing::debug!(request_id = %id, "Dropping request that is no longer pending");
                continue;
            }
        }

        let mut line = match serde_json::to_string(&queued.request) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode worker request");
                continue;
            }
        };
        line.push('\n');

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(generation, error = %e, "Worker stdin closed");
            break;
        }
    }
}

/// Decode worker stdout lines and forward them to the broadcaster.
async fn pump_responses(
    stdout: ChildStdout,
    generation: u64,
    responses: mpsc::Sender<WorkerResponse>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match WorkerResponse::decode_line(&line) {
                Ok(response) => {
                    if responses.send(response).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "Discarding unreadable worker output line");
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Failed to read worker stdout");
                break;
            }
        }
    }
}

/// Wait for the process to exit (or kill it on request) and mark the
/// handle dead, then let stdout drain and mark it exited.
async fn reap(
    mut child: Child,
    generation: u64,
    reader: JoinHandle<()>,
    dead: CancellationToken,
    exited: CancellationToken,
    kill: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(generation, error = %e, "Failed to kill worker process");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) if status.success() => {
            tracing::info!(generation, %status, "Worker process exited");
        }
        Ok(status) => {
            tracing::warn!(generation, %status, "Worker process exited abnormally");
        }
        Err(e) => {
            tracing::error!(generation, error = %e, "Failed to wait for worker process");
        }
    }
    dead.cancel();

    // Responses written just before exit must reach the broadcaster before
    // the watchdog can declare anything orphaned.
    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await.is_err() {
        tracing::warn!(generation, "Worker stdout did not close after exit");
    }

    exited.cancel();
}
