//! The worker supervisor.
//!
//! [`WorkerSupervisor`] guarantees at most one live worker process. Spawns
//! and restarts are serialized by a lifecycle lock, and a restart fully
//! joins the old process before the new one is spawned. Two background
//! tasks run for the supervisor's lifetime:
//!
//! - the **broadcaster** drains the response queue (with a bounded wait so
//!   shutdown is observed) and republishes each response on the hub's
//!   `response` channel;
//! - the **watchdog** polls process liveness and, when requests are
//!   orphaned by a dead or replaced process, queues a terminal crash
//!   response for each of them.
//!
//! Synthesized crash responses travel through the same queue as real ones,
//! so a terminal response the worker managed to write before dying always
//! wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use fusion_core::channels::CHANNEL_RESPONSE;
use fusion_core::protocol::{
    ProtocolViolation, RequestKind, ResponseBody, WorkerRequest, WorkerResponse,
};
use fusion_core::settings::Settings;
use fusion_core::types::DreamId;
use fusion_events::{BroadcastHub, HubMessage, HubRecvError, Subscription};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ResponseStream, WorkerClient};
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::process::{self, ProcessHandle, RequestQueue, SpawnContext};

/// Capacity of the queue between the stdout reader and the broadcaster.
const RESPONSE_QUEUE_CAPACITY: usize = 256;

/// Message attached to every watchdog-synthesized failure.
pub const WORKER_DIED_MESSAGE: &str = "worker process died while waiting for response";

// ---------------------------------------------------------------------------
// Request bookkeeping
// ---------------------------------------------------------------------------

/// A request waiting in the queue, optionally aimed at one process.
#[derive(Debug, Clone)]
pub(crate) struct QueuedRequest {
    pub request: WorkerRequest,
    /// `Some(g)` for control requests that only process `g` may consume.
    pub target: Option<u64>,
}

impl QueuedRequest {
    pub fn is_for(&self, generation: u64) -> bool {
        self.target.map_or(true, |target| target == generation)
    }
}

/// Where an active request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Enqueued but not yet written to any process.
    Queued,
    /// Written to the process of this generation.
    Sent { generation: u64 },
    /// A crash response has been queued; waiting for the broadcaster.
    Failing,
}

/// The set of requests that have not yet seen a terminal response.
#[derive(Debug, Default)]
pub(crate) struct ActiveRequests {
    requests: Mutex<HashMap<DreamId, Dispatch>>,
}

impl ActiveRequests {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DreamId, Dispatch>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: DreamId) {
        self.lock().insert(id, Dispatch::Queued);
    }

    fn remove(&self, id: DreamId) {
        self.lock().remove(&id);
    }

    /// Record that `id` was handed to `generation`. Returns `false` if the
    /// request is no longer pending and must not be written.
    pub fn mark_sent(&self, id: DreamId, generation: u64) -> bool {
        let mut requests = self.lock();
        match requests.get_mut(&id) {
            Some(dispatch @ Dispatch::Queued) => {
                *dispatch = Dispatch::Sent { generation };
                true
            }
            _ => false,
        }
    }

    /// Whether a response for `id` should be published. A terminal response
    /// also retires the id.
    fn accept(&self, response: &WorkerResponse) -> bool {
        let mut requests = self.lock();
        if !requests.contains_key(&response.request_id) {
            return false;
        }
        if response.stopped {
            requests.remove(&response.request_id);
        }
        true
    }

    /// Requests that can no longer be answered given which process (if
    /// any) is alive. Each is moved to `Failing` and returned once.
    fn take_orphans(&self, live_generation: Option<u64>) -> Vec<DreamId> {
        let mut orphans = Vec::new();
        for (id, dispatch) in self.lock().iter_mut() {
            let orphaned = match *dispatch {
                Dispatch::Queued => live_generation.is_none(),
                Dispatch::Sent { generation } => Some(generation) != live_generation,
                Dispatch::Failing => false,
            };
            if orphaned {
                *dispatch = Dispatch::Failing;
                orphans.push(*id);
            }
        }
        orphans
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

// ---------------------------------------------------------------------------
// WorkerSupervisor
// ---------------------------------------------------------------------------

/// Owns the worker process and the request/response plumbing around it.
///
/// Created once via [`WorkerSupervisor::start`]; the returned `Arc` is
/// shared with whoever drives requests.
pub struct WorkerSupervisor {
    config: WorkerConfig,
    settings: RwLock<Settings>,
    hub: Arc<BroadcastHub<HubMessage>>,
    /// Serializes spawn, restart, and shutdown.
    lifecycle: tokio::sync::Mutex<()>,
    current: Mutex<Option<ProcessHandle>>,
    generations: AtomicU64,
    active: Arc<ActiveRequests>,
    request_tx: mpsc::UnboundedSender<QueuedRequest>,
    requests: RequestQueue,
    response_tx: mpsc::Sender<WorkerResponse>,
    /// Master cancellation token -- cancelled during shutdown.
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    /// Create the queues and start the broadcaster and watchdog. The worker
    /// process itself is spawned lazily by [`WorkerSupervisor::ensure_running`].
    pub fn start(
        config: WorkerConfig,
        settings: Settings,
        hub: Arc<BroadcastHub<HubMessage>>,
    ) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_QUEUE_CAPACITY);

        let supervisor = Arc::new(Self {
            config,
            settings: RwLock::new(settings),
            hub,
            lifecycle: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            generations: AtomicU64::new(0),
            active: Arc::new(ActiveRequests::default()),
            request_tx,
            requests: Arc::new(tokio::sync::Mutex::new(request_rx)),
            response_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let broadcaster = tokio::spawn(Arc::clone(&supervisor).run_broadcaster(response_rx));
        let watchdog = tokio::spawn(Arc::clone(&supervisor).run_watchdog());
        supervisor
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([broadcaster, watchdog]);

        supervisor
    }

    /// Spawn the worker unless one is already alive.
    pub async fn ensure_running(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::ShuttingDown);
        }
        let _lifecycle = self.lifecycle.lock().await;
        if self.live_process().is_none() {
            self.spawn_locked().await?;
        }
        Ok(())
    }

    /// Send a request and stream back the bodies of its responses, ending
    /// after the first terminal one.
    ///
    /// The hub subscription is taken before the request is enqueued, so no
    /// response can be missed.
    pub async fn send_request_and_watch(
        &self,
        request_id: DreamId,
        kind: RequestKind,
        body: serde_json::Value,
    ) -> Result<ResponseStream, WorkerError> {
        self.ensure_running().await?;

        let subscription = self.hub.subscribe(CHANNEL_RESPONSE);
        self.active.insert(request_id);

        let queued = QueuedRequest {
            request: WorkerRequest::new(request_id, kind, body),
            target: None,
        };
        if let Err(e) = self.enqueue(queued) {
            self.active.remove(request_id);
            return Err(e);
        }

        tracing::debug!(%request_id, ?kind, "Worker request queued");
        Ok(response_stream(subscription, request_id))
    }

    /// Replace the held settings and restart the worker with them.
    ///
    /// The running worker is asked to stop and fully joined (killed after
    /// the stop timeout) before a fresh process is spawned. Requests that
    /// were in flight on the old process are failed by the watchdog.
    pub async fn update_settings(&self, settings: Settings) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            return Err(WorkerError::ShuttingDown);
        }
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;

        let _lifecycle = self.lifecycle.lock().await;
        if let Some(handle) = self.live_process() {
            self.stop_locked(&handle).await?;
        }
        let handle = self.spawn_locked().await?;

        tracing::info!(generation = handle.generation, "Worker restarted with new settings");
        Ok(())
    }

    /// Stop the worker gracefully and end the background tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker supervisor");
        {
            let _lifecycle = self.lifecycle.lock().await;
            if let Some(handle) = self.live_process() {
                if let Err(e) = self.stop_locked(&handle).await {
                    tracing::warn!(error = %e, "Failed to stop worker during shutdown");
                }
            }
            self.cancel.cancel();
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }

        tracing::info!("Worker supervisor shut down complete");
    }

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Generation of the live worker process, if any. Generations start at
    /// 1 and increase with every spawn.
    pub fn current_generation(&self) -> Option<u64> {
        self.live_process().map(|handle| handle.generation)
    }

    pub fn current_pid(&self) -> Option<u32> {
        self.live_process().and_then(|handle| handle.pid)
    }

    /// Number of requests still waiting for a terminal response.
    pub fn active_request_count(&self) -> usize {
        self.active.len()
    }

    // ---- private helpers ----

    fn current_process(&self) -> Option<ProcessHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn live_process(&self) -> Option<ProcessHandle> {
        self.current_process().filter(ProcessHandle::is_alive)
    }

    /// Generation whose in-flight requests are still owned by a process:
    /// the current one unless it has died and drained its stdout.
    fn undrained_generation(&self) -> Option<u64> {
        self.current_process()
            .filter(|handle| !handle.has_exited())
            .map(|handle| handle.generation)
    }

    /// Spawn a new process. Caller must hold the lifecycle lock and have
    /// stopped any previous process. A previous process that is dead but
    /// still draining is waited for, so the watchdog never sees a newer
    /// generation before the older one's responses are all forwarded.
    async fn spawn_locked(&self) -> Result<ProcessHandle, WorkerError> {
        if let Some(previous) = self.current_process() {
            previous.wait_exit().await;
        }

        let settings = self.settings();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;

        let handle = process::spawn(SpawnContext {
            config: &self.config,
            settings: &settings,
            generation,
            requests: Arc::clone(&self.requests),
            responses: self.response_tx.clone(),
            active: Arc::clone(&self.active),
            kill: self.cancel.child_token(),
        })?;

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        Ok(handle)
    }

    /// Ask `handle`'s process to stop and wait for it to exit, killing it
    /// after the stop timeout. Caller must hold the lifecycle lock.
    async fn stop_locked(&self, handle: &ProcessHandle) -> Result<(), WorkerError> {
        self.enqueue(QueuedRequest {
            request: WorkerRequest::stop(),
            target: Some(handle.generation),
        })?;

        let stopped =
            tokio::time::timeout(self.config.stop_timeout, handle.wait_exit()).await;
        if stopped.is_err() {
            tracing::warn!(
                generation = handle.generation,
                timeout_secs = self.config.stop_timeout.as_secs_f64(),
                "Worker did not stop in time, killing it"
            );
            handle.kill();
            handle.wait_exit().await;
        }
        Ok(())
    }

    fn enqueue(&self, queued: QueuedRequest) -> Result<(), WorkerError> {
        self.request_tx
            .send(queued)
            .map_err(|_| WorkerError::QueueClosed)
    }

    fn publish(&self, response: WorkerResponse) {
        if !self.active.accept(&response) {
            tracing::debug!(
                request_id = %response.request_id,
                "Dropping response for a request that is no longer active"
            );
            return;
        }
        self.hub
            .publish(CHANNEL_RESPONSE, HubMessage::Response(Arc::new(response)));
    }

    async fn run_broadcaster(self: Arc<Self>, mut responses: mpsc::Receiver<WorkerResponse>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(self.config.recv_poll, responses.recv()) => {
                    match next {
                        Ok(Some(response)) => self.publish(response),
                        Ok(None) => break,
                        // Idle poll; loop to re-check cancellation.
                        Err(_) => {}
                    }
                }
            }
        }
        tracing::debug!("Worker response broadcaster stopped");
    }

    async fn run_watchdog(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.watchdog_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => self.check_liveness().await,
            }
        }
        tracing::debug!("Worker watchdog stopped");
    }

    async fn check_liveness(&self) {
        // Holding the lifecycle lock keeps the live generation stable while
        // orphans are collected.
        let orphans = {
            let _lifecycle = self.lifecycle.lock().await;
            let live_generation = self.undrained_generation();
            let orphans = self.active.take_orphans(live_generation);
            if !orphans.is_empty() {
                tracing::warn!(
                    failed = orphans.len(),
                    live_generation,
                    "Worker died with requests in flight, failing them"
                );
            }
            orphans
        };

        for request_id in orphans {
            let crashed = WorkerResponse::crashed(request_id, WORKER_DIED_MESSAGE);
            if self.response_tx.send(crashed).await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl WorkerClient for WorkerSupervisor {
    async fn send_request_and_watch(
        &self,
        request_id: DreamId,
        kind: RequestKind,
        body: serde_json::Value,
    ) -> Result<ResponseStream, WorkerError> {
        WorkerSupervisor::send_request_and_watch(self, request_id, kind, body).await
    }

    async fn update_settings(&self, settings: Settings) -> Result<(), WorkerError> {
        WorkerSupervisor::update_settings(self, settings).await
    }

    async fn shutdown(&self) {
        WorkerSupervisor::shutdown(self).await
    }
}

/// Bodies of the responses for `request_id`, ending after the terminal one.
///
/// Losing messages to lag could mean losing the terminal response, so a
/// lagged subscription ends the stream with a `Rejected` body instead of
/// waiting forever.
fn response_stream(subscription: Subscription<HubMessage>, request_id: DreamId) -> ResponseStream {
    stream::unfold(Some(subscription), move |state| async move {
        let mut subscription = state?;
        loop {
            match subscription.recv().await {
                Ok(HubMessage::Response(response)) if response.request_id == request_id => {
                    let next = (!response.stopped).then_some(subscription);
                    return Some((response.body.clone(), next));
                }
                Ok(_) => continue,
                Err(HubRecvError::Lagged(skipped)) => {
                    tracing::warn!(%request_id, skipped, "Response subscriber lagged");
                    let violation = ProtocolViolation(format!(
                        "response stream lagged and lost {skipped} messages"
                    ));
                    return Some((ResponseBody::Rejected(violation), None));
                }
                Err(HubRecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
