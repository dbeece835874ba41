//! The dream manager: starts dreams, folds worker responses into them, and
//! fans snapshots out to watchers.
//!
//! Each dream is owned by one fold task for its whole life. The manager
//! keeps only the latest published snapshot of every dream, so watchers and
//! transport handlers read without ever contending with the fold.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use futures::stream::{self, BoxStream, StreamExt};
use fusion_core::channels::CHANNEL_DREAM;
use fusion_core::dream::{Dream, DreamSnapshot, StopReason};
use fusion_core::options::DreamOptions;
use fusion_core::protocol::{GenerateBody, RequestKind};
use fusion_core::registry::{ImageKey, ImageRegistry, RegisteredImage};
use fusion_core::settings::{self, DeviceSet, Settings, DEFAULT_MODEL_SIZE};
use fusion_core::types::DreamId;
use fusion_db::models::settings::WORKER_SETTINGS_KEY;
use fusion_db::repositories::SettingsRepo;
use fusion_db::DbPool;
use fusion_events::{BroadcastHub, HubMessage, HubRecvError, Subscription};
use fusion_worker::{ResponseStream, WorkerClient};

use crate::config;
use crate::error::EngineError;
use crate::fold::{self, FoldStep};
use crate::persist::{persist_dream, PersistContext};

/// Snapshots of one dream, ending after the terminal one.
pub type DreamStream = BoxStream<'static, DreamSnapshot>;

/// Collaborators the manager is built from.
pub struct ManagerDeps {
    pub worker: Arc<dyn WorkerClient>,
    pub hub: Arc<BroadcastHub<HubMessage>>,
    pub pool: DbPool,
    pub data_dir: PathBuf,
    pub devices: DeviceSet,
}

pub struct DreamManager {
    worker: Arc<dyn WorkerClient>,
    hub: Arc<BroadcastHub<HubMessage>>,
    registry: ImageRegistry,
    pool: DbPool,
    data_dir: PathBuf,
    images_dir: PathBuf,
    devices: DeviceSet,
    settings: RwLock<Settings>,
    /// Serializes settings updates end to end, restart included.
    settings_update: tokio::sync::Mutex<()>,
    /// Latest published snapshot per dream.
    dreams: RwLock<HashMap<DreamId, DreamSnapshot>>,
}

impl DreamManager {
    /// Settings stored in the database, or the defaults for `devices`.
    pub async fn load_settings(pool: &DbPool, devices: &DeviceSet) -> Result<Settings, EngineError> {
        let Some(row) = SettingsRepo::get(pool, WORKER_SETTINGS_KEY).await? else {
            return Ok(Settings::defaults(devices));
        };
        match serde_json::from_str(&row.settings_json) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                tracing::warn!(error = %e, "Stored settings are unreadable, using defaults");
                Ok(Settings::defaults(devices))
            }
        }
    }

    /// `settings` must be the same settings the worker was started with.
    pub fn new(deps: ManagerDeps, settings: Settings) -> Arc<Self> {
        Arc::new(Self {
            worker: deps.worker,
            hub: deps.hub,
            registry: ImageRegistry::new(),
            pool: deps.pool,
            images_dir: config::images_dir(&deps.data_dir),
            data_dir: deps.data_dir,
            devices: deps.devices,
            settings: RwLock::new(settings),
            settings_update: tokio::sync::Mutex::new(()),
            dreams: RwLock::new(HashMap::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Dreams
    // -----------------------------------------------------------------------

    /// Validate `options`, create the dream, and hand it to the worker.
    ///
    /// Returns the initial `Pending` snapshot immediately; progress is only
    /// observable through [`DreamManager::watch`]. A worker that cannot be
    /// reached does not fail the call: the dream is stopped instead.
    pub async fn start(self: &Arc<Self>, options: DreamOptions) -> Result<DreamSnapshot, EngineError> {
        let settings = self.settings();
        let problems = settings.validate(&self.data_dir, &self.devices);
        if !problems.is_empty() {
            return Err(EngineError::Validation(vec![format!(
                "settings are not ready: {}",
                problems.join("; ")
            )]));
        }
        let default_size = settings
            .active_model()
            .map_or((DEFAULT_MODEL_SIZE, DEFAULT_MODEL_SIZE), |model| {
                (model.width, model.height)
            });

        let id = DreamId::new();
        let normalized = options
            .normalize(id, default_size)
            .map_err(EngineError::Validation)?;

        let uploads = [
            (&normalized.settings.base_image_key, &normalized.base_image),
            (&normalized.settings.base_image_mask_key, &normalized.base_image_mask),
        ];
        for (key, bytes) in uploads {
            if let (Some(key), Some(bytes)) = (key, bytes) {
                let image = RegisteredImage::from_encoded(bytes.clone())?;
                self.registry.register(key.clone(), image);
            }
        }

        let body = serde_json::to_value(GenerateBody {
            settings: normalized.settings.clone(),
            base_image: normalized.base_image,
            base_image_mask: normalized.base_image_mask,
        })?;

        let mut dream = Dream::new(id, normalized.settings);
        let initial = dream.commit();
        self.publish(Arc::clone(&initial));

        tracing::info!(
            dream_id = %id,
            num_images = dream.images().len(),
            "Dream started"
        );

        match self
            .worker
            .send_request_and_watch(id, RequestKind::Generate, body)
            .await
        {
            Ok(responses) => {
                tokio::spawn(Arc::clone(self).run_fold(dream, responses));
            }
            Err(e) => {
                tracing::error!(dream_id = %id, error = %e, "Worker unavailable");
                dream.stop(StopReason::WorkerUnavailable, e.to_string());
                self.publish(dream.commit());
            }
        }

        Ok(initial)
    }

    /// The current snapshot of `id`, then every later one, ending after the
    /// terminal snapshot.
    ///
    /// Watching a dream that has already ended yields exactly one snapshot.
    pub fn watch(self: &Arc<Self>, id: DreamId) -> Result<DreamStream, EngineError> {
        // Subscribe before reading the current snapshot so nothing published
        // in between is missed.
        let subscription = self.hub.subscribe(CHANNEL_DREAM);
        let current = self.dream(id).ok_or(EngineError::DreamNotFound(id))?;
        Ok(watch_stream(Arc::clone(self), subscription, current))
    }

    /// Latest published snapshot of `id`.
    pub fn dream(&self, id: DreamId) -> Option<DreamSnapshot> {
        self.dreams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Record `snapshot` as current, then fan it out. The order matters to
    /// [`DreamManager::watch`].
    fn publish(&self, snapshot: DreamSnapshot) {
        self.dreams
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot.id(), Arc::clone(&snapshot));
        self.hub.publish(CHANNEL_DREAM, HubMessage::Dream(snapshot));
    }

    async fn run_fold(self: Arc<Self>, mut dream: Dream, mut responses: ResponseStream) {
        let id = dream.id();

        while let Some(body) = responses.next().await {
            match fold::apply(&mut dream, body, &self.registry) {
                FoldStep::Continue => {
                    self.publish(dream.commit());
                }
                FoldStep::Complete { seed } => {
                    let ctx = PersistContext {
                        pool: &self.pool,
                        registry: &self.registry,
                        images_dir: &self.images_dir,
                    };
                    match persist_dream(&ctx, &dream, seed).await {
                        Ok(()) => {
                            dream.finish(seed);
                            tracing::info!(dream_id = %id, seed, "Dream finished");
                        }
                        Err(e) => {
                            tracing::error!(dream_id = %id, error = %e, "Failed to persist dream");
                            dream.stop(
                                StopReason::PersistenceFailed,
                                format!("failed to persist dream: {e}"),
                            );
                        }
                    }
                    self.publish(dream.commit());
                    return;
                }
                FoldStep::Failed { reason, message } => {
                    match reason {
                        StopReason::ProtocolViolation => {
                            tracing::warn!(dream_id = %id, reason = %message, "Protocol violation");
                        }
                        _ => {
                            tracing::warn!(dream_id = %id, ?reason, %message, "Dream stopped");
                        }
                    }
                    dream.stop(reason, message);
                    self.publish(dream.commit());
                    return;
                }
            }
        }

        // The response stream only ends early if the hub went away.
        tracing::warn!(dream_id = %id, "Response stream ended without a terminal response");
        dream.stop(
            StopReason::ProtocolViolation,
            "response stream ended without a terminal response",
        );
        self.publish(dream.commit());
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the settings wholesale and restart the worker with them.
    ///
    /// Every problem is reported at once. On rejection nothing changes:
    /// not the stored settings, not the held ones, not the worker.
    pub async fn update_settings(&self, new_settings: Settings) -> Result<Settings, EngineError> {
        let _update = self.settings_update.lock().await;

        let problems = new_settings.validate(&self.data_dir, &self.devices);
        if !problems.is_empty() {
            return Err(EngineError::InvalidSettings(problems));
        }

        let json = serde_json::to_string(&new_settings)?;
        SettingsRepo::upsert(&self.pool, WORKER_SETTINGS_KEY, &json).await?;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = new_settings.clone();

        tracing::info!(
            device = %new_settings.device,
            model = new_settings.active_model().map(|m| m.name.as_str()),
            "Settings applied"
        );

        // The settings are committed; a worker that fails to come back up
        // is retried on the next dream.
        if let Err(e) = self.worker.update_settings(new_settings.clone()).await {
            tracing::error!(error = %e, "Failed to restart worker with new settings");
        }

        Ok(new_settings)
    }

    pub fn is_ready(&self) -> bool {
        self.settings().is_ready(&self.data_dir, &self.devices)
    }

    /// Device names in priority order.
    pub fn available_devices(&self) -> Vec<String> {
        self.devices.names()
    }

    pub fn models_dir(&self) -> PathBuf {
        settings::models_dir(&self.data_dir)
    }

    // -----------------------------------------------------------------------
    // Images
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    pub fn image(&self, key: &ImageKey) -> Result<Arc<RegisteredImage>, EngineError> {
        Ok(self.registry.get(key)?)
    }

    /// Request path under which `key` is served.
    pub fn uri_for(&self, key: &ImageKey) -> String {
        key.uri()
    }

    /// Inverse of [`DreamManager::uri_for`].
    pub fn key_from_path(&self, path: &str) -> Result<ImageKey, EngineError> {
        Ok(ImageKey::from_uri_path(path)?)
    }

    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
    }
}

struct WatchState {
    manager: Arc<DreamManager>,
    subscription: Subscription<HubMessage>,
    next: Option<DreamSnapshot>,
    last_version: u64,
}

fn watch_stream(
    manager: Arc<DreamManager>,
    subscription: Subscription<HubMessage>,
    current: DreamSnapshot,
) -> DreamStream {
    let id = current.id();
    let state = WatchState {
        manager,
        subscription,
        next: Some(current),
        last_version: 0,
    };

    stream::unfold(Some(state), move |state| async move {
        let mut state = state?;
        loop {
            if let Some(snapshot) = state.next.take() {
                // Snapshots already yielded (or older) are skipped.
                if snapshot.version() > state.last_version {
                    state.last_version = snapshot.version();
                    let next = (!snapshot.is_terminal()).then_some(state);
                    return Some((snapshot, next));
                }
                continue;
            }

            match state.subscription.recv().await {
                Ok(HubMessage::Dream(snapshot)) if snapshot.id() == id => {
                    state.next = Some(snapshot);
                }
                Ok(_) => {}
                Err(HubRecvError::Lagged(skipped)) => {
                    tracing::warn!(dream_id = %id, skipped, "Dream watcher lagged, resyncing");
                    state.next = state.manager.dream(id);
                }
                Err(HubRecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
