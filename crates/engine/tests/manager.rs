//! Dream manager tests against a scripted in-process worker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use fusion_core::dream::{DreamSnapshot, DreamState, StopReason};
use fusion_core::imaging;
use fusion_core::options::DreamOptions;
use fusion_core::protocol::{ImageProgress, RequestKind, ResponseBody, WorkerImageState};
use fusion_core::settings::{DeviceSet, ModelConfig, Settings};
use fusion_core::types::DreamId;
use fusion_db::repositories::DreamRepo;
use fusion_db::{create_memory_pool, DbPool};
use fusion_engine::{DreamManager, EngineError, ManagerDeps};
use fusion_events::{BroadcastHub, HubMessage};
use fusion_worker::{ResponseStream, WorkerClient, WorkerError};
use tempfile::TempDir;
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Scripted worker
// ---------------------------------------------------------------------------

/// A worker whose responses are pushed by the test, per request.
#[derive(Default)]
struct ScriptedWorker {
    streams: Mutex<HashMap<DreamId, mpsc::UnboundedSender<ResponseBody>>>,
    requests: Mutex<Vec<(DreamId, RequestKind, serde_json::Value)>>,
    settings_updates: Mutex<Vec<Settings>>,
    unavailable: AtomicBool,
}

impl ScriptedWorker {
    fn respond(&self, id: DreamId, body: ResponseBody) {
        self.streams.lock().unwrap()[&id].send(body).unwrap();
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn settings_update_count(&self) -> usize {
        self.settings_updates.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerClient for ScriptedWorker {
    async fn send_request_and_watch(
        &self,
        request_id: DreamId,
        kind: RequestKind,
        body: serde_json::Value,
    ) -> Result<ResponseStream, WorkerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(WorkerError::ShuttingDown);
        }
        self.requests.lock().unwrap().push((request_id, kind, body));

        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().insert(request_id, tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|body| (body, rx)) }).boxed())
    }

    async fn update_settings(&self, settings: Settings) -> Result<(), WorkerError> {
        self.settings_updates.lock().unwrap().push(settings);
        Ok(())
    }

    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    manager: Arc<DreamManager>,
    worker: Arc<ScriptedWorker>,
    pool: DbPool,
    data_dir: TempDir,
}

fn write_model_files(data_dir: &Path) {
    std::fs::create_dir_all(data_dir.join("models")).unwrap();
    std::fs::create_dir_all(data_dir.join("configs")).unwrap();
    std::fs::write(data_dir.join("models/sd-v1-4.ckpt"), b"weights").unwrap();
    std::fs::write(data_dir.join("configs/v1-inference.yaml"), b"config").unwrap();
}

fn ready_settings() -> Settings {
    Settings {
        models: vec![ModelConfig {
            name: "sd-v1-4".to_string(),
            weights_filename: "sd-v1-4.ckpt".to_string(),
            config_filename: "v1-inference.yaml".to_string(),
            width: 64,
            height: 64,
            active: true,
        }],
        device: "cpu".to_string(),
        use_full_precision: false,
        show_previews: false,
        steps_per_preview: None,
    }
}

async fn harness_with(settings: Settings) -> Harness {
    harness_with_hub(settings, BroadcastHub::default()).await
}

async fn harness_with_hub(settings: Settings, hub: BroadcastHub<HubMessage>) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    write_model_files(data_dir.path());
    let pool = create_memory_pool().await.unwrap();
    let worker = Arc::new(ScriptedWorker::default());

    let manager = DreamManager::new(
        ManagerDeps {
            worker: Arc::clone(&worker) as Arc<dyn WorkerClient>,
            hub: Arc::new(hub),
            pool: pool.clone(),
            data_dir: data_dir.path().to_path_buf(),
            devices: DeviceSet::from_names(["cpu"]),
        },
        settings,
    );

    Harness {
        manager,
        worker,
        pool,
        data_dir,
    }
}

async fn harness() -> Harness {
    harness_with(ready_settings()).await
}

fn options(num_images: u32, seed: u32) -> DreamOptions {
    DreamOptions {
        prompt: "a fox in the snow".to_string(),
        num_images: Some(num_images),
        seed: Some(seed),
        sampler_steps: Some(10),
        ..Default::default()
    }
}

fn png(rgb: [u8; 3]) -> Vec<u8> {
    imaging::solid_png(64, 64, rgb).unwrap()
}

fn image(state: WorkerImageState, bytes: Option<Vec<u8>>) -> ImageProgress {
    ImageProgress {
        state,
        seed: None,
        image: bytes,
        completed_steps: None,
        total_steps: None,
    }
}

fn running(images: Vec<ImageProgress>) -> ResponseBody {
    ResponseBody::Running {
        image_progress: images,
    }
}

fn complete(num_images: u32, seed: u32) -> ResponseBody {
    ResponseBody::Complete {
        images: (0..num_images)
            .map(|i| ImageProgress {
                seed: Some(seed + i),
                ..image(WorkerImageState::Complete, Some(png([i as u8, 0, 0])))
            })
            .collect(),
        seed,
    }
}

async fn collect(stream: fusion_engine::DreamStream) -> Vec<DreamSnapshot> {
    tokio::time::timeout(TIMEOUT, stream.collect())
        .await
        .expect("watch did not end")
}

fn states(snapshots: &[DreamSnapshot]) -> Vec<DreamState> {
    snapshots.iter().map(|s| s.state()).collect()
}

/// Wait until the manager holds a terminal snapshot of `id`.
async fn wait_until_ended(manager: &DreamManager, id: DreamId) {
    tokio::time::timeout(TIMEOUT, async {
        while !manager.dream(id).is_some_and(|d| d.is_terminal()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dream did not end");
}

// ---------------------------------------------------------------------------
// Dreams
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batched_dream_is_observed_pending_running_finished() {
    let h = harness().await;
    let dream = h.manager.start(options(2, 42)).await.unwrap();
    assert_eq!(dream.state(), DreamState::Pending);
    assert_eq!(dream.images().len(), 2);

    let first = h.manager.watch(dream.id()).unwrap();
    let second = h.manager.watch(dream.id()).unwrap();

    h.worker.respond(
        dream.id(),
        running(vec![
            image(WorkerImageState::Complete, Some(png([255, 0, 0]))),
            image(WorkerImageState::Running, None),
        ]),
    );
    h.worker.respond(dream.id(), complete(2, 42));

    let (first, second) = tokio::join!(collect(first), collect(second));

    assert_eq!(
        states(&first),
        [DreamState::Pending, DreamState::Running, DreamState::Finished]
    );
    let running = &first[1];
    assert_eq!(running.images()[0].state, DreamState::Finished);
    assert_eq!(running.images()[1].state, DreamState::Running);

    let finished = first.last().unwrap();
    assert_eq!(finished.seed(), Some(42));
    assert!(finished
        .images()
        .iter()
        .all(|image| image.state == DreamState::Finished));
    assert!(first.iter().all(|s| s.images().len() == 2));

    // Concurrent watchers agree on the outcome.
    assert_eq!(**finished, **second.last().unwrap());

    assert_eq!(DreamRepo::count(&h.pool).await.unwrap(), 1);
    let rows = DreamRepo::list_images(&h.pool, &dream.id().to_string())
        .await
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.seed).collect::<Vec<_>>(), [42, 43]);
}

#[tokio::test]
async fn complete_frame_supplies_bytes_for_images_finished_without_them() {
    let h = harness().await;
    let dream = h.manager.start(options(2, 42)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();

    h.worker.respond(
        dream.id(),
        running(vec![
            image(WorkerImageState::Complete, None),
            image(WorkerImageState::Running, None),
        ]),
    );
    h.worker.respond(dream.id(), complete(2, 42));

    let last = collect(watch).await.pop().unwrap();

    assert_eq!(last.state(), DreamState::Finished);
    assert!(last.images().iter().all(|image| image.image_key.is_some()));
    let rows = DreamRepo::list_images(&h.pool, &dream.id().to_string())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn complete_frame_seeds_win_over_earlier_running_frames() {
    let h = harness().await;
    let dream = h.manager.start(options(2, 1)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();

    h.worker.respond(
        dream.id(),
        running(vec![
            image(WorkerImageState::Complete, Some(png([3, 3, 3]))),
            image(WorkerImageState::Running, None),
        ]),
    );
    h.worker.respond(dream.id(), complete(2, 1000));

    let last = collect(watch).await.pop().unwrap();

    assert_eq!(last.state(), DreamState::Finished);
    assert_eq!(
        last.images().iter().map(|image| image.seed).collect::<Vec<_>>(),
        [Some(1000), Some(1001)]
    );
    let rows = DreamRepo::list_images(&h.pool, &dream.id().to_string())
        .await
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.seed).collect::<Vec<_>>(), [1000, 1001]);
}

#[tokio::test]
async fn persistence_failure_stops_dream_without_rows() {
    let h = harness().await;
    // A file where the images directory belongs makes every write fail.
    std::fs::write(h.data_dir.path().join("images"), b"not a directory").unwrap();

    let dream = h.manager.start(options(1, 5)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();
    h.worker.respond(dream.id(), complete(1, 5));

    let snapshots = collect(watch).await;
    let last = snapshots.last().unwrap();

    assert_eq!(snapshots.iter().filter(|s| s.is_terminal()).count(), 1);
    assert_eq!(last.state(), DreamState::Stopped);
    assert_eq!(last.stop_reason(), Some(StopReason::PersistenceFailed));
    assert!(last.message().unwrap().starts_with("failed to persist dream"));
    assert_eq!(DreamRepo::count(&h.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn lagging_watcher_resyncs_to_latest_snapshot() {
    let h = harness_with_hub(ready_settings(), BroadcastHub::new(1)).await;
    let dream = h.manager.start(options(1, 9)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();

    // The watcher is not polled while the fold publishes, so it falls behind.
    for steps in 1..=4 {
        h.worker.respond(
            dream.id(),
            running(vec![ImageProgress {
                completed_steps: Some(steps),
                ..image(WorkerImageState::Running, None)
            }]),
        );
    }
    h.worker.respond(dream.id(), complete(1, 9));
    wait_until_ended(&h.manager, dream.id()).await;

    let snapshots = collect(watch).await;

    assert!(snapshots.len() < 6, "lagged watcher skipped ahead: {snapshots:?}");
    assert!(snapshots
        .windows(2)
        .all(|pair| pair[0].version() < pair[1].version()));
    assert_eq!(snapshots.first().unwrap().state(), DreamState::Pending);
    assert_eq!(snapshots.last().unwrap().state(), DreamState::Finished);
    assert_eq!(snapshots.iter().filter(|s| s.is_terminal()).count(), 1);
}

#[tokio::test]
async fn watching_a_finished_dream_yields_one_snapshot() {
    let h = harness().await;
    let dream = h.manager.start(options(1, 7)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();
    h.worker.respond(dream.id(), complete(1, 7));
    collect(watch).await;

    let late = collect(h.manager.watch(dream.id()).unwrap()).await;

    assert_eq!(late.len(), 1);
    assert_eq!(late[0].state(), DreamState::Finished);
}

#[tokio::test]
async fn crash_stops_dream_and_keeps_finished_images() {
    let h = harness().await;
    let dream = h.manager.start(options(2, 1)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();

    h.worker.respond(
        dream.id(),
        running(vec![
            image(WorkerImageState::Complete, Some(png([1, 1, 1]))),
            image(WorkerImageState::Running, None),
        ]),
    );
    h.worker.respond(
        dream.id(),
        ResponseBody::Error {
            message: "worker process died while waiting for response".to_string(),
            crashed: true,
        },
    );

    let snapshots = collect(watch).await;
    let last = snapshots.last().unwrap();

    assert_eq!(
        snapshots.iter().filter(|s| s.is_terminal()).count(),
        1,
        "exactly one terminal snapshot"
    );
    assert_eq!(last.state(), DreamState::Stopped);
    assert_eq!(last.stop_reason(), Some(StopReason::WorkerCrashed));
    assert_eq!(last.images()[0].state, DreamState::Finished);
    assert_eq!(last.images()[1].state, DreamState::Stopped);
    assert_eq!(DreamRepo::count(&h.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn protocol_violation_stops_dream() {
    let h = harness().await;
    let dream = h.manager.start(options(2, 1)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();

    h.worker.respond(
        dream.id(),
        ResponseBody::Complete {
            images: vec![
                image(WorkerImageState::Complete, Some(png([0, 0, 0]))),
                image(WorkerImageState::Pending, None),
            ],
            seed: 1,
        },
    );

    let last = collect(watch).await.pop().unwrap();
    assert_eq!(last.stop_reason(), Some(StopReason::ProtocolViolation));
    assert_eq!(DreamRepo::count(&h.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn unreachable_worker_stops_dream_without_failing_start() {
    let h = harness().await;
    h.worker.unavailable.store(true, Ordering::SeqCst);

    let dream = h.manager.start(options(1, 1)).await.unwrap();
    let snapshots = collect(h.manager.watch(dream.id()).unwrap()).await;

    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].stop_reason(), Some(StopReason::WorkerUnavailable));
}

#[tokio::test]
async fn invalid_options_are_rejected_before_the_worker() {
    let h = harness().await;
    let options = DreamOptions {
        prompt: String::new(),
        num_images: Some(40),
        base_image_mask: Some(png([0, 0, 0])),
        ..Default::default()
    };

    let err = h.manager.start(options).await.unwrap_err();

    let EngineError::Validation(messages) = err else {
        panic!("Expected Validation, got {err:?}");
    };
    assert!(messages.len() >= 3, "every problem is reported: {messages:?}");
    assert_eq!(h.worker.request_count(), 0);
}

#[tokio::test]
async fn start_requires_ready_settings() {
    let h = harness_with(Settings::defaults(&DeviceSet::from_names(["cpu"]))).await;

    let err = h.manager.start(options(1, 1)).await.unwrap_err();

    assert_matches!(err, EngineError::Validation(messages) if messages[0].starts_with("settings are not ready"));
    assert_eq!(h.worker.request_count(), 0);
}

#[tokio::test]
async fn base_image_is_registered_and_sent_with_request() {
    let h = harness().await;
    let base = imaging::solid_png(200, 130, [9, 9, 9]).unwrap();
    let options = DreamOptions {
        prompt: "repaint this".to_string(),
        base_image: Some(base),
        ..Default::default()
    };

    let dream = h.manager.start(options).await.unwrap();

    let key = dream.settings().base_image_key.clone().unwrap();
    assert_eq!(h.manager.image(&key).unwrap().width, 200);
    assert_eq!((dream.settings().width, dream.settings().height), (192, 128));

    let requests = h.worker.requests.lock().unwrap();
    let body = &requests[0].2;
    assert!(body["baseImage"].is_string());
    assert_eq!(body["baseImageKey"], key.as_str());
}

#[tokio::test]
async fn image_uris_round_trip_to_registered_images() {
    let h = harness().await;
    let dream = h.manager.start(options(1, 3)).await.unwrap();
    let watch = h.manager.watch(dream.id()).unwrap();
    h.worker.respond(dream.id(), complete(1, 3));
    let finished = collect(watch).await.pop().unwrap();

    let key = finished.images()[0].image_key.clone().unwrap();
    let uri = h.manager.uri_for(&key);
    assert!(uri.starts_with("/images/dreams/"));
    assert!(uri.ends_with(".png"));
    assert_eq!(h.manager.key_from_path(&uri).unwrap(), key);
    assert!(h.manager.image(&key).is_ok());
}

#[tokio::test]
async fn watching_an_unknown_dream_fails() {
    let h = harness().await;
    let id = DreamId::new();
    assert_matches!(h.manager.watch(id).err(), Some(EngineError::DreamNotFound(missing)) if missing == id);
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsupported_device_is_rejected_without_side_effects() {
    let h = harness().await;
    let before = h.manager.settings();

    let mut requested = ready_settings();
    requested.device = "cuda:9".to_string();
    let err = h.manager.update_settings(requested).await.unwrap_err();

    let EngineError::InvalidSettings(messages) = err else {
        panic!("Expected InvalidSettings, got {err:?}");
    };
    assert!(messages.contains(&"unsupported device: cuda:9".to_string()));
    assert_eq!(h.manager.settings(), before);
    assert_eq!(h.worker.settings_update_count(), 0);
}

#[tokio::test]
async fn every_settings_problem_is_reported() {
    let h = harness().await;
    let mut requested = ready_settings();
    requested.models[0].active = false;
    requested.models[0].weights_filename = "../escape.ckpt".to_string();
    requested.show_previews = true;

    let Err(EngineError::InvalidSettings(messages)) = h.manager.update_settings(requested).await
    else {
        panic!("Expected InvalidSettings");
    };

    assert!(messages.contains(&"no active model".to_string()));
    assert!(messages.contains(&"unsafe model filename '../escape.ckpt'".to_string()));
    assert!(messages.contains(&"steps per preview is required when previews are enabled".to_string()));
}

#[tokio::test]
async fn valid_settings_are_stored_and_restart_the_worker() {
    let h = harness_with(Settings::defaults(&DeviceSet::from_names(["cpu"]))).await;
    assert!(!h.manager.is_ready());

    let applied = h.manager.update_settings(ready_settings()).await.unwrap();

    assert_eq!(applied, ready_settings());
    assert!(h.manager.is_ready());
    assert_eq!(h.worker.settings_update_count(), 1);

    let devices = DeviceSet::from_names(["cpu"]);
    let stored = DreamManager::load_settings(&h.pool, &devices).await.unwrap();
    assert_eq!(stored, ready_settings());
}

#[tokio::test]
async fn missing_stored_settings_fall_back_to_defaults() {
    let pool = create_memory_pool().await.unwrap();
    let devices = DeviceSet::from_names(["cpu", "cuda"]);

    let settings = DreamManager::load_settings(&pool, &devices).await.unwrap();

    assert_eq!(settings, Settings::defaults(&devices));
    assert_eq!(settings.device, "cuda");
}
