#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use fusion_api::config::ServerConfig;
use fusion_api::router::build_app_router;
use fusion_api::state::AppState;
use fusion_core::imaging;
use fusion_core::protocol::{ImageProgress, RequestKind, ResponseBody, WorkerImageState};
use fusion_core::settings::{DeviceSet, ModelConfig, Settings};
use fusion_core::types::DreamId;
use fusion_engine::{DreamManager, ManagerDeps};
use fusion_events::{BroadcastHub, HubMessage};
use fusion_worker::{ResponseStream, WorkerClient, WorkerError};

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:3000".to_string()],
        request_timeout_secs: 30,
        json_logs: false,
    }
}

// ---------------------------------------------------------------------------
// Worker double
// ---------------------------------------------------------------------------

/// Completes every generate request at once with solid-colour images of
/// the requested size.
#[derive(Default)]
pub struct InstantWorker {
    pub settings_updates: Mutex<Vec<Settings>>,
}

#[async_trait]
impl WorkerClient for InstantWorker {
    async fn send_request_and_watch(
        &self,
        _request_id: DreamId,
        _kind: RequestKind,
        body: serde_json::Value,
    ) -> Result<ResponseStream, WorkerError> {
        let field = |name: &str| body[name].as_u64().unwrap_or(1) as u32;
        let (num_images, width, height, seed) =
            (field("numImages"), field("width"), field("height"), field("seed"));

        let images = (0..num_images)
            .map(|i| ImageProgress {
                state: WorkerImageState::Complete,
                seed: Some(seed.wrapping_add(i)),
                image: Some(imaging::solid_png(width, height, [i as u8, 90, 160]).unwrap()),
                completed_steps: None,
                total_steps: None,
            })
            .collect();
        let complete = ResponseBody::Complete { images, seed };
        Ok(stream::iter([complete]).boxed())
    }

    async fn update_settings(&self, settings: Settings) -> Result<(), WorkerError> {
        self.settings_updates.lock().unwrap().push(settings);
        Ok(())
    }

    async fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub manager: Arc<DreamManager>,
    pub worker: Arc<InstantWorker>,
    pub data_dir: TempDir,
}

fn write_model_files(data_dir: &Path) {
    std::fs::create_dir_all(data_dir.join("models")).unwrap();
    std::fs::create_dir_all(data_dir.join("configs")).unwrap();
    std::fs::write(data_dir.join("models/sd-v1-4.ckpt"), b"weights").unwrap();
    std::fs::write(data_dir.join("configs/v1-inference.yaml"), b"config").unwrap();
}

/// Settings that are ready against the files [`build_test_app`] writes.
pub fn ready_settings() -> Settings {
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
        show_previews: true,
        steps_per_preview: Some(5),
    }
}

/// Build the full application router with all middleware layers over a
/// fresh in-memory database and a temporary data dir.
///
/// Uses the same [`build_app_router`] as `main.rs`, so tests exercise the
/// production middleware stack.
pub async fn build_test_app() -> TestApp {
    let data_dir = tempfile::tempdir().unwrap();
    write_model_files(data_dir.path());
    let pool = fusion_db::create_memory_pool().await.unwrap();
    let worker = Arc::new(InstantWorker::default());

    let manager = DreamManager::new(
        ManagerDeps {
            worker: Arc::clone(&worker) as Arc<dyn WorkerClient>,
            hub: Arc::new(BroadcastHub::<HubMessage>::default()),
            pool: pool.clone(),
            data_dir: data_dir.path().to_path_buf(),
            devices: DeviceSet::from_names(["cpu"]),
        },
        ready_settings(),
    );

    let config = test_config();
    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        manager: Arc::clone(&manager),
    };
    let router = build_app_router(state, &config).unwrap();

    TestApp {
        router,
        manager,
        worker,
        data_dir,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn send_json(
    app: Router,
    method: Method,
    uri: &str,
    body: serde_json::Value,
) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
