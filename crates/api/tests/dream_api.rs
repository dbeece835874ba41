//! Integration tests for starting dreams and serving their images.

mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::{body_bytes, body_json, get, send_json};
use futures::StreamExt;
use serde_json::json;

use fusion_core::dream::DreamState;
use fusion_core::imaging;
use fusion_core::types::DreamId;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Wait until the dream has reached a terminal state.
async fn wait_for_end(app: &common::TestApp, id: DreamId) -> DreamState {
    let snapshots: Vec<_> = tokio::time::timeout(TIMEOUT, app.manager.watch(id).unwrap().collect())
        .await
        .expect("dream did not end");
    snapshots.last().unwrap().state()
}

// ---------------------------------------------------------------------------
// Test: POST /dreams returns 201 with the pending snapshot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_dream_returns_201_with_pending_snapshot() {
    let app = common::build_test_app().await;

    let response = send_json(
        app.router.clone(),
        Method::POST,
        "/api/v1/dreams",
        json!({ "prompt": "a lighthouse at dusk", "numImages": 2, "seed": 11 }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    let dream = &json["data"];
    assert_eq!(dream["state"], "pending");
    assert_eq!(dream["totalImages"], 2);
    assert_eq!(dream["finishedImages"], 0);
    assert_eq!(dream["settings"]["width"], 64);
    assert_eq!(dream["images"][1]["seed"], 12);
    assert!(dream["images"][0]["imageUri"].is_null());
}

// ---------------------------------------------------------------------------
// Test: a finished dream is readable and its images are served
// ---------------------------------------------------------------------------

#[tokio::test]
async fn finished_dream_serves_its_images() {
    let app = common::build_test_app().await;

    let response = send_json(
        app.router.clone(),
        Method::POST,
        "/api/v1/dreams",
        json!({ "prompt": "a lighthouse at dusk", "numImages": 2, "seed": 11 }),
    )
    .await;
    let id: DreamId = body_json(response).await["data"]["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(wait_for_end(&app, id).await, DreamState::Finished);

    let response = get(app.router.clone(), &format!("/api/v1/dreams/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let dream = &json["data"];
    assert_eq!(dream["state"], "finished");
    assert_eq!(dream["finishedImages"], 2);
    assert_eq!(dream["seed"], 11);

    let uri = dream["images"][0]["imageUri"].as_str().unwrap().to_string();
    assert!(uri.starts_with(&format!("/images/dreams/{id}/")));

    let response = get(app.router.clone(), &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/png");
    let bytes = body_bytes(response).await;
    assert_eq!(imaging::dimensions(&bytes).unwrap(), (64, 64));
}

// ---------------------------------------------------------------------------
// Test: invalid options list every problem
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_options_return_400_with_details() {
    let app = common::build_test_app().await;

    let response = send_json(
        app.router.clone(),
        Method::POST,
        "/api/v1/dreams",
        json!({ "prompt": "", "numImages": 40, "width": 100 }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(json["details"].as_array().unwrap().len() >= 3);
}

// ---------------------------------------------------------------------------
// Test: unknown and malformed dream ids
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_dream_returns_404() {
    let app = common::build_test_app().await;

    let response = get(app.router.clone(), &format!("/api/v1/dreams/{}", DreamId::new())).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_dream_id_returns_400() {
    let app = common::build_test_app().await;

    let response = get(app.router.clone(), "/api/v1/dreams/not-a-uuid").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
}

// ---------------------------------------------------------------------------
// Test: image paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unregistered_image_returns_404() {
    let app = common::build_test_app().await;

    let response = get(
        app.router.clone(),
        &format!("/images/dreams/{}/base.png", DreamId::new()),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn image_path_without_png_suffix_returns_400() {
    let app = common::build_test_app().await;

    let response = get(app.router.clone(), "/images/dreams/abc/base.jpg").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
