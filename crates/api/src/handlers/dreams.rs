//! Handlers for starting and inspecting dreams.
//!
//! Progress is streamed over the WebSocket in [`crate::ws::dream_watch`];
//! both paths render snapshots through [`DreamDto`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use fusion_core::dream::{Dream, DreamImage, DreamState, StopReason};
use fusion_core::options::{DreamOptions, DreamSettings};
use fusion_core::types::{DreamId, DreamImageId, Timestamp};
use fusion_engine::{DreamManager, EngineError};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// One image of a dream as clients see it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamImageDto {
    pub id: DreamImageId,
    pub index: u32,
    pub state: DreamState,
    pub seed: Option<u32>,
    /// Where the latest preview or final image is served, once there is one.
    pub image_uri: Option<String>,
    pub finished_steps: u32,
    pub total_steps: u32,
}

/// A dream snapshot as clients see it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamDto {
    pub id: DreamId,
    pub state: DreamState,
    pub stop_reason: Option<StopReason>,
    pub message: Option<String>,
    pub seed: Option<u32>,
    pub settings: DreamSettings,
    pub images: Vec<DreamImageDto>,
    pub finished_images: usize,
    pub total_images: usize,
    pub finished_steps: u32,
    pub total_steps: u32,
    pub version: u64,
    pub created_at: Timestamp,
}

impl DreamDto {
    pub fn from_dream(manager: &DreamManager, dream: &Dream) -> Self {
        Self {
            id: dream.id(),
            state: dream.state(),
            stop_reason: dream.stop_reason(),
            message: dream.message().map(str::to_string),
            seed: dream.seed(),
            settings: dream.settings().clone(),
            images: dream
                .images()
                .iter()
                .map(|image| image_dto(manager, image))
                .collect(),
            finished_images: dream.finished_images(),
            total_images: dream.images().len(),
            finished_steps: dream.finished_steps(),
            total_steps: dream.total_steps(),
            version: dream.version(),
            created_at: dream.created_at(),
        }
    }
}

fn image_dto(manager: &DreamManager, image: &DreamImage) -> DreamImageDto {
    DreamImageDto {
        id: image.id,
        index: image.index,
        state: image.state,
        seed: image.seed,
        image_uri: image.image_key.as_ref().map(|key| manager.uri_for(key)),
        finished_steps: image.finished_steps,
        total_steps: image.total_steps,
    }
}

/// Parse a dream id path segment.
pub fn parse_dream_id(raw: &str) -> AppResult<DreamId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid dream id '{raw}'")))
}

// ---------------------------------------------------------------------------
// POST /dreams
// ---------------------------------------------------------------------------

/// Validate the options and start a dream. Responds with the initial
/// snapshot; watch the dream for progress.
pub async fn start_dream(
    State(state): State<AppState>,
    Json(options): Json<DreamOptions>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.manager.start(options).await?;
    let dto = DreamDto::from_dream(&state.manager, &snapshot);
    Ok((StatusCode::CREATED, Json(DataResponse { data: dto })))
}

// ---------------------------------------------------------------------------
// GET /dreams/{id}
// ---------------------------------------------------------------------------

pub async fn get_dream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<DreamDto>>> {
    let id = parse_dream_id(&id)?;
    let snapshot = state
        .manager
        .dream(id)
        .ok_or(EngineError::DreamNotFound(id))?;
    Ok(Json(DataResponse {
        data: DreamDto::from_dream(&state.manager, &snapshot),
    }))
}
