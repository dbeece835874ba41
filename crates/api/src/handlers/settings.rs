//! Handlers for the worker settings.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use fusion_core::settings::Settings;
use fusion_engine::DreamManager;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// The held settings plus what a client needs to edit them.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDto {
    #[serde(flatten)]
    pub settings: Settings,
    pub is_ready: bool,
    pub available_devices: Vec<String>,
    pub models_dir: String,
}

impl SettingsDto {
    fn current(manager: &DreamManager) -> Self {
        Self {
            settings: manager.settings(),
            is_ready: manager.is_ready(),
            available_devices: manager.available_devices(),
            models_dir: manager.models_dir().display().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// GET /settings
// ---------------------------------------------------------------------------

pub async fn get_settings(State(state): State<AppState>) -> Json<DataResponse<SettingsDto>> {
    Json(DataResponse {
        data: SettingsDto::current(&state.manager),
    })
}

// ---------------------------------------------------------------------------
// PUT /settings
// ---------------------------------------------------------------------------

/// Replace the settings wholesale. Every problem is reported in one 422;
/// on success the worker is restarted with the new settings.
pub async fn update_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> AppResult<Json<DataResponse<SettingsDto>>> {
    state.manager.update_settings(settings).await?;
    Ok(Json(DataResponse {
        data: SettingsDto::current(&state.manager),
    }))
}
