use fusion_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// Key under which the worker settings document is stored.
pub const WORKER_SETTINGS_KEY: &str = "settings";

/// A row from the `settings` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SettingsRow {
    pub key: String,
    pub settings_json: String,
    pub updated_at: Timestamp,
}
