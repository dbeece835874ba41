//! Repository for the `settings` key/value table.

use crate::models::settings::SettingsRow;
use crate::DbPool;

const COLUMNS: &str = "key, settings_json, updated_at";

pub struct SettingsRepo;

impl SettingsRepo {
    pub async fn get(pool: &DbPool, key: &str) -> Result<Option<SettingsRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM settings WHERE key = ?");
        sqlx::query_as::<_, SettingsRow>(&query)
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    /// Insert or replace the document stored under `key`.
    pub async fn upsert(
        pool: &DbPool,
        key: &str,
        settings_json: &str,
    ) -> Result<SettingsRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO settings (key, settings_json, updated_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT (key) DO UPDATE SET \
                 settings_json = excluded.settings_json, \
                 updated_at = excluded.updated_at \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, SettingsRow>(&query)
            .bind(key)
            .bind(settings_json)
            .bind(chrono::Utc::now())
            .fetch_one(pool)
            .await
    }
}
