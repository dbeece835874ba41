//! Rows for the `dreams` and `dream_images` tables.

use fusion_core::types::Timestamp;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `dreams` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DreamRow {
    pub id: String,
    pub prompt: String,
    pub seed: i64,
    pub num_images: i64,
    pub settings_json: String,
    pub base_image_path: Option<String>,
    pub base_image_mask_path: Option<String>,
    pub created_at: Timestamp,
}

/// A row from the `dream_images` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DreamImageRow {
    pub id: String,
    pub dream_id: String,
    pub seed: i64,
    pub image_index: i64,
    pub image_path: String,
    pub width: i64,
    pub height: i64,
    pub perceptual_hash: String,
}

/// Insert payload for a finished dream.
#[derive(Debug, Clone)]
pub struct NewDream {
    pub id: String,
    pub prompt: String,
    pub seed: u32,
    pub num_images: u32,
    pub settings_json: String,
    pub base_image_path: Option<String>,
    pub base_image_mask_path: Option<String>,
    pub created_at: Timestamp,
}

/// Insert payload for one image of a finished dream.
#[derive(Debug, Clone)]
pub struct NewDreamImage {
    pub id: String,
    pub seed: u32,
    pub image_index: u32,
    /// Relative to the images directory.
    pub image_path: String,
    pub width: u32,
    pub height: u32,
    pub perceptual_hash: String,
}
