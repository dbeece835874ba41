//! Committing a completed dream: image files plus database rows.
//!
//! Files are written first, then the dream and image rows are inserted in
//! one transaction. If anything fails, the files written so far are removed
//! again so the images directory never references an uncommitted dream.

use std::path::{Path, PathBuf};

use fusion_core::dream::Dream;
use fusion_core::imaging;
use fusion_core::registry::{ImageKey, ImageRegistry, RegisteredImage};
use fusion_db::models::dream::{NewDream, NewDreamImage};
use fusion_db::repositories::DreamRepo;
use fusion_db::DbPool;
use image::ImageFormat;

use crate::error::EngineError;

const BASE_IMAGE_FILE: &str = "base.png";
const BASE_IMAGE_MASK_FILE: &str = "mask.png";

/// Everything persistence needs besides the dream itself.
pub struct PersistContext<'a> {
    pub pool: &'a DbPool,
    pub registry: &'a ImageRegistry,
    pub images_dir: &'a Path,
}

/// Write `dream`'s images and rows. `seed` is the worker's final seed.
pub async fn persist_dream(
    ctx: &PersistContext<'_>,
    dream: &Dream,
    seed: u32,
) -> Result<(), EngineError> {
    let mut written = Vec::new();
    let result = write_dream(ctx, dream, seed, &mut written).await;

    if result.is_err() {
        let dream_dir = ctx.images_dir.join(dream.id().to_string());
        remove_files(&dream_dir, &written).await;
    }
    result
}

async fn write_dream(
    ctx: &PersistContext<'_>,
    dream: &Dream,
    seed: u32,
    written: &mut Vec<PathBuf>,
) -> Result<(), EngineError> {
    let dream_dir = dream.id().to_string();
    tokio::fs::create_dir_all(ctx.images_dir.join(&dream_dir)).await?;

    let mut images = Vec::with_capacity(dream.images().len());
    for image in dream.images() {
        let key = image.image_key.as_ref().ok_or_else(|| {
            EngineError::Validation(vec![format!("image {} has no bytes", image.index)])
        })?;
        let relative = format!("{dream_dir}/{}.png", image.id);
        let stored = write_image(ctx, key, &relative, written).await?;

        images.push(NewDreamImage {
            id: image.id.to_string(),
            seed: image.seed.unwrap_or(seed.wrapping_add(image.index)),
            image_index: image.index,
            image_path: relative,
            width: stored.width,
            height: stored.height,
            perceptual_hash: stored.perceptual_hash,
        });
    }

    let settings = dream.settings();
    let base_image_path = match &settings.base_image_key {
        Some(key) => {
            let relative = format!("{dream_dir}/{BASE_IMAGE_FILE}");
            write_image(ctx, key, &relative, written).await?;
            Some(relative)
        }
        None => None,
    };
    let base_image_mask_path = match &settings.base_image_mask_key {
        Some(key) => {
            let relative = format!("{dream_dir}/{BASE_IMAGE_MASK_FILE}");
            write_image(ctx, key, &relative, written).await?;
            Some(relative)
        }
        None => None,
    };

    let new_dream = NewDream {
        id: dream.id().to_string(),
        prompt: settings.prompt.clone(),
        seed,
        num_images: settings.num_images,
        settings_json: serde_json::to_string(settings)?,
        base_image_path,
        base_image_mask_path,
        created_at: dream.created_at(),
    };
    DreamRepo::insert_finished(ctx.pool, &new_dream, &images).await?;

    tracing::info!(
        dream_id = %dream.id(),
        images = images.len(),
        "Dream persisted"
    );
    Ok(())
}

struct StoredImage {
    width: u32,
    height: u32,
    perceptual_hash: String,
}

/// Write the registered image under `key` to `relative` as PNG.
async fn write_image(
    ctx: &PersistContext<'_>,
    key: &ImageKey,
    relative: &str,
    written: &mut Vec<PathBuf>,
) -> Result<StoredImage, EngineError> {
    let registered = ctx.registry.get(key)?;

    // Decoding and hashing are CPU-bound.
    let (png, stored) = tokio::task::spawn_blocking(move || encode_for_storage(&registered))
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;

    let path = ctx.images_dir.join(relative);
    tokio::fs::write(&path, png).await?;
    written.push(path);
    Ok(stored)
}

fn encode_for_storage(
    registered: &RegisteredImage,
) -> Result<(Vec<u8>, StoredImage), EngineError> {
    let decoded = imaging::decode(&registered.bytes)?;
    let stored = StoredImage {
        width: decoded.width(),
        height: decoded.height(),
        perceptual_hash: imaging::hash_hex(imaging::difference_hash(&decoded)),
    };
    let png = match image::guess_format(&registered.bytes) {
        Ok(ImageFormat::Png) => registered.bytes.clone(),
        _ => imaging::encode_png(&decoded)?,
    };
    Ok((png, stored))
}

async fn remove_files(dream_dir: &Path, paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial dream file");
        }
    }
    // Only succeeds if nothing else lives there.
    let _ = tokio::fs::remove_dir(dream_dir).await;
}
