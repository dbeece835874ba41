//! Dream options as submitted by a client, and their normalized form.
//!
//! [`DreamOptions::normalize`] is the single gate between client input and
//! a [`Dream`](crate::dream::Dream): it assigns a seed, decodes uploaded
//! images, derives output dimensions, and collects every violation.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::imaging;
use crate::registry::ImageKey;
use crate::types::DreamId;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on images per dream.
pub const MAX_NUM_IMAGES: u32 = 16;

/// Longest accepted prompt, in characters after trimming.
pub const MAX_PROMPT_CHARS: usize = 1000;

pub const DEFAULT_SAMPLER_STEPS: u32 = 50;

pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

/// Images submitted to the model per batch unless the client says otherwise.
pub const DEFAULT_IMAGES_PER_BATCH: u32 = 2;

/// How much of the base image survives when no decimation is supplied.
pub const DEFAULT_BASE_IMAGE_DECIMATION: f32 = 0.75;

/// Output dimensions must be a multiple of this (the latent grid size).
pub const SIZE_STEP: u32 = 64;

pub const MAX_SIZE: u32 = 2048;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sampler {
    Ddim,
    #[default]
    Plms,
}

/// Client-supplied dream options. Every field but the prompt is optional.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DreamOptions {
    /// Checked after trimming, in [`DreamOptions::normalize`].
    pub prompt: String,

    #[validate(range(min = 1, max = 16, message = "numImages must be between 1 and 16"))]
    pub num_images: Option<u32>,

    pub seed: Option<u32>,

    pub sampler: Option<Sampler>,

    #[validate(range(min = 1, max = 500, message = "samplerSteps must be between 1 and 500"))]
    pub sampler_steps: Option<u32>,

    #[validate(range(min = 0.0, max = 1.0, message = "samplerEta must be between 0 and 1"))]
    pub sampler_eta: Option<f32>,

    #[validate(range(min = 0.0, max = 50.0, message = "guidanceScale must be between 0 and 50"))]
    pub guidance_scale: Option<f32>,

    #[validate(range(min = 1, max = 16, message = "numImagesPerBatch must be between 1 and 16"))]
    pub num_images_per_batch: Option<u32>,

    #[validate(range(min = 64, max = 2048, message = "width must be between 64 and 2048"))]
    pub width: Option<u32>,

    #[validate(range(min = 64, max = 2048, message = "height must be between 64 and 2048"))]
    pub height: Option<u32>,

    #[serde(default, with = "crate::protocol::base64_bytes")]
    pub base_image: Option<Vec<u8>>,

    #[serde(default, with = "crate::protocol::base64_bytes")]
    pub base_image_mask: Option<Vec<u8>>,

    #[validate(range(
        min = 0.0,
        max = 1.0,
        message = "baseImageDecimation must be between 0 and 1"
    ))]
    pub base_image_decimation: Option<f32>,
}

// ---------------------------------------------------------------------------
// Normalized form
// ---------------------------------------------------------------------------

/// Immutable settings snapshot stored on a dream and sent to the worker.
///
/// Uploaded images are referenced by registry key, never embedded, so the
/// serialized form is safe to persist as `settings_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamSettings {
    pub prompt: String,
    pub num_images: u32,
    pub seed: u32,
    pub sampler: Sampler,
    pub sampler_steps: u32,
    pub sampler_eta: f32,
    pub guidance_scale: f32,
    pub num_images_per_batch: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image_key: Option<ImageKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image_mask_key: Option<ImageKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_image_decimation: Option<f32>,
}

/// Output of [`DreamOptions::normalize`]: the settings snapshot plus the
/// decoded upload bytes the caller must register under the snapshot's keys.
#[derive(Debug, Clone)]
pub struct NormalizedOptions {
    pub settings: DreamSettings,
    pub base_image: Option<Vec<u8>>,
    pub base_image_mask: Option<Vec<u8>>,
}

impl DreamOptions {
    /// Validate and fill defaults, collecting every violation.
    ///
    /// `default_size` is the active model's native resolution, used when
    /// neither explicit dimensions nor a base image are supplied.
    pub fn normalize(
        self,
        dream_id: DreamId,
        default_size: (u32, u32),
    ) -> Result<NormalizedOptions, Vec<String>> {
        let mut errors = field_errors(&self);

        let prompt_len = self.prompt.trim().chars().count();
        if !(1..=MAX_PROMPT_CHARS).contains(&prompt_len) {
            errors.push(format!("prompt must be 1 to {MAX_PROMPT_CHARS} characters"));
        }

        let num_images = self.num_images.unwrap_or(1);
        let per_batch = self
            .num_images_per_batch
            .unwrap_or_else(|| DEFAULT_IMAGES_PER_BATCH.min(num_images));
        if per_batch > num_images {
            errors.push("numImagesPerBatch must not exceed numImages".to_string());
        }

        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value.is_some_and(|v| v % SIZE_STEP != 0) {
                errors.push(format!("{name} must be a multiple of {SIZE_STEP}"));
            }
        }

        let base_size = match &self.base_image {
            Some(bytes) => match imaging::dimensions(bytes) {
                Ok(size) => Some(size),
                Err(e) => {
                    errors.push(format!("base image could not be decoded: {e}"));
                    None
                }
            },
            None => None,
        };

        if self.base_image.is_none() {
            if self.base_image_mask.is_some() {
                errors.push("a base image mask requires a base image".to_string());
            }
            if self.base_image_decimation.is_some() {
                errors.push("baseImageDecimation requires a base image".to_string());
            }
        } else if self.width.is_some() || self.height.is_some() {
            errors.push(
                "width and height are derived from the base image and must not be set"
                    .to_string(),
            );
        }

        if let Some(mask) = &self.base_image_mask {
            match imaging::dimensions(mask) {
                Ok(mask_size) => {
                    if let Some((w, h)) = base_size.filter(|size| *size != mask_size) {
                        errors.push(format!(
                            "base image mask must match the base image dimensions ({w}x{h})"
                        ));
                    }
                }
                Err(e) => errors.push(format!("base image mask could not be decoded: {e}")),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let (width, height) = match base_size {
            Some((w, h)) => (snap_to_grid(w), snap_to_grid(h)),
            None => (
                self.width.unwrap_or(default_size.0),
                self.height.unwrap_or(default_size.1),
            ),
        };

        let has_base = self.base_image.is_some();
        let has_mask = self.base_image_mask.is_some();

        let settings = DreamSettings {
            prompt: self.prompt.trim().to_string(),
            num_images,
            seed: self.seed.unwrap_or_else(rand::random),
            sampler: self.sampler.unwrap_or_default(),
            sampler_steps: self.sampler_steps.unwrap_or(DEFAULT_SAMPLER_STEPS),
            sampler_eta: self.sampler_eta.unwrap_or(0.0),
            guidance_scale: self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE),
            num_images_per_batch: per_batch,
            width,
            height,
            base_image_key: has_base.then(|| ImageKey::base_image(dream_id)),
            base_image_mask_key: has_mask.then(|| ImageKey::base_image_mask(dream_id)),
            base_image_decimation: has_base
                .then(|| self.base_image_decimation.unwrap_or(DEFAULT_BASE_IMAGE_DECIMATION)),
        };

        Ok(NormalizedOptions {
            settings,
            base_image: self.base_image,
            base_image_mask: self.base_image_mask,
        })
    }
}

/// Round down to the latent grid, never below one cell.
fn snap_to_grid(value: u32) -> u32 {
    (value - value % SIZE_STEP).clamp(SIZE_STEP, MAX_SIZE)
}

/// Messages from the derive-based range and length checks, sorted so the
/// output is stable.
fn field_errors(options: &DreamOptions) -> Vec<String> {
    let Err(errors) = options.validate() else {
        return Vec::new();
    };

    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter()
                .map(|e| match &e.message {
                    Some(message) => message.to_string(),
                    None => format!("{field} is invalid"),
                })
                .collect::<Vec<_>>()
        })
        .collect();
    messages.sort();
    messages
}
