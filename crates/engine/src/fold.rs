//! Folding worker response bodies into a dream.
//!
//! [`apply`] is the only place dream and image states change after a dream
//! is created. It never leaves the dream half-updated on a violation: each
//! frame is checked in full before anything is written.

use fusion_core::dream::{Dream, DreamState, StopReason};
use fusion_core::protocol::{ImageProgress, ProtocolViolation, ResponseBody, WorkerImageState};
use fusion_core::registry::{ImageKey, ImageRegistry, RegisteredImage};

/// What the fold task should do after a body was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldStep {
    /// Publish a snapshot and wait for the next body.
    Continue,
    /// Every image is in and registered. The dream may finish with `seed`
    /// once it has been persisted.
    Complete { seed: u32 },
    /// The dream must stop.
    Failed { reason: StopReason, message: String },
}

/// Apply one response body to `dream`, registering any image bytes it
/// carries.
pub fn apply(dream: &mut Dream, body: ResponseBody, registry: &ImageRegistry) -> FoldStep {
    let result = match body {
        ResponseBody::Running { image_progress } => {
            apply_running(dream, image_progress, registry).map(|()| FoldStep::Continue)
        }
        ResponseBody::Complete { images, seed } => {
            apply_complete(dream, images, registry).map(|()| FoldStep::Complete { seed })
        }
        ResponseBody::Error { message, crashed } => {
            let reason = if crashed {
                StopReason::WorkerCrashed
            } else {
                StopReason::DreamError
            };
            return FoldStep::Failed { reason, message };
        }
        ResponseBody::Rejected(violation) => Err(violation),
    };

    result.unwrap_or_else(|violation| FoldStep::Failed {
        reason: StopReason::ProtocolViolation,
        message: violation.to_string(),
    })
}

fn apply_running(
    dream: &mut Dream,
    progress: Vec<ImageProgress>,
    registry: &ImageRegistry,
) -> Result<(), ProtocolViolation> {
    if progress.len() > dream.images().len() {
        return Err(ProtocolViolation(format!(
            "running frame reports {} images for a dream of {}",
            progress.len(),
            dream.images().len()
        )));
    }
    let decoded = decode_images(&progress)?;

    dream.mark_running();
    for (index, (entry, image)) in progress.into_iter().zip(decoded).enumerate() {
        update_image(dream, index, &entry, image, registry, false);
    }
    Ok(())
}

fn apply_complete(
    dream: &mut Dream,
    images: Vec<ImageProgress>,
    registry: &ImageRegistry,
) -> Result<(), ProtocolViolation> {
    if images.len() != dream.images().len() {
        return Err(ProtocolViolation(format!(
            "complete frame reports {} images for a dream of {}",
            images.len(),
            dream.images().len()
        )));
    }
    if let Some(index) = images
        .iter()
        .position(|entry| entry.state != WorkerImageState::Complete)
    {
        return Err(ProtocolViolation(format!(
            "complete frame reports image {index} as {:?}",
            images[index].state
        )));
    }
    let decoded = decode_images(&images)?;
    if let Some(index) = decoded
        .iter()
        .zip(dream.images())
        .position(|(bytes, image)| bytes.is_none() && image.image_key.is_none())
    {
        return Err(ProtocolViolation(format!(
            "complete frame has no image bytes for image {index}"
        )));
    }

    dream.mark_running();
    for (index, (entry, image)) in images.into_iter().zip(decoded).enumerate() {
        // The state itself moves to Finished only once the dream is persisted.
        let entry = ImageProgress {
            state: WorkerImageState::Running,
            ..entry
        };
        update_image(dream, index, &entry, image, registry, true);
    }
    Ok(())
}

/// Validate every attached image before any of them is registered.
fn decode_images(
    entries: &[ImageProgress],
) -> Result<Vec<Option<RegisteredImage>>, ProtocolViolation> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            entry
                .image
                .clone()
                .map(RegisteredImage::from_encoded)
                .transpose()
                .map_err(|e| ProtocolViolation(format!("image {index} could not be read: {e}")))
        })
        .collect()
}

fn update_image(
    dream: &mut Dream,
    index: usize,
    entry: &ImageProgress,
    image: Option<RegisteredImage>,
    registry: &ImageRegistry,
    final_frame: bool,
) {
    let dream_id = dream.id();
    let Some(target) = dream.image_mut(index) else {
        return;
    };
    // The final frame's data always wins, even over an image a running
    // frame already reported complete. Its state still only moves forward.
    if target.state.is_terminal() && !final_frame {
        return;
    }

    if let Some(image) = image {
        let key = ImageKey::for_image(dream_id, target.id);
        registry.register(key.clone(), image);
        target.image_key = Some(key);
    }
    if let Some(seed) = entry.seed {
        target.seed = Some(seed);
    }
    if let Some(total) = entry.total_steps {
        target.total_steps = total;
    }
    if let Some(completed) = entry.completed_steps {
        target.finished_steps = completed.min(target.total_steps);
    }

    // Regressions (e.g. a late `pending` for a running image) are ignored.
    target.advance(match entry.state {
        WorkerImageState::Pending => DreamState::Pending,
        WorkerImageState::Running => DreamState::Running,
        WorkerImageState::Complete => DreamState::Finished,
    });
}
