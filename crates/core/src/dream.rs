//! Dream and dream-image aggregates and their lifecycle state machine.
//!
//! A [`Dream`] is owned by exactly one fold task. Watchers only ever see
//! [`DreamSnapshot`]s: immutable copies taken after each state change.

use std::sync::Arc;

use serde::Serialize;

use crate::options::DreamSettings;
use crate::registry::ImageKey;
use crate::types::{DreamId, DreamImageId, Timestamp};

/// Shared, immutable view of a dream at one point in its lifecycle.
pub type DreamSnapshot = Arc<Dream>;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state shared by dreams and their images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DreamState {
    Pending,
    Running,
    Finished,
    Stopped,
}

impl DreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Re-entering the same non-terminal state is allowed (a no-op); nothing
    /// leaves a terminal state and nothing returns to `Pending`.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Finished | Self::Stopped, _) => false,
            (Self::Pending, _) => true,
            (Self::Running, Self::Pending) => false,
            (Self::Running, _) => true,
        }
    }
}

/// Why a dream ended in [`DreamState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// The worker reported an error for this request.
    DreamError,
    /// The worker process died while the request was in flight.
    WorkerCrashed,
    /// The worker sent a response this side could not accept.
    ProtocolViolation,
    /// The dream completed but could not be committed to storage.
    PersistenceFailed,
    /// The request never reached a worker.
    WorkerUnavailable,
}

// ---------------------------------------------------------------------------
// Dream image
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamImage {
    pub id: DreamImageId,
    pub dream_id: DreamId,
    pub index: u32,
    pub state: DreamState,
    pub seed: Option<u32>,
    pub image_key: Option<ImageKey>,
    pub finished_steps: u32,
    pub total_steps: u32,
}

impl DreamImage {
    fn new(dream_id: DreamId, index: u32, seed: u32, total_steps: u32) -> Self {
        Self {
            id: DreamImageId::new(),
            dream_id,
            index,
            state: DreamState::Pending,
            seed: Some(seed),
            image_key: None,
            finished_steps: 0,
            total_steps,
        }
    }

    /// Move to `next` if that keeps the lifecycle monotonic.
    ///
    /// Returns `false` (leaving the image untouched) for a regression.
    pub fn advance(&mut self, next: DreamState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next == DreamState::Finished {
            self.finished_steps = self.total_steps;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Dream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dream {
    id: DreamId,
    settings: Arc<DreamSettings>,
    state: DreamState,
    images: Vec<DreamImage>,
    stop_reason: Option<StopReason>,
    message: Option<String>,
    seed: Option<u32>,
    /// Bumped once per committed state change; lets watchers drop
    /// snapshots they have already seen.
    version: u64,
    created_at: Timestamp,
}

impl Dream {
    /// Build a pending dream with one image per requested output.
    ///
    /// Image `i` starts with seed `settings.seed + i` until the worker
    /// reports its own.
    pub fn new(id: DreamId, settings: DreamSettings) -> Self {
        let images = (0..settings.num_images)
            .map(|index| {
                DreamImage::new(
                    id,
                    index,
                    settings.seed.wrapping_add(index),
                    settings.sampler_steps,
                )
            })
            .collect();

        Self {
            id,
            settings: Arc::new(settings),
            state: DreamState::Pending,
            images,
            stop_reason: None,
            message: None,
            seed: None,
            version: 0,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn id(&self) -> DreamId {
        self.id
    }

    pub fn settings(&self) -> &DreamSettings {
        &self.settings
    }

    pub fn state(&self) -> DreamState {
        self.state
    }

    pub fn images(&self) -> &[DreamImage] {
        &self.images
    }

    /// Mutable access to one image. The list itself can never be resized.
    pub fn image_mut(&mut self, index: usize) -> Option<&mut DreamImage> {
        self.images.get_mut(index)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn seed(&self) -> Option<u32> {
        self.seed
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn finished_images(&self) -> usize {
        self.images
            .iter()
            .filter(|image| image.state == DreamState::Finished)
            .count()
    }

    pub fn finished_steps(&self) -> u32 {
        self.images.iter().map(|image| image.finished_steps).sum()
    }

    pub fn total_steps(&self) -> u32 {
        self.images.iter().map(|image| image.total_steps).sum()
    }

    pub fn mark_running(&mut self) -> bool {
        self.transition(DreamState::Running)
    }

    /// Record the worker's final seed and finish the dream and every image.
    pub fn finish(&mut self, seed: u32) -> bool {
        if !self.transition(DreamState::Finished) {
            return false;
        }
        self.seed = Some(seed);
        for image in &mut self.images {
            image.advance(DreamState::Finished);
        }
        true
    }

    /// Stop the dream. Images that already finished keep their state.
    pub fn stop(&mut self, reason: StopReason, message: impl Into<String>) -> bool {
        if !self.transition(DreamState::Stopped) {
            return false;
        }
        self.stop_reason = Some(reason);
        self.message = Some(message.into());
        for image in &mut self.images {
            image.advance(DreamState::Stopped);
        }
        true
    }

    /// Current state as an immutable snapshot, without bumping the version.
    fn snapshot(&self) -> DreamSnapshot {
        Arc::new(self.clone())
    }

    /// Bump the version and take a snapshot. Call once per fold step.
    pub fn commit(&mut self) -> DreamSnapshot {
        self.version += 1;
        self.snapshot()
    }

    fn transition(&mut self, next: DreamState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        true
    }
}
