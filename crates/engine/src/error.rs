use fusion_core::error::CoreError;
use fusion_core::types::DreamId;
use fusion_worker::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Dream options (or the settings they depend on) were rejected. Every
    /// problem is listed.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A settings update was rejected. Every problem is listed.
    #[error("Invalid settings: {}", .0.join("; "))]
    InvalidSettings(Vec<String>),

    #[error("Dream not found: {0}")]
    DreamNotFound(DreamId),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}
