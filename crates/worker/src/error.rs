#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode worker settings: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("worker request queue is closed")]
    QueueClosed,

    #[error("worker supervisor is shutting down")]
    ShuttingDown,
}
