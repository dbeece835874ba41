use std::sync::Arc;

use fusion_engine::DreamManager;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: fusion_db::DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Owns every dream, the settings, and the image registry.
    pub manager: Arc<DreamManager>,
}
