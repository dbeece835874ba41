pub mod dreams;
pub mod health;
pub mod images;
pub mod settings;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /dreams                      start a dream (POST)
/// /dreams/{id}                 latest snapshot (GET)
/// /dreams/{id}/watch           snapshot stream (WebSocket)
///
/// /settings                    get, replace (PUT)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/dreams", dreams::router())
        .nest("/settings", settings::router())
}
