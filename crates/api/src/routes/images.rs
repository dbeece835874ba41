use axum::routing::get;
use axum::Router;

use crate::handlers::images;
use crate::state::AppState;

/// Registered image bytes, mounted at root level so the paths produced by
/// `DreamManager::uri_for` resolve as-is.
pub fn router() -> Router<AppState> {
    Router::new().route("/images/{*path}", get(images::get_image))
}
