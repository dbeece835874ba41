//! Route definitions for dreams.
//!
//! ```text
//! POST   /                start_dream
//! GET    /{id}            get_dream
//! GET    /{id}/watch      watch_dream (WebSocket upgrade)
//! ```

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::dreams;
use crate::state::AppState;
use crate::ws;

/// Dream routes, mounted at `/dreams`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(dreams::start_dream))
        .route("/{id}", get(dreams::get_dream))
        .route("/{id}/watch", get(ws::dream_watch::watch_dream))
}
