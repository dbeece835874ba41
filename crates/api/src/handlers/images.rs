use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::Uri;
use axum::response::IntoResponse;

use fusion_core::imaging;

use crate::error::AppResult;
use crate::state::AppState;

/// GET /images/{*path} -- bytes of a registered image.
///
/// Keys are never reused, so responses can be cached indefinitely.
pub async fn get_image(State(state): State<AppState>, uri: Uri) -> AppResult<impl IntoResponse> {
    let key = state.manager.key_from_path(uri.path())?;
    let image = state.manager.image(&key)?;

    Ok((
        [
            (CONTENT_TYPE, imaging::mime_type(&image.bytes)),
            (CACHE_CONTROL, "public, max-age=31536000, immutable"),
        ],
        image.bytes.clone(),
    ))
}
