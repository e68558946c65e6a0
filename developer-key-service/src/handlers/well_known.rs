use crate::AppState;
use service_core::axum::{extract::State, http::header, response::IntoResponse, Json};

/// Public keys third parties use to verify externally audienced tokens.
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        Json(state.tokens.jwks()),
    )
}
