use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;

use crate::error::ApiError;
use crate::state::AppState;

/// Rejects any request whose `Origin` header does not match the configured
/// domain. The only authentication the HTTP surface carries.
pub struct RequireOrigin;

impl FromRequestParts<AppState> for RequireOrigin {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let origin = parts
            .headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        match origin {
            Some(origin) if origin == state.settings.app.domain => Ok(Self),
            _ => Err(ApiError::forbidden("origin not allowed")),
        }
    }
}
