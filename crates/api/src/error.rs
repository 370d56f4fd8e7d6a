use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use confab_services::MediaError;

/// HTTP-facing wrapper around the service error kinds. Bodies are plain text
/// prefixed with the kind name so automation callers can match on them.
#[derive(Debug)]
pub struct ApiError(pub MediaError);

impl From<MediaError> for ApiError {
    fn from(err: MediaError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(MediaError::BadRequest(message.into()))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self(MediaError::Forbidden(message.into()))
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self(MediaError::not_found(kind, id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = format!("{}: {}", self.0.kind(), self.0);
        (status, body).into_response()
    }
}
