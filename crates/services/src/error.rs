use thiserror::Error;

/// Error kinds recognized at the signaling boundary. Every engine or
/// state-machine failure is folded into one of these before it crosses into
/// the HTTP or WebSocket surface.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    /// Operation is illegal in the current lifecycle state.
    #[error("{0}")]
    InvalidState(String),

    /// The engine cannot satisfy the request (e.g. capability mismatch).
    #[error("{0}")]
    Unsupported(String),

    /// Origin mismatch or missing/wrong throttle secret.
    #[error("{0}")]
    Forbidden(String),

    #[error("{kind} with id \"{id}\" not found")]
    NotFound { kind: &'static str, id: String },

    /// Malformed request payload.
    #[error("{0}")]
    BadRequest(String),

    /// Any other engine failure.
    #[error("{0}")]
    Engine(String),
}

pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    pub fn engine(err: impl std::fmt::Display) -> Self {
        Self::Engine(err.to_string())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Canonical kind name used as the plain-text body prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "InvalidState",
            Self::Unsupported(_) => "Unsupported",
            Self::Forbidden(_) => "Forbidden",
            Self::NotFound { .. } => "NotFound",
            Self::BadRequest(_) => "TypeError",
            Self::Engine(_) => "ServerError",
        }
    }

    /// HTTP status the kind maps to. Doubles as the `errorCode` on WebSocket
    /// request rejections.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidState(_) | Self::Unsupported(_) => 409,
            Self::Forbidden(_) => 403,
            Self::NotFound { .. } => 404,
            Self::BadRequest(_) => 400,
            Self::Engine(_) => 500,
        }
    }
}
