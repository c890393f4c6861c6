use http::StatusCode;
use thiserror::Error;

/// Centralized error type for the cache proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),
    #[error("origin returned HTTP {0}")]
    OriginStatus(u16),
    #[error("timed out contacting origin")]
    Timeout,
    #[error("disk write failed: {0}")]
    DiskWrite(#[source] std::io::Error),
    #[error("failed to bind loopback socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("cache entry not found")]
    NotFound,
    #[error("another writer holds this cache key")]
    AlreadyWriting,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn origin<S: Into<String>>(msg: S) -> Self {
        Self::OriginUnreachable(msg.into())
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::OriginStatus(status.as_u16())
        } else {
            Self::OriginUnreachable(err.to_string())
        }
    }

    /// Whether a fresh attempt against the origin could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::OriginUnreachable(_) => true,
            Self::OriginStatus(status) => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// The status the client sees when this error ends a request.
    ///
    /// Origin statuses pass through verbatim; transport failures map to
    /// gateway-style statuses.
    pub fn client_status(&self) -> StatusCode {
        match self {
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::OriginStatus(status) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
