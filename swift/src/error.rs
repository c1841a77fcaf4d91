use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};

/// Details of a non-2xx answer from the object store.
#[derive(Debug)]
pub struct StorageError {
    pub method: Method,
    /// Decoded `container/object` path the request targeted
    pub target: String,
    pub status: StatusCode,
    pub message: String,
    pub headers: HeaderMap,
}

/// Errors surfaced by the Swift session and storage client.
///
/// Callers branch on [`Error::status`] for storage failures: 404 usually means "absent",
/// 504 during a server-side copy means "may still be in progress" and 422 means the uploaded
/// content did not match the announced etag.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("cannot lookup endpoint for service '{service}' in region '{region}'")]
    Endpoint { service: String, region: String },
    #[error("{0}")]
    Config(String),
    #[error(
        "{} {} failed with status {}: {}",
        .0.method,
        .0.target,
        .0.status.as_u16(),
        .0.message.trim()
    )]
    Storage(Box<StorageError>),
    #[error("{method} {target}: {source}")]
    Transport {
        method: Method,
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("i/o error while streaming: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed response: {0}")]
    Decode(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn storage(
        method: Method,
        target: impl Into<String>,
        status: StatusCode,
        message: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Error::Storage(Box::new(StorageError {
            method,
            target: target.into(),
            status,
            message: message.into(),
            headers,
        }))
    }

    /// HTTP status of a storage failure, `None` for every other variant.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Storage(details) => Some(details.status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_gateway_timeout(&self) -> bool {
        self.status() == Some(StatusCode::GATEWAY_TIMEOUT)
    }

    /// Upload rejected because the content does not match its etag.
    pub fn is_integrity_mismatch(&self) -> bool {
        self.status() == Some(StatusCode::UNPROCESSABLE_ENTITY)
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Io(_) => true,
            Error::Storage(details) => {
                details.status == StatusCode::TOO_MANY_REQUESTS
                    || (details.status.is_server_error()
                        && details.status != StatusCode::NOT_IMPLEMENTED)
            }
            Error::Auth(_) | Error::Endpoint { .. } | Error::Config(_) | Error::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(status: u16) -> Error {
        Error::storage(
            Method::PUT,
            "container/object",
            StatusCode::from_u16(status).unwrap(),
            "nope",
            HeaderMap::new(),
        )
    }

    #[test]
    fn status_classification() {
        assert!(storage(404).is_not_found());
        assert!(!storage(404).is_retryable());
        assert!(storage(504).is_gateway_timeout());
        assert!(storage(504).is_retryable());
        assert!(storage(503).is_retryable());
        assert!(storage(429).is_retryable());
        assert!(!storage(501).is_retryable());
        assert!(storage(422).is_integrity_mismatch());
        assert!(!storage(422).is_retryable());
        assert!(!Error::Auth("invalid credentials".into()).is_retryable());
        assert_eq!(Error::Config("x".into()).status(), None);
    }

    #[test]
    fn storage_message_names_target_and_status() {
        let message = storage(404).to_string();
        assert_eq!(message, "PUT container/object failed with status 404: nope");
    }
}
