//! Error taxonomy shared by the generation and playback coordinators.
//!
//! Collaborators report failures as `anyhow::Error`; the coordinators map
//! them to a [`ContentError`] exactly once, at the stage boundary, through
//! [`ContentError::classify`].

use crate::core::session::Step;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Kind of a remote failure, independent of the transport that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NetworkUnavailable,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimitExceeded,
    ValidationError(Vec<String>),
    ServerError,
    DecodingError,
    Unknown,
}

impl ErrorKind {
    pub fn default_message(&self) -> String {
        match self {
            ErrorKind::NetworkUnavailable => "No network connection".to_string(),
            ErrorKind::Unauthorized => "Please sign in again".to_string(),
            ErrorKind::Forbidden => "You do not have access to this story".to_string(),
            ErrorKind::NotFound => "The story could not be found".to_string(),
            ErrorKind::RateLimitExceeded => "Too many requests, try again later".to_string(),
            ErrorKind::ValidationError(fields) if fields.is_empty() => {
                "The request was rejected".to_string()
            }
            ErrorKind::ValidationError(fields) => {
                format!("Invalid fields: {}", fields.join(", "))
            }
            ErrorKind::ServerError => "The server had a problem".to_string(),
            ErrorKind::DecodingError => "Unexpected response from the server".to_string(),
            ErrorKind::Unknown => "Something went wrong".to_string(),
        }
    }
}

/// A remote failure mapped into the taxonomy, with a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ContentError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Deserialize)]
struct ValidationBody {
    #[serde(default)]
    errors: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ContentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        let message = kind.default_message();
        Self { kind, message }
    }

    pub fn network_unavailable() -> Self {
        Self::from_kind(ErrorKind::NetworkUnavailable)
    }

    /// Local state that should never exist, e.g. a story without a backend id
    /// at a point where one is required.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let kind = match status.as_u16() {
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            400 | 422 => ErrorKind::ValidationError(validation_fields(body)),
            429 => ErrorKind::RateLimitExceeded,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        };
        let message = serde_json::from_str::<ValidationBody>(body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| kind.default_message());
        Self { kind, message }
    }

    /// Maps any collaborator failure into exactly one taxonomy kind.
    pub fn classify(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(content) = cause.downcast_ref::<ContentError>() {
                return content.clone();
            }
            if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
                return Self::from_reqwest(http);
            }
            if cause.downcast_ref::<serde_json::Error>().is_some() {
                return Self::from_kind(ErrorKind::DecodingError);
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::TimedOut
                ) {
                    return Self::new(ErrorKind::NetworkUnavailable, io.to_string());
                }
            }
        }
        Self::new(ErrorKind::Unknown, format!("{:#}", err))
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            return Self::new(ErrorKind::NetworkUnavailable, err.to_string());
        }
        if err.is_decode() {
            return Self::new(ErrorKind::DecodingError, err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status, "");
        }
        Self::new(ErrorKind::Unknown, err.to_string())
    }
}

fn validation_fields(body: &str) -> Vec<String> {
    match serde_json::from_str::<ValidationBody>(body) {
        Ok(parsed) if !parsed.fields.is_empty() => parsed.fields,
        Ok(parsed) => parsed.errors.into_keys().collect(),
        Err(_) => Vec::new(),
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("A generation session is already running")]
    SessionAlreadyActive,

    #[error("No generation session to operate on")]
    NoSession,

    #[error("The {0} stage cannot be retried, start a new session instead")]
    StageNotRetryable(Step),

    #[error("The {0} stage cannot be skipped")]
    StageNotSkippable(Step),

    #[error("The session did not fail at the {requested} stage (state: {actual})")]
    StageMismatch { requested: Step, actual: String },

    #[error("No illustration with display order {0}")]
    IllustrationNotFound(u32),

    #[error(transparent)]
    Content(#[from] ContentError),
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("No story is loaded")]
    NothingLoaded,

    #[error("Cannot start an empty queue")]
    EmptyQueue,

    #[error("Queue index {index} out of range for {len} stories")]
    QueueIndexOutOfRange { index: usize, len: usize },

    #[error("Illustration index {index} out of range for {len} illustrations")]
    IllustrationOutOfRange { index: usize, len: usize },

    #[error("Illustration is not part of the current story")]
    IllustrationNotFound,

    #[error("Audio generation failed: {0}")]
    AudioGeneration(ContentError),

    #[error("Playback engine error: {0:#}")]
    Engine(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (401, ErrorKind::Unauthorized),
            (403, ErrorKind::Forbidden),
            (404, ErrorKind::NotFound),
            (429, ErrorKind::RateLimitExceeded),
            (500, ErrorKind::ServerError),
            (503, ErrorKind::ServerError),
            (418, ErrorKind::Unknown),
        ];
        for (code, kind) in cases {
            let status = StatusCode::from_u16(code).unwrap();
            assert_eq!(ContentError::from_status(status, "").kind, kind, "status {}", code);
        }
    }

    #[test]
    fn test_validation_fields_from_error_map() {
        let body = r#"{"message": "Hero name too long", "errors": {"hero_name": ["too long"], "event": ["missing"]}}"#;
        let err = ContentError::from_status(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert_eq!(
            err.kind,
            ErrorKind::ValidationError(vec!["event".to_string(), "hero_name".to_string()])
        );
        assert_eq!(err.message, "Hero name too long");
    }

    #[test]
    fn test_validation_fields_from_list() {
        let body = r#"{"fields": ["language"]}"#;
        let err = ContentError::from_status(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.kind, ErrorKind::ValidationError(vec!["language".to_string()]));
        assert_eq!(err.message, "Invalid fields: language");
    }

    #[test]
    fn test_classify_keeps_content_error_through_context() {
        let source = ContentError::from_kind(ErrorKind::RateLimitExceeded);
        let err = anyhow::Error::new(source.clone()).context("generating audio");
        assert_eq!(ContentError::classify(&err), source);
    }

    #[test]
    fn test_classify_json_error_as_decoding() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err = anyhow::Error::new(json_err).context("Failed to parse backend response");
        let mapped = ContentError::classify(&err);
        assert_eq!(mapped.kind, ErrorKind::DecodingError);
        assert_eq!(mapped.message, ErrorKind::DecodingError.default_message());
    }

    #[test]
    fn test_classify_io_connection_errors_as_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = anyhow::Error::new(io);
        assert_eq!(ContentError::classify(&err).kind, ErrorKind::NetworkUnavailable);
    }

    #[test]
    fn test_classify_unknown() {
        let err = anyhow::anyhow!("boom");
        let mapped = ContentError::classify(&err);
        assert_eq!(mapped.kind, ErrorKind::Unknown);
        assert_eq!(mapped.message, "boom");
    }
}
