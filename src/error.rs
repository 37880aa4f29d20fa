use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum PipelineError {
    /// Submission body is neither a JSON object nor an array of objects.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Batch size {count} exceeds maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    /// Buffer ran out of room mid-submission. Events accepted before the
    /// failure stay enqueued.
    #[error("Event queue full, accepted {accepted}/{total} events")]
    QueueFull { accepted: usize, total: usize },

    #[error("Lookup failure: {0}")]
    LookupFailure(#[from] LookupError),

    #[error("Record format error: {0}")]
    RecordFormat(String),

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Sink error: {0}")]
    SinkError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Failure modes of one call to an external lookup service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("lookup timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("empty body")]
    EmptyBody,

    #[error("invalid lookup key: {0}")]
    InvalidKey(String),
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        // Ingestion rejections carry plain-text bodies; everything else is opaque.
        let (status, body) = match &self {
            PipelineError::MalformedInput(_) => {
                (StatusCode::BAD_REQUEST, "Invalid JSON".to_string())
            }
            PipelineError::BatchTooLarge { max, .. } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Batch size exceeds maximum of {}", max),
            ),
            PipelineError::QueueFull { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Event queue full, try again later".to_string(),
            ),
            PipelineError::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service shutting down".to_string(),
            ),
            PipelineError::RecordFormat(_) | PipelineError::SerializationError(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            PipelineError::LookupFailure(_) | PipelineError::HttpError(_) => {
                (StatusCode::BAD_GATEWAY, "Upstream lookup failed".to_string())
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let mut resp = (status, body).into_response();
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp
    }
}

impl PipelineError {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        PipelineError::MalformedInput(msg.into())
    }

    pub fn record_format<S: Into<String>>(msg: S) -> Self {
        PipelineError::RecordFormat(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::ConfigError(msg.into())
    }

    pub fn sink<S: Into<String>>(msg: S) -> Self {
        PipelineError::SinkError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        PipelineError::InternalError(msg.into())
    }

    /// Short machine-readable label, used for metrics and metadata markers.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedInput(_) => "malformed_input",
            PipelineError::BatchTooLarge { .. } => "batch_too_large",
            PipelineError::QueueFull { .. } => "queue_full",
            PipelineError::LookupFailure(_) => "lookup_failure",
            PipelineError::RecordFormat(_) => "record_format",
            PipelineError::ShuttingDown => "shutting_down",
            PipelineError::ConfigError(_) => "config",
            PipelineError::SerializationError(_) => "serialization",
            PipelineError::IoError(_) => "io",
            PipelineError::HttpError(_) => "http",
            PipelineError::SinkError(_) => "sink",
            PipelineError::InternalError(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingestion_errors_map_to_documented_status_codes() {
        let cases = [
            (PipelineError::malformed("bad"), StatusCode::BAD_REQUEST),
            (
                PipelineError::BatchTooLarge { count: 5, max: 2 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                PipelineError::QueueFull { accepted: 1, total: 3 },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (PipelineError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn lookup_error_converts_into_lookup_failure() {
        let err: PipelineError = LookupError::EmptyBody.into();
        assert!(matches!(err, PipelineError::LookupFailure(LookupError::EmptyBody)));
        assert_eq!(err.to_string(), "Lookup failure: empty body");
    }

    #[test]
    fn batch_too_large_message_names_the_limit() {
        let err = PipelineError::BatchTooLarge { count: 101, max: 100 };
        assert_eq!(err.to_string(), "Batch size 101 exceeds maximum of 100");
        assert_eq!(err.kind(), "batch_too_large");
    }
}
