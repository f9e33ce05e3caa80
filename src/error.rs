use std::fmt;

use reqwest::StatusCode;

use crate::model::TaskType;

/// Accumulates settings validation failures so they can be reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Returns `Err(Error::Validation)` when at least one failure was recorded.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation Failed: ")?;
        for (i, error) in self.errors.iter().enumerate() {
            write!(f, "{}: {};", i + 1, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Classification of a non-success provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The input exceeded the provider's size limit; retried after truncation.
    ContentTooLarge,
    RateLimited,
    ServerError,
    ServiceUnavailable,
    Authentication,
    InvalidInput,
    Redirection,
    Unsuccessful,
}

impl ProviderErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::ServiceUnavailable
        )
    }

    fn describe(self) -> &'static str {
        match self {
            ProviderErrorKind::ContentTooLarge => "Received a content too large status code",
            ProviderErrorKind::RateLimited => "Received a rate limit status code",
            ProviderErrorKind::ServerError => "Received a server error status code",
            ProviderErrorKind::ServiceUnavailable => "Received a server busy error status code",
            ProviderErrorKind::Authentication => "Received an authentication error status code",
            ProviderErrorKind::InvalidInput => "Received an input validation error response",
            ProviderErrorKind::Redirection => "Unhandled redirection",
            ProviderErrorKind::Unsuccessful => "Received an unsuccessful status code",
        }
    }
}

/// A non-success HTTP status returned by the provider. `message` is the
/// response status line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{} for request from inference entity id [{entity_id}] status [{}]. Error message: [{message}]",
    .kind.describe(),
    .status.as_u16()
)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: StatusCode,
    pub entity_id: String,
    pub message: String,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("{message}")]
    UnsupportedOperation { message: String },

    #[error("The [{service}] service does not support task type [{task_type}]")]
    InvalidTaskType {
        service: &'static str,
        task_type: TaskType,
    },

    #[error(
        "The internal model was invalid, please delete the service [{service}] with id [{entity_id}] and add it again."
    )]
    InvalidModel { entity_id: String, service: String },

    #[error("{request_type} requests require {expected} inputs")]
    InputsMismatch {
        request_type: &'static str,
        expected: &'static str,
    },

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("http client build failed: {0}")]
    HttpClientBuild(#[source] reqwest::Error),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[source] http::header::InvalidHeaderValue),

    #[error("request json encode failed: {0}")]
    JsonEncode(#[source] serde_json::Error),

    #[error("failed to parse {request_type} response with status [{status}]: {reason}")]
    Parse {
        request_type: &'static str,
        status: StatusCode,
        reason: String,
        body: String,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("expected {expected} results but the provider returned a different result type")]
    UnexpectedResults { expected: &'static str },

    #[error("embedding batch returned {embeddings} embeddings for {inputs} inputs")]
    EmbeddingCountMismatch { embeddings: usize, inputs: usize },

    #[error("chunked inference listener dropped before completion")]
    ListenerDropped,

    #[error("sender semaphore closed")]
    SemaphoreClosed,
}

impl Error {
    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            message: message.into(),
        }
    }

    /// REST status this failure maps to when surfaced to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_)
            | Error::UnsupportedOperation { .. }
            | Error::InvalidTaskType { .. }
            | Error::InputsMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::Provider(err) => err.status,
            Error::Transport(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Error::Transport(err) => err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_report_every_failure() {
        let mut errors = ValidationErrors::new();
        errors.add("[service_settings] does not contain the required setting [model_id]");
        errors.add("[task_settings] Invalid value [-1]. [dimensions] must be a positive integer");

        let err = errors.into_result().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("1: [service_settings]"));
        assert!(message.contains("2: [task_settings]"));
        assert!(err.is_client_error());
    }

    #[test]
    fn empty_validation_errors_are_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }

    #[test]
    fn provider_error_keeps_status_and_message() {
        let err = Error::from(ProviderError {
            kind: ProviderErrorKind::Authentication,
            status: StatusCode::UNAUTHORIZED,
            entity_id: "my-id".to_string(),
            message: "HTTP/1.1 401 Unauthorized".to_string(),
        });

        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.to_string(),
            "Received an authentication error status code for request from inference entity id [my-id] status [401]. Error message: [HTTP/1.1 401 Unauthorized]"
        );
    }

    #[test]
    fn unsupported_operations_are_client_errors() {
        let err = Error::unsupported("Chunked inference is not supported for rerank task");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn retryable_kinds() {
        assert!(ProviderErrorKind::RateLimited.is_retryable());
        assert!(ProviderErrorKind::ServiceUnavailable.is_retryable());
        assert!(!ProviderErrorKind::ContentTooLarge.is_retryable());
        assert!(!ProviderErrorKind::Authentication.is_retryable());
    }
}
