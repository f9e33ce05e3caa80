use bytes::Bytes;
use http::Version;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::api::InferenceResults;
use crate::error::{Error, ProviderError, ProviderErrorKind, Result};
use crate::request::Request;

/// A received response, body fully read.
#[derive(Debug, Clone)]
pub struct HttpResult {
    status: StatusCode,
    version: Version,
    body: Bytes,
}

impl HttpResult {
    pub fn new(status: StatusCode, version: Version, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            version,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// e.g. `HTTP/1.1 401 Unauthorized`
    pub fn status_line(&self) -> String {
        format!("{:?} {}", self.version, self.status)
    }
}

pub type ParseFn = fn(&dyn Request, &HttpResult) -> Result<InferenceResults>;

/// Checks the status of a response and decodes successful bodies.
#[derive(Clone, Copy)]
pub struct ResponseHandler {
    request_type: &'static str,
    parse: ParseFn,
}

impl std::fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandler")
            .field("request_type", &self.request_type)
            .finish()
    }
}

impl ResponseHandler {
    pub const fn new(request_type: &'static str, parse: ParseFn) -> Self {
        Self {
            request_type,
            parse,
        }
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    /// Turns a non-success status into a classified [`ProviderError`] whose
    /// message is the status line. The body is not inspected for a message.
    pub fn validate(&self, request: &dyn Request, result: &HttpResult) -> Result<()> {
        let status = result.status();
        if status.is_success() {
            return Ok(());
        }

        let kind = match status.as_u16() {
            413 => ProviderErrorKind::ContentTooLarge,
            400 if mentions_context_length(result.body()) => ProviderErrorKind::ContentTooLarge,
            400 => ProviderErrorKind::InvalidInput,
            401 | 403 => ProviderErrorKind::Authentication,
            429 => ProviderErrorKind::RateLimited,
            503 => ProviderErrorKind::ServiceUnavailable,
            500 | 502 | 504 => ProviderErrorKind::ServerError,
            300..=399 => ProviderErrorKind::Redirection,
            _ => ProviderErrorKind::Unsuccessful,
        };

        Err(Error::Provider(ProviderError {
            kind,
            status,
            entity_id: request.inference_entity_id().to_string(),
            message: result.status_line(),
        }))
    }

    pub fn parse(&self, request: &dyn Request, result: &HttpResult) -> Result<InferenceResults> {
        (self.parse)(request, result)
    }
}

fn mentions_context_length(body: &[u8]) -> bool {
    let body = String::from_utf8_lossy(body).to_lowercase();
    body.contains("maximum context length") || body.contains("input is too long")
}

/// Decodes a JSON body, keeping the raw body on failure for diagnostics.
pub(crate) fn parse_json<T: DeserializeOwned>(
    request_type: &'static str,
    result: &HttpResult,
) -> Result<T> {
    serde_json::from_slice(result.body()).map_err(|err| Error::Parse {
        request_type,
        status: result.status(),
        reason: err.to_string(),
        body: String::from_utf8_lossy(result.body()).into_owned(),
    })
}
