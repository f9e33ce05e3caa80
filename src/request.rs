use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result, ValidationErrors};
use crate::settings::{API_KEY, RateLimitSettings, SECRET_SETTINGS};

/// A fully built outbound call.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub inference_entity_id: String,
}

/// Requests sharing a key draw from the same rate limit budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitGroup {
    pub key: u64,
    pub settings: RateLimitSettings,
}

impl RateLimitGroup {
    pub fn new(
        uri: &Url,
        model_id: &str,
        api_key: Option<&SecretString>,
        settings: RateLimitSettings,
    ) -> Self {
        let mut hasher = DefaultHasher::new();
        uri.as_str().hash(&mut hasher);
        model_id.hash(&mut hasher);
        api_key.map(|key| key.expose_secret()).hash(&mut hasher);
        Self {
            key: hasher.finish(),
            settings,
        }
    }
}

/// A provider request that the sender can build, send and, when the provider
/// reports the input as too large, truncate and resend.
pub trait Request: Send + Sync + fmt::Debug {
    fn create_http_request(&self) -> Result<HttpRequest>;

    fn inference_entity_id(&self) -> &str;

    fn uri(&self) -> &Url;

    fn rate_limit_group(&self) -> RateLimitGroup;

    /// Returns a new, shorter request. `self` is left untouched.
    fn truncate(&self) -> Box<dyn Request>;

    /// Per-input truncation flags, copied; `None` for requests that never
    /// truncate.
    fn truncation_info(&self) -> Option<Vec<bool>>;
}

/// Bearer auth plus JSON content type.
pub(crate) fn json_bearer_headers(api_key: Option<&SecretString>) -> Result<HeaderMap> {
    let Some(api_key) = api_key else {
        let mut errors = ValidationErrors::new();
        errors.add(format!(
            "[{SECRET_SETTINGS}] does not contain the required setting [{API_KEY}]"
        ));
        return Err(Error::Validation(errors));
    };

    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
        .map_err(Error::InvalidHeaderValue)?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}
