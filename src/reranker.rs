//! Document reranking against FireworksAI's `/rerank` endpoint.
//!
//! A [`RerankModel`] scores documents by their relevance to a query. The
//! response keeps the provider's ranking order; each [`RankedDoc`] carries
//! the index of the document in the request so callers can map scores back.
//!
//! # Example
//!
//! ```rust
//! use fireworks_inference::reranker::{RerankModel, RerankServiceSettings, RerankTaskSettings};
//!
//! let model = RerankModel::new(
//!     "my-reranker",
//!     RerankServiceSettings::new("fireworks/qwen3-reranker-8b", None),
//!     RerankTaskSettings { top_n: Some(3), return_documents: None },
//!     None,
//! );
//! assert_eq!(model.model_id(), "fireworks/qwen3-reranker-8b");
//! ```
//!
//! [`RankedDoc`]: crate::api::RankedDoc

use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::Url;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::api::{InferenceResults, QueryAndDocsInputs, RankedDoc, RankedDocsResults};
use crate::error::{Error, Result, ValidationErrors};
use crate::model::{SERVICE_NAME, override_task_settings};
use crate::request::{HttpRequest, RateLimitGroup, Request, json_bearer_headers};
use crate::response::{HttpResult, parse_json};
use crate::settings::{
    ConfigMap, DefaultSecretSettings, MODEL_ID, ParseContext, RateLimitSettings, SERVICE_SETTINGS,
    ServiceSettings, TASK_SETTINGS, TaskSettings, URL, convert_to_uri, extract_optional_bool,
    extract_optional_positive_integer, extract_optional_string, extract_required_string,
    serialize_url,
};

/// Default rerank endpoint.
pub const DEFAULT_URL: &str = "https://api.fireworks.ai/inference/v1/rerank";
/// Key for whether the provider echoes document text back.
pub const RETURN_DOCUMENTS: &str = "return_documents";
/// Key for the number of top documents to return.
pub const TOP_N: &str = "top_n";
pub const DEFAULT_RATE_LIMIT_SETTINGS: RateLimitSettings = RateLimitSettings::new(3000);

pub(crate) const REQUEST_TYPE: &str = "fireworksai rerank";

static DEFAULT_URI: Lazy<Url> =
    Lazy::new(|| Url::parse(DEFAULT_URL).expect("default rerank url is valid"));

/// Service settings for a rerank endpoint.
///
/// Persisted as `{"model_id", "url", "rate_limit"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RerankServiceSettings {
    model_id: String,
    #[serde(rename = "url", serialize_with = "serialize_url")]
    uri: Url,
    rate_limit: RateLimitSettings,
}

impl RerankServiceSettings {
    /// Create settings for `model_id`, using [`DEFAULT_URL`] when `uri` is `None`.
    pub fn new(model_id: impl Into<String>, uri: Option<Url>) -> Self {
        Self {
            model_id: model_id.into(),
            uri: uri.unwrap_or_else(|| DEFAULT_URI.clone()),
            rate_limit: DEFAULT_RATE_LIMIT_SETTINGS,
        }
    }

    /// Parse settings from a configuration map, consuming the keys it reads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] listing every problem found when:
    /// - `model_id` is missing or empty
    /// - `url` is not a valid URL
    /// - `rate_limit` is malformed
    pub fn from_map(map: &mut ConfigMap, context: ParseContext) -> Result<Self> {
        let mut errors = ValidationErrors::new();

        let model_id = extract_required_string(map, MODEL_ID, SERVICE_SETTINGS, &mut errors);
        let url = extract_optional_string(map, URL, SERVICE_SETTINGS, &mut errors);
        let uri = convert_to_uri(url, URL, SERVICE_SETTINGS, &mut errors);
        let rate_limit = RateLimitSettings::of(
            map,
            DEFAULT_RATE_LIMIT_SETTINGS,
            &mut errors,
            SERVICE_NAME,
            context,
        );

        errors.into_result()?;

        Ok(Self {
            model_id: model_id.unwrap_or_default(),
            uri: uri.unwrap_or_else(|| DEFAULT_URI.clone()),
            rate_limit,
        })
    }
}

impl ServiceSettings for RerankServiceSettings {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn uri(&self) -> &Url {
        &self.uri
    }

    fn rate_limit_settings(&self) -> RateLimitSettings {
        self.rate_limit
    }
}

/// Stored rerank defaults, overridable per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerankTaskSettings {
    /// Whether the provider should include document text in results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<bool>,
    /// Maximum number of ranked documents to return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
}

impl RerankTaskSettings {
    pub const EMPTY: RerankTaskSettings = RerankTaskSettings {
        return_documents: None,
        top_n: None,
    };

    /// Apply a new task settings map on top of these settings.
    ///
    /// Fields absent from `new_settings` keep their current value.
    pub fn updated(&self, new_settings: &ConfigMap) -> Result<Self> {
        let mut new_settings = new_settings.clone();
        let update = Self::from_map(&mut new_settings)?;
        Ok(Self::of(self, &update))
    }
}

impl TaskSettings for RerankTaskSettings {
    fn from_map(map: &mut ConfigMap) -> Result<Self> {
        let mut errors = ValidationErrors::new();
        let return_documents = extract_optional_bool(map, RETURN_DOCUMENTS, &mut errors);
        let top_n = extract_optional_positive_integer(map, TOP_N, TASK_SETTINGS, &mut errors);
        errors.into_result()?;
        Ok(Self {
            return_documents,
            top_n,
        })
    }

    fn of(original: &Self, request: &Self) -> Self {
        Self {
            return_documents: request.return_documents.or(original.return_documents),
            top_n: request.top_n.or(original.top_n),
        }
    }

    fn is_empty(&self) -> bool {
        self.return_documents.is_none() && self.top_n.is_none()
    }
}

/// A rerank endpoint on FireworksAI.
#[derive(Debug, Clone)]
pub struct RerankModel {
    inference_entity_id: String,
    service_settings: Arc<RerankServiceSettings>,
    task_settings: RerankTaskSettings,
    secrets: Option<DefaultSecretSettings>,
}

impl RerankModel {
    pub fn new(
        inference_entity_id: impl Into<String>,
        service_settings: RerankServiceSettings,
        task_settings: RerankTaskSettings,
        secrets: Option<DefaultSecretSettings>,
    ) -> Self {
        Self {
            inference_entity_id: inference_entity_id.into(),
            service_settings: Arc::new(service_settings),
            task_settings,
            secrets,
        }
    }

    /// Build a model from its configuration maps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if either settings map is invalid.
    pub fn from_maps(
        inference_entity_id: impl Into<String>,
        service_settings: &mut ConfigMap,
        task_settings: &mut ConfigMap,
        secrets: Option<DefaultSecretSettings>,
        context: ParseContext,
    ) -> Result<Self> {
        let service_settings = RerankServiceSettings::from_map(service_settings, context)?;
        let task_settings = RerankTaskSettings::from_map(task_settings)?;
        Ok(Self::new(
            inference_entity_id,
            service_settings,
            task_settings,
            secrets,
        ))
    }

    /// Model with `overrides` merged over its task settings.
    ///
    /// Returns the same [`Arc`] when `overrides` is empty.
    pub fn of(model: &Arc<Self>, overrides: &ConfigMap) -> Result<Arc<Self>> {
        match override_task_settings(&model.task_settings, overrides)? {
            None => Ok(Arc::clone(model)),
            Some(task_settings) => Ok(Arc::new(Self {
                task_settings,
                ..(**model).clone()
            })),
        }
    }

    pub fn inference_entity_id(&self) -> &str {
        &self.inference_entity_id
    }

    pub fn service_settings(&self) -> &RerankServiceSettings {
        &self.service_settings
    }

    pub fn task_settings(&self) -> &RerankTaskSettings {
        &self.task_settings
    }

    pub fn api_key(&self) -> Option<&SecretString> {
        self.secrets.as_ref().map(DefaultSecretSettings::api_key)
    }

    pub fn model_id(&self) -> &str {
        self.service_settings.model_id()
    }

    pub fn uri(&self) -> &Url {
        self.service_settings.uri()
    }
}

#[derive(Debug, Serialize)]
struct RerankRequestEntity<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    top_n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_documents: Option<bool>,
}

/// A single rerank call.
///
/// Call-time `top_n` and `return_documents` take precedence over the model's
/// task settings. Rerank inputs are never truncated.
#[derive(Debug, Clone)]
pub struct RerankRequest {
    query: String,
    documents: Vec<String>,
    top_n: Option<u32>,
    return_documents: Option<bool>,
    model: Arc<RerankModel>,
}

impl RerankRequest {
    pub fn new(inputs: &QueryAndDocsInputs, model: Arc<RerankModel>) -> Self {
        Self {
            query: inputs.query.clone(),
            documents: inputs.chunks.clone(),
            top_n: inputs.top_n,
            return_documents: inputs.return_documents,
            model,
        }
    }

    pub fn top_n(&self) -> Option<u32> {
        self.top_n.or(self.model.task_settings.top_n)
    }

    pub fn return_documents(&self) -> Option<bool> {
        self.return_documents
            .or(self.model.task_settings.return_documents)
    }
}

impl Request for RerankRequest {
    fn create_http_request(&self) -> Result<HttpRequest> {
        let entity = RerankRequestEntity {
            model: self.model.model_id(),
            query: &self.query,
            documents: &self.documents,
            top_n: self.top_n(),
            return_documents: self.return_documents(),
        };
        let body = serde_json::to_vec(&entity).map_err(Error::JsonEncode)?;

        Ok(HttpRequest {
            url: self.model.uri().clone(),
            headers: json_bearer_headers(self.model.api_key())?,
            body,
            inference_entity_id: self.model.inference_entity_id.clone(),
        })
    }

    fn inference_entity_id(&self) -> &str {
        self.model.inference_entity_id()
    }

    fn uri(&self) -> &Url {
        self.model.uri()
    }

    fn rate_limit_group(&self) -> RateLimitGroup {
        RateLimitGroup::new(
            self.model.uri(),
            self.model.model_id(),
            self.model.api_key(),
            self.model.service_settings.rate_limit_settings(),
        )
    }

    fn truncate(&self) -> Box<dyn Request> {
        Box::new(self.clone())
    }

    fn truncation_info(&self) -> Option<Vec<bool>> {
        None
    }
}

/// Internal representation of the rerank API response.
#[derive(Debug, Deserialize)]
struct RerankApiResponse {
    /// Ranked entries; some deployments name this field `results`
    #[serde(alias = "results")]
    data: Vec<RerankApiEntry>,
}

#[derive(Debug, Deserialize)]
struct RerankApiEntry {
    index: usize,
    relevance_score: f32,
    #[serde(default)]
    document: Option<RerankApiDocument>,
}

/// Document text, either inline or wrapped in an object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RerankApiDocument {
    Text(String),
    Object { text: String },
}

impl RerankApiDocument {
    fn into_text(self) -> String {
        match self {
            RerankApiDocument::Text(text) | RerankApiDocument::Object { text } => text,
        }
    }
}

/// Decode a rerank response body into [`RankedDocsResults`].
///
/// # Errors
///
/// Returns [`Error::Parse`] if the body does not match the expected shape.
pub fn parse_rerank_response(
    _request: &dyn Request,
    result: &HttpResult,
) -> Result<InferenceResults> {
    let response: RerankApiResponse = parse_json(REQUEST_TYPE, result)?;
    let docs = response
        .data
        .into_iter()
        .map(|entry| RankedDoc {
            index: entry.index,
            relevance_score: entry.relevance_score,
            text: entry.document.map(RerankApiDocument::into_text),
        })
        .collect();
    Ok(InferenceResults::RankedDocs(RankedDocsResults { docs }))
}
