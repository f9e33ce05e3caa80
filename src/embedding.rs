use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::Url;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::api::{InferenceResults, TextEmbeddingFloatResults};
use crate::chunking::ChunkingSettings;
use crate::error::{Result, ValidationErrors};
use crate::model::{SERVICE_NAME, override_task_settings};
use crate::request::{HttpRequest, RateLimitGroup, Request, json_bearer_headers};
use crate::response::{HttpResult, parse_json};
use crate::settings::{
    ConfigMap, DIMENSIONS, DefaultSecretSettings, MAX_INPUT_TOKENS, MODEL_ID, ParseContext,
    RateLimitSettings, SERVICE_SETTINGS, ServiceSettings, SimilarityMeasure, TASK_SETTINGS,
    TaskSettings, URL, convert_to_uri, extract_optional_bool, extract_optional_positive_integer,
    extract_optional_string, extract_required_string, extract_similarity, serialize_url,
};
use crate::truncation::{TruncationResult, Truncator};

pub const DEFAULT_URL: &str = "https://api.fireworks.ai/inference/v1/embeddings";
pub const DIMENSIONS_SET_BY_USER: &str = "dimensions_set_by_user";
pub const DEFAULT_RATE_LIMIT_SETTINGS: RateLimitSettings = RateLimitSettings::new(3000);

pub(crate) const REQUEST_TYPE: &str = "fireworksai embeddings";

static DEFAULT_URI: Lazy<Url> =
    Lazy::new(|| Url::parse(DEFAULT_URL).expect("default embeddings url is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingsServiceSettings {
    model_id: String,
    #[serde(rename = "url", serialize_with = "serialize_url")]
    uri: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<SimilarityMeasure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_input_tokens: Option<u32>,
    dimensions_set_by_user: bool,
    rate_limit: RateLimitSettings,
}

impl EmbeddingsServiceSettings {
    pub fn new(model_id: impl Into<String>, uri: Option<Url>) -> Self {
        Self {
            model_id: model_id.into(),
            uri: uri.unwrap_or_else(|| DEFAULT_URI.clone()),
            similarity: None,
            dimensions: None,
            max_input_tokens: None,
            dimensions_set_by_user: false,
            rate_limit: DEFAULT_RATE_LIMIT_SETTINGS,
        }
    }

    pub fn from_map(map: &mut ConfigMap, context: ParseContext) -> Result<Self> {
        let mut errors = ValidationErrors::new();

        let model_id = extract_required_string(map, MODEL_ID, SERVICE_SETTINGS, &mut errors);
        let url = extract_optional_string(map, URL, SERVICE_SETTINGS, &mut errors);
        let uri = convert_to_uri(url, URL, SERVICE_SETTINGS, &mut errors);
        let similarity = extract_similarity(map, SERVICE_SETTINGS, &mut errors);
        let dimensions =
            extract_optional_positive_integer(map, DIMENSIONS, SERVICE_SETTINGS, &mut errors);
        let max_input_tokens =
            extract_optional_positive_integer(map, MAX_INPUT_TOKENS, SERVICE_SETTINGS, &mut errors);
        let rate_limit = RateLimitSettings::of(
            map,
            DEFAULT_RATE_LIMIT_SETTINGS,
            &mut errors,
            SERVICE_NAME,
            context,
        );

        let dimensions_set_by_user = match context {
            // Left in the map on requests, so it surfaces as an unknown setting.
            ParseContext::Request => dimensions.is_some(),
            ParseContext::Persistent => {
                extract_optional_bool(map, DIMENSIONS_SET_BY_USER, &mut errors).unwrap_or(false)
            }
        };

        errors.into_result()?;

        Ok(Self {
            model_id: model_id.unwrap_or_default(),
            uri: uri.unwrap_or_else(|| DEFAULT_URI.clone()),
            similarity,
            dimensions,
            max_input_tokens,
            dimensions_set_by_user,
            rate_limit,
        })
    }

    pub fn similarity(&self) -> Option<SimilarityMeasure> {
        self.similarity
    }

    pub fn dimensions(&self) -> Option<u32> {
        self.dimensions
    }

    pub fn max_input_tokens(&self) -> Option<u32> {
        self.max_input_tokens
    }

    pub fn dimensions_set_by_user(&self) -> bool {
        self.dimensions_set_by_user
    }

    /// Copy with the embedding size reported by the provider; similarity
    /// falls back to cosine when the user did not choose one.
    pub fn with_embedding_details(&self, dimensions: u32) -> Self {
        Self {
            dimensions: Some(dimensions),
            similarity: Some(self.similarity.unwrap_or(SimilarityMeasure::Cosine)),
            ..self.clone()
        }
    }
}

impl ServiceSettings for EmbeddingsServiceSettings {
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

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingsTaskSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
}

impl EmbeddingsTaskSettings {
    pub const EMPTY: EmbeddingsTaskSettings = EmbeddingsTaskSettings { dimensions: None };
}

impl TaskSettings for EmbeddingsTaskSettings {
    fn from_map(map: &mut ConfigMap) -> Result<Self> {
        let mut errors = ValidationErrors::new();
        let dimensions =
            extract_optional_positive_integer(map, DIMENSIONS, TASK_SETTINGS, &mut errors);
        errors.into_result()?;
        Ok(Self { dimensions })
    }

    fn of(original: &Self, request: &Self) -> Self {
        Self {
            dimensions: request.dimensions.or(original.dimensions),
        }
    }

    fn is_empty(&self) -> bool {
        self.dimensions.is_none()
    }
}

/// A text embedding endpoint on FireworksAI.
#[derive(Debug, Clone)]
pub struct EmbeddingsModel {
    inference_entity_id: String,
    service_settings: Arc<EmbeddingsServiceSettings>,
    task_settings: EmbeddingsTaskSettings,
    chunking_settings: Option<ChunkingSettings>,
    secrets: Option<DefaultSecretSettings>,
}

impl EmbeddingsModel {
    pub fn new(
        inference_entity_id: impl Into<String>,
        service_settings: EmbeddingsServiceSettings,
        task_settings: EmbeddingsTaskSettings,
        chunking_settings: Option<ChunkingSettings>,
        secrets: Option<DefaultSecretSettings>,
    ) -> Self {
        Self {
            inference_entity_id: inference_entity_id.into(),
            service_settings: Arc::new(service_settings),
            task_settings,
            chunking_settings,
            secrets,
        }
    }

    pub fn from_maps(
        inference_entity_id: impl Into<String>,
        service_settings: &mut ConfigMap,
        task_settings: &mut ConfigMap,
        chunking_settings: Option<ChunkingSettings>,
        secrets: Option<DefaultSecretSettings>,
        context: ParseContext,
    ) -> Result<Self> {
        let service_settings = EmbeddingsServiceSettings::from_map(service_settings, context)?;
        let task_settings = EmbeddingsTaskSettings::from_map(task_settings)?;
        Ok(Self::new(
            inference_entity_id,
            service_settings,
            task_settings,
            chunking_settings,
            secrets,
        ))
    }

    /// Applies request-time task settings. An empty override map hands back
    /// the same descriptor.
    pub fn of(model: &Arc<Self>, overrides: &ConfigMap) -> Result<Arc<Self>> {
        match override_task_settings(&model.task_settings, overrides)? {
            None => Ok(Arc::clone(model)),
            Some(task_settings) => Ok(Arc::new(Self {
                task_settings,
                ..(**model).clone()
            })),
        }
    }

    pub fn with_service_settings(&self, service_settings: EmbeddingsServiceSettings) -> Self {
        Self {
            service_settings: Arc::new(service_settings),
            ..self.clone()
        }
    }

    pub fn inference_entity_id(&self) -> &str {
        &self.inference_entity_id
    }

    pub fn service_settings(&self) -> &EmbeddingsServiceSettings {
        &self.service_settings
    }

    pub fn task_settings(&self) -> &EmbeddingsTaskSettings {
        &self.task_settings
    }

    pub fn chunking_settings(&self) -> Option<&ChunkingSettings> {
        self.chunking_settings.as_ref()
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

    pub fn rate_limit_group(&self) -> RateLimitGroup {
        RateLimitGroup::new(
            self.uri(),
            self.model_id(),
            self.api_key(),
            self.service_settings.rate_limit_settings(),
        )
    }
}

#[derive(Serialize)]
struct EmbeddingsRequestEntity<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingsRequest {
    truncator: Truncator,
    truncation_result: TruncationResult,
    model: Arc<EmbeddingsModel>,
}

impl EmbeddingsRequest {
    pub fn new(
        truncator: Truncator,
        truncation_result: TruncationResult,
        model: Arc<EmbeddingsModel>,
    ) -> Self {
        Self {
            truncator,
            truncation_result,
            model,
        }
    }

    pub fn input(&self) -> &[String] {
        self.truncation_result.input()
    }

    /// Task settings win over the dimensions stored on the service.
    pub fn dimensions(&self) -> Option<u32> {
        self.model
            .task_settings
            .dimensions
            .or(self.model.service_settings.dimensions)
    }
}

impl Request for EmbeddingsRequest {
    fn create_http_request(&self) -> Result<HttpRequest> {
        let entity = EmbeddingsRequestEntity {
            model: self.model.model_id(),
            input: self.truncation_result.input(),
            dimensions: self.dimensions(),
        };
        let body = serde_json::to_vec(&entity).map_err(crate::Error::JsonEncode)?;

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
        self.model.rate_limit_group()
    }

    fn truncate(&self) -> Box<dyn Request> {
        Box::new(Self {
            truncator: self.truncator,
            truncation_result: self.truncator.truncate_further(&self.truncation_result),
            model: Arc::clone(&self.model),
        })
    }

    fn truncation_info(&self) -> Option<Vec<bool>> {
        Some(self.truncation_result.truncated().to_vec())
    }
}

#[derive(Deserialize)]
struct EmbeddingObject {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingsApiResponse {
    data: Vec<EmbeddingObject>,
}

/// Embeddings come back in `data` array order; the `index` field is not
/// consulted.
pub fn parse_embeddings_response(
    _request: &dyn Request,
    result: &HttpResult,
) -> Result<InferenceResults> {
    let response: EmbeddingsApiResponse = parse_json(REQUEST_TYPE, result)?;
    Ok(InferenceResults::TextEmbedding(TextEmbeddingFloatResults {
        embeddings: response.data.into_iter().map(|item| item.embedding).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Version;
    use reqwest::StatusCode;
    use serde_json::{Value, json};

    fn map(value: Value) -> ConfigMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn model(service: Value, task: Value) -> EmbeddingsModel {
        EmbeddingsModel::from_maps(
            "my-embeddings",
            &mut map(service),
            &mut map(task),
            None,
            Some(DefaultSecretSettings::new(SecretString::from("secret"))),
            ParseContext::Request,
        )
        .unwrap()
    }

    fn request(model: EmbeddingsModel, input: &[&str]) -> EmbeddingsRequest {
        EmbeddingsRequest::new(
            Truncator::default(),
            TruncationResult::untruncated(input.iter().map(|s| s.to_string()).collect()),
            Arc::new(model),
        )
    }

    fn body(request: &EmbeddingsRequest) -> Value {
        serde_json::from_slice(&request.create_http_request().unwrap().body).unwrap()
    }

    #[test]
    fn request_context_derives_dimensions_set_by_user() {
        let settings = EmbeddingsServiceSettings::from_map(
            &mut map(json!({"model_id": "nomic-ai/nomic-embed-text-v1.5", "dimensions": 768})),
            ParseContext::Request,
        )
        .unwrap();
        assert!(settings.dimensions_set_by_user());
        assert_eq!(settings.uri().as_str(), DEFAULT_URL);
        assert_eq!(settings.rate_limit_settings().requests_per_minute(), 3000);

        let settings = EmbeddingsServiceSettings::from_map(
            &mut map(json!({"model_id": "m"})),
            ParseContext::Request,
        )
        .unwrap();
        assert!(!settings.dimensions_set_by_user());
    }

    #[test]
    fn persisted_context_defaults_dimensions_set_by_user_to_false() {
        let settings = EmbeddingsServiceSettings::from_map(
            &mut map(json!({"model_id": "m", "dimensions": 768})),
            ParseContext::Persistent,
        )
        .unwrap();
        assert!(!settings.dimensions_set_by_user());

        let settings = EmbeddingsServiceSettings::from_map(
            &mut map(json!({"model_id": "m", "dimensions_set_by_user": true})),
            ParseContext::Persistent,
        )
        .unwrap();
        assert!(settings.dimensions_set_by_user());
    }

    #[test]
    fn invalid_service_settings_report_every_failure() {
        let err = EmbeddingsServiceSettings::from_map(
            &mut map(json!({"dimensions": -1, "similarity": "manhattan"})),
            ParseContext::Request,
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("[service_settings] does not contain the required setting [model_id]"));
        assert!(message.contains("[service_settings] Invalid value [-1]. [dimensions] must be a positive integer"));
        assert!(message.contains("[similarity] must be one of"));
        assert!(err.is_client_error());
    }

    #[test]
    fn persisted_settings_serialize_with_the_flag() {
        let settings = EmbeddingsServiceSettings::from_map(
            &mut map(json!({"model_id": "m", "dimensions": 8})),
            ParseContext::Request,
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&settings).unwrap(),
            json!({
                "model_id": "m",
                "url": DEFAULT_URL,
                "dimensions": 8,
                "dimensions_set_by_user": true,
                "rate_limit": {"requests_per_minute": 3000}
            })
        );
    }

    #[test]
    fn task_dimensions_win_over_service_dimensions() {
        let request = request(
            model(json!({"model_id": "m", "dimensions": 768}), json!({"dimensions": 256})),
            &["hello"],
        );
        assert_eq!(body(&request), json!({"model": "m", "input": ["hello"], "dimensions": 256}));
    }

    #[test]
    fn dimensions_are_omitted_when_unset() {
        let request = request(model(json!({"model_id": "m"}), json!({})), &["a", "b"]);
        let http = request.create_http_request().unwrap();
        assert_eq!(http.url.as_str(), DEFAULT_URL);
        assert_eq!(http.inference_entity_id, "my-embeddings");
        assert_eq!(body(&request), json!({"model": "m", "input": ["a", "b"]}));
    }

    #[test]
    fn of_reuses_the_model_when_there_is_nothing_to_override() {
        let original = Arc::new(model(json!({"model_id": "m"}), json!({"dimensions": 64})));

        let same = EmbeddingsModel::of(&original, &ConfigMap::new()).unwrap();
        assert!(Arc::ptr_eq(&original, &same));

        let overridden = EmbeddingsModel::of(&original, &map(json!({"dimensions": 32}))).unwrap();
        assert!(!Arc::ptr_eq(&original, &overridden));
        assert_eq!(overridden.task_settings().dimensions, Some(32));
        assert_eq!(original.task_settings().dimensions, Some(64));
    }

    #[test]
    fn merging_empty_settings_keeps_the_original() {
        for stored in [
            EmbeddingsTaskSettings::EMPTY,
            EmbeddingsTaskSettings {
                dimensions: Some(512),
            },
        ] {
            assert_eq!(
                EmbeddingsTaskSettings::of(&stored, &EmbeddingsTaskSettings::EMPTY),
                stored
            );
        }
    }

    #[test]
    fn truncate_returns_a_shorter_copy() {
        let original = request(model(json!({"model_id": "m"}), json!({})), &["abcdefgh"]);
        let truncated = original.truncate();

        assert_eq!(original.input(), ["abcdefgh"]);
        assert_eq!(original.truncation_info(), Some(vec![false]));
        assert_eq!(truncated.truncation_info(), Some(vec![true]));
        let body: Value = serde_json::from_slice(&truncated.create_http_request().unwrap().body).unwrap();
        assert_eq!(body["input"], json!(["abcd"]));
    }

    #[test]
    fn parse_keeps_data_order() {
        let request = request(model(json!({"model_id": "m"}), json!({})), &["a", "b"]);
        let result = HttpResult::new(
            StatusCode::OK,
            Version::HTTP_11,
            r#"{"data":[{"index":0,"embedding":[0.1,0.2]},{"index":1,"embedding":[0.3,0.4]}]}"#,
        );
        let embeddings = parse_embeddings_response(&request, &result)
            .unwrap()
            .into_embeddings()
            .unwrap();
        assert_eq!(embeddings, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[test]
    fn embedding_details_default_similarity_to_cosine() {
        let settings = EmbeddingsServiceSettings::new("m", None).with_embedding_details(1024);
        assert_eq!(settings.dimensions(), Some(1024));
        assert_eq!(settings.similarity(), Some(SimilarityMeasure::Cosine));
    }
}
