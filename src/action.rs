use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tracing::{debug, warn};

use crate::api::{EmbeddingsInput, InferenceInputs, InferenceResults, QueryAndDocsInputs};
use crate::embedding::{self, EmbeddingsModel, EmbeddingsRequest, parse_embeddings_response};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::request::Request;
use crate::reqwestx::Sender;
use crate::reranker::{self, RerankModel, RerankRequest, parse_rerank_response};
use crate::response::ResponseHandler;
use crate::settings::ConfigMap;
use crate::truncation::{TruncationResult, Truncator};

pub const EMBEDDINGS_HANDLER: ResponseHandler =
    ResponseHandler::new(embedding::REQUEST_TYPE, parse_embeddings_response);

pub const RERANK_HANDLER: ResponseHandler =
    ResponseHandler::new(reranker::REQUEST_TYPE, parse_rerank_response);

/// Shared helpers handed to every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceComponents {
    pub truncator: Truncator,
}

pub type EmbeddingsRequestFactory = Arc<dyn Fn(TruncationResult) -> EmbeddingsRequest + Send + Sync>;
pub type RerankRequestFactory = Arc<dyn Fn(&QueryAndDocsInputs) -> RerankRequest + Send + Sync>;

/// Builds embeddings requests from inputs cut to the model's token budget.
#[derive(Clone)]
pub struct TruncatingRequestManager {
    endpoint: Url,
    handler: ResponseHandler,
    factory: EmbeddingsRequestFactory,
    max_input_tokens: Option<u32>,
}

impl TruncatingRequestManager {
    fn create_request(&self, input: EmbeddingsInput) -> Box<dyn Request> {
        let truncation = Truncator::truncate_to_token_limit(&input.inputs, self.max_input_tokens);
        Box::new((self.factory)(truncation))
    }
}

#[derive(Clone)]
pub struct GenericRequestManager {
    endpoint: Url,
    handler: ResponseHandler,
    factory: RerankRequestFactory,
}

#[derive(Clone)]
pub enum RequestManager {
    Truncating(TruncatingRequestManager),
    Generic(GenericRequestManager),
}

impl RequestManager {
    pub fn endpoint(&self) -> &Url {
        match self {
            RequestManager::Truncating(manager) => &manager.endpoint,
            RequestManager::Generic(manager) => &manager.endpoint,
        }
    }

    pub fn handler(&self) -> ResponseHandler {
        match self {
            RequestManager::Truncating(manager) => manager.handler,
            RequestManager::Generic(manager) => manager.handler,
        }
    }

    fn create_request(&self, inputs: InferenceInputs) -> Result<Box<dyn Request>> {
        match (self, inputs) {
            (RequestManager::Truncating(manager), InferenceInputs::Embeddings(input)) => {
                Ok(manager.create_request(input))
            }
            (RequestManager::Generic(manager), InferenceInputs::QueryAndDocs(input)) => {
                Ok(Box::new((manager.factory)(&input)))
            }
            (RequestManager::Truncating(manager), InferenceInputs::QueryAndDocs(_)) => {
                Err(Error::InputsMismatch {
                    request_type: manager.handler.request_type(),
                    expected: "embeddings",
                })
            }
            (RequestManager::Generic(manager), InferenceInputs::Embeddings(_)) => {
                Err(Error::InputsMismatch {
                    request_type: manager.handler.request_type(),
                    expected: "query and documents",
                })
            }
        }
    }
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, handler) = match self {
            RequestManager::Truncating(manager) => ("Truncating", manager.handler),
            RequestManager::Generic(manager) => ("Generic", manager.handler),
        };
        f.debug_struct(kind)
            .field("endpoint", &self.endpoint().as_str())
            .field("handler", &handler)
            .finish()
    }
}

/// A ready-to-run provider call for one model.
#[derive(Clone)]
pub struct ExecutableAction {
    sender: Arc<dyn Sender>,
    manager: RequestManager,
    failed_to_send_message: String,
}

impl fmt::Debug for ExecutableAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableAction")
            .field("manager", &self.manager)
            .finish()
    }
}

impl ExecutableAction {
    pub fn new(sender: Arc<dyn Sender>, manager: RequestManager, request_kind: &str) -> Self {
        Self {
            sender,
            manager,
            failed_to_send_message: format!("Failed to send FireworksAI {request_kind} request"),
        }
    }

    pub fn manager(&self) -> &RequestManager {
        &self.manager
    }

    /// Builds the request for `inputs` and sends it. Failures are logged and
    /// returned as they are.
    pub async fn execute(
        &self,
        inputs: InferenceInputs,
        timeout: Duration,
    ) -> Result<InferenceResults> {
        let result = match self.manager.create_request(inputs) {
            Ok(request) => {
                debug!(
                    "Sending {} request to {}",
                    self.manager.handler().request_type(),
                    self.manager.endpoint()
                );
                self.sender
                    .send(request, self.manager.handler(), timeout)
                    .await
            }
            Err(err) => Err(err),
        };

        result.inspect_err(|err| warn!("{}: {}", self.failed_to_send_message, err))
    }
}

/// Maps a model to the action that serves it.
#[derive(Clone)]
pub struct ActionCreator {
    sender: Arc<dyn Sender>,
    components: ServiceComponents,
}

impl ActionCreator {
    pub fn new(sender: Arc<dyn Sender>, components: ServiceComponents) -> Self {
        Self { sender, components }
    }

    /// `task_settings` are request-time overrides merged over the model's own.
    pub fn create(&self, model: &Model, task_settings: &ConfigMap) -> Result<ExecutableAction> {
        match model {
            Model::Embeddings(model) => self.create_embeddings(model, task_settings),
            Model::Rerank(model) => self.create_rerank(model, task_settings),
        }
    }

    fn create_embeddings(
        &self,
        model: &Arc<EmbeddingsModel>,
        task_settings: &ConfigMap,
    ) -> Result<ExecutableAction> {
        let model = EmbeddingsModel::of(model, task_settings)?;
        let truncator = self.components.truncator;
        let manager = TruncatingRequestManager {
            endpoint: model.uri().clone(),
            handler: EMBEDDINGS_HANDLER,
            max_input_tokens: model.service_settings().max_input_tokens(),
            factory: Arc::new(move |truncation| {
                EmbeddingsRequest::new(truncator, truncation, Arc::clone(&model))
            }),
        };
        Ok(ExecutableAction::new(
            Arc::clone(&self.sender),
            RequestManager::Truncating(manager),
            "embeddings",
        ))
    }

    fn create_rerank(
        &self,
        model: &Arc<RerankModel>,
        task_settings: &ConfigMap,
    ) -> Result<ExecutableAction> {
        let model = RerankModel::of(model, task_settings)?;
        let manager = GenericRequestManager {
            endpoint: model.uri().clone(),
            handler: RERANK_HANDLER,
            factory: Arc::new(move |inputs| RerankRequest::new(inputs, Arc::clone(&model))),
        };
        Ok(ExecutableAction::new(
            Arc::clone(&self.sender),
            RequestManager::Generic(manager),
            "rerank",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use secrecy::SecretString;
    use serde_json::{Value, json};

    use crate::api::{InputType, RankedDocsResults, TextEmbeddingFloatResults};
    use crate::embedding::{EmbeddingsServiceSettings, EmbeddingsTaskSettings};
    use crate::error::{ProviderError, ProviderErrorKind};
    use crate::reranker::{RerankServiceSettings, RerankTaskSettings};
    use crate::settings::{DefaultSecretSettings, ParseContext};

    #[derive(Default)]
    struct RecordingSender {
        bodies: Mutex<Vec<Value>>,
        calls: AtomicUsize,
        fail_with: Option<StatusCode>,
    }

    #[async_trait]
    impl Sender for RecordingSender {
        async fn send(
            &self,
            request: Box<dyn Request>,
            handler: ResponseHandler,
            _timeout: Duration,
        ) -> Result<InferenceResults> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let http = request.create_http_request()?;
            self.bodies
                .lock()
                .unwrap()
                .push(serde_json::from_slice(&http.body).unwrap());

            if let Some(status) = self.fail_with {
                return Err(Error::Provider(ProviderError {
                    kind: ProviderErrorKind::ServerError,
                    status,
                    entity_id: request.inference_entity_id().to_string(),
                    message: format!("HTTP/1.1 {status}"),
                }));
            }

            Ok(match handler.request_type() {
                embedding::REQUEST_TYPE => {
                    InferenceResults::TextEmbedding(TextEmbeddingFloatResults {
                        embeddings: Vec::new(),
                    })
                }
                _ => InferenceResults::RankedDocs(RankedDocsResults { docs: Vec::new() }),
            })
        }
    }

    fn secrets() -> Option<DefaultSecretSettings> {
        Some(DefaultSecretSettings::new(SecretString::from("secret")))
    }

    fn embeddings_model(service: Value) -> Model {
        let Value::Object(mut service) = service else {
            panic!("expected an object");
        };
        let settings = EmbeddingsServiceSettings::from_map(&mut service, ParseContext::Request).unwrap();
        Model::from(EmbeddingsModel::new(
            "my-embeddings",
            settings,
            EmbeddingsTaskSettings::EMPTY,
            None,
            secrets(),
        ))
    }

    fn rerank_model(task_settings: RerankTaskSettings) -> Model {
        Model::from(RerankModel::new(
            "my-reranker",
            RerankServiceSettings::new("rerank-model", None),
            task_settings,
            secrets(),
        ))
    }

    fn embeddings_inputs(inputs: &[&str]) -> InferenceInputs {
        InferenceInputs::Embeddings(EmbeddingsInput {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            input_type: InputType::Unspecified,
        })
    }

    fn overrides(value: Value) -> ConfigMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn embeddings_action_applies_overrides_and_token_budget() {
        let sender = Arc::new(RecordingSender::default());
        let creator = ActionCreator::new(sender.clone(), ServiceComponents::default());
        let model = embeddings_model(json!({"model_id": "m", "max_input_tokens": 2}));

        let action = creator
            .create(&model, &overrides(json!({"dimensions": 16})))
            .unwrap();
        assert!(matches!(action.manager(), RequestManager::Truncating(_)));

        action
            .execute(embeddings_inputs(&["abcdefghijkl", "abc"]), Duration::from_secs(1))
            .await
            .unwrap();

        let bodies = sender.bodies.lock().unwrap();
        assert_eq!(
            bodies[0],
            json!({"model": "m", "input": ["abcdefgh", "abc"], "dimensions": 16})
        );
    }

    #[tokio::test]
    async fn rerank_action_prefers_call_time_values() {
        let sender = Arc::new(RecordingSender::default());
        let creator = ActionCreator::new(sender.clone(), ServiceComponents::default());
        let model = rerank_model(RerankTaskSettings {
            return_documents: Some(true),
            top_n: Some(10),
        });

        let action = creator.create(&model, &ConfigMap::new()).unwrap();
        action
            .execute(
                InferenceInputs::QueryAndDocs(QueryAndDocsInputs {
                    query: "q".to_string(),
                    chunks: vec!["a".to_string()],
                    top_n: Some(1),
                    return_documents: None,
                }),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let bodies = sender.bodies.lock().unwrap();
        assert_eq!(
            bodies[0],
            json!({
                "model": "rerank-model",
                "query": "q",
                "documents": ["a"],
                "top_n": 1,
                "return_documents": true
            })
        );
    }

    #[tokio::test]
    async fn mismatched_inputs_are_rejected_before_sending() {
        let sender = Arc::new(RecordingSender::default());
        let creator = ActionCreator::new(sender.clone(), ServiceComponents::default());
        let action = creator
            .create(&rerank_model(RerankTaskSettings::EMPTY), &ConfigMap::new())
            .unwrap();

        let err = action
            .execute(embeddings_inputs(&["a"]), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InputsMismatch { .. }));
        assert!(err.is_client_error());
        assert_eq!(sender.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sender_failures_are_returned_unchanged() {
        let sender = Arc::new(RecordingSender {
            fail_with: Some(StatusCode::INTERNAL_SERVER_ERROR),
            ..Default::default()
        });
        let creator = ActionCreator::new(sender, ServiceComponents::default());
        let action = creator
            .create(&embeddings_model(json!({"model_id": "m"})), &ConfigMap::new())
            .unwrap();

        let err = action
            .execute(embeddings_inputs(&["a"]), Duration::from_secs(1))
            .await
            .unwrap_err();

        let Error::Provider(provider) = err else {
            panic!("expected a provider error");
        };
        assert_eq!(provider.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(provider.entity_id, "my-embeddings");
    }

    #[test]
    fn invalid_overrides_fail_action_creation() {
        let creator = ActionCreator::new(
            Arc::new(RecordingSender::default()),
            ServiceComponents::default(),
        );
        let err = creator
            .create(
                &embeddings_model(json!({"model_id": "m"})),
                &overrides(json!({"dimensions": -4})),
            )
            .unwrap_err();
        assert!(err.is_client_error());
    }
}
