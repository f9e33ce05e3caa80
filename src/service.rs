use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::action::{ActionCreator, ServiceComponents};
use crate::api::{
    ChunkInferenceInput, ChunkedInference, EmbeddingsInput, InferenceInputs, InferenceResults,
    InputType, UnifiedChatInput,
};
use crate::batching::{BatchRequestAndListener, EmbeddingRequestChunker};
use crate::chunking::ChunkingSettings;
use crate::config::SenderConfig;
use crate::embedding::EmbeddingsModel;
use crate::error::{Error, Result, ValidationErrors};
use crate::model::{InferenceModel, Model, SERVICE_NAME, TaskType};
use crate::reqwestx::{HttpSender, Sender};
use crate::reranker::RerankModel;
use crate::settings::{
    CHUNKING_SETTINGS, ConfigMap, DefaultSecretSettings, MODEL_ID, ParseContext,
    RateLimitSettings, SECRET_SETTINGS, SERVICE_SETTINGS, SettingsConfiguration,
    SettingsFieldType, TASK_SETTINGS, remove_from_map, remove_from_map_or_default_empty,
    remove_from_map_or_throw_if_null, throw_if_not_empty_map,
};

const SUPPORTED_TASK_TYPES: [TaskType; 2] = [TaskType::TextEmbedding, TaskType::Rerank];

/// Schema describing how the service is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceConfiguration {
    pub service: &'static str,
    pub name: &'static str,
    pub task_types: Vec<TaskType>,
    pub configurations: BTreeMap<String, SettingsConfiguration>,
}

static CONFIGURATION: Lazy<ServiceConfiguration> = Lazy::new(|| {
    let mut configurations = BTreeMap::from([(
        MODEL_ID.to_string(),
        SettingsConfiguration {
            description: "The model ID to use for FireworksAI requests. Supports Qwen3 embeddings, Nomic embeddings, and reranker models.".to_string(),
            label: "Model ID".to_string(),
            required: true,
            sensitive: false,
            updatable: false,
            field_type: SettingsFieldType::Str,
            supported_task_types: SUPPORTED_TASK_TYPES.to_vec(),
        },
    )]);
    configurations.extend(DefaultSecretSettings::to_settings_configuration(&SUPPORTED_TASK_TYPES));
    configurations.extend(RateLimitSettings::to_settings_configuration(&SUPPORTED_TASK_TYPES));

    ServiceConfiguration {
        service: FireworksAiService::NAME,
        name: FireworksAiService::SERVICE_NAME,
        task_types: SUPPORTED_TASK_TYPES.to_vec(),
        configurations,
    }
});

/// FireworksAI text embedding and rerank service.
#[derive(Clone)]
pub struct FireworksAiService {
    action_creator: ActionCreator,
}

impl FireworksAiService {
    pub const NAME: &'static str = SERVICE_NAME;
    pub const SERVICE_NAME: &'static str = "FireworksAI";
    pub const EMBEDDING_MAX_BATCH_SIZE: usize = 2048;
    pub const RERANKER_WINDOW_SIZE: usize = 5500;

    pub fn new(sender: Arc<dyn Sender>, components: ServiceComponents) -> Self {
        Self {
            action_creator: ActionCreator::new(sender, components),
        }
    }

    pub fn with_http_sender(config: SenderConfig) -> Result<Self> {
        let sender = HttpSender::new(config)?;
        Ok(Self::new(Arc::new(sender), ServiceComponents::default()))
    }

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    pub fn supported_task_types(&self) -> &'static [TaskType] {
        &SUPPORTED_TASK_TYPES
    }

    pub fn configuration() -> &'static ServiceConfiguration {
        &CONFIGURATION
    }

    /// Builds a model from user-supplied configuration.
    ///
    /// The api key is read from the service settings; any key left over in
    /// `config`, the service settings or the task settings is an error.
    pub fn parse_request_config(
        &self,
        inference_entity_id: &str,
        task_type: TaskType,
        mut config: ConfigMap,
    ) -> Result<Model> {
        let mut service_settings = remove_from_map_or_throw_if_null(&mut config, SERVICE_SETTINGS)?;
        let mut task_settings = remove_from_map_or_default_empty(&mut config, TASK_SETTINGS)?;

        let chunking_settings = if task_type == TaskType::TextEmbedding {
            let chunking = remove_from_map_or_default_empty(&mut config, CHUNKING_SETTINGS)?;
            Some(ChunkingSettings::from_map(Some(chunking))?)
        } else {
            None
        };

        let secrets = DefaultSecretSettings::from_map(Some(&mut service_settings))?;

        let model = Self::create_model(
            inference_entity_id,
            task_type,
            &mut service_settings,
            &mut task_settings,
            chunking_settings,
            secrets,
            ParseContext::Request,
        )?;

        throw_if_not_empty_map(&config, Self::NAME)?;
        throw_if_not_empty_map(&service_settings, Self::NAME)?;
        throw_if_not_empty_map(&task_settings, Self::NAME)?;

        Ok(model)
    }

    /// Rebuilds a stored model together with its secrets. Unknown keys are
    /// ignored.
    pub fn parse_persisted_config_with_secrets(
        &self,
        inference_entity_id: &str,
        task_type: TaskType,
        mut config: ConfigMap,
        mut secrets: ConfigMap,
    ) -> Result<Model> {
        let mut secret_settings =
            remove_from_map(&mut secrets, SECRET_SETTINGS)?.filter(|map| !map.is_empty());
        let secrets = DefaultSecretSettings::from_map(secret_settings.as_mut())?;
        Self::parse_persisted(inference_entity_id, task_type, &mut config, secrets)
    }

    /// Rebuilds a stored model without secrets; such a model cannot send
    /// requests.
    pub fn parse_persisted_config(
        &self,
        inference_entity_id: &str,
        task_type: TaskType,
        mut config: ConfigMap,
    ) -> Result<Model> {
        Self::parse_persisted(inference_entity_id, task_type, &mut config, None)
    }

    fn parse_persisted(
        inference_entity_id: &str,
        task_type: TaskType,
        config: &mut ConfigMap,
        secrets: Option<DefaultSecretSettings>,
    ) -> Result<Model> {
        let mut service_settings = remove_from_map_or_throw_if_null(config, SERVICE_SETTINGS)?;
        let mut task_settings = remove_from_map_or_default_empty(config, TASK_SETTINGS)?;

        let chunking_settings = if task_type == TaskType::TextEmbedding {
            Some(ChunkingSettings::from_map(remove_from_map(config, CHUNKING_SETTINGS)?)?)
        } else {
            None
        };

        Self::create_model(
            inference_entity_id,
            task_type,
            &mut service_settings,
            &mut task_settings,
            chunking_settings,
            secrets,
            ParseContext::Persistent,
        )
    }

    fn create_model(
        inference_entity_id: &str,
        task_type: TaskType,
        service_settings: &mut ConfigMap,
        task_settings: &mut ConfigMap,
        chunking_settings: Option<ChunkingSettings>,
        secrets: Option<DefaultSecretSettings>,
        context: ParseContext,
    ) -> Result<Model> {
        match task_type {
            TaskType::TextEmbedding => EmbeddingsModel::from_maps(
                inference_entity_id,
                service_settings,
                task_settings,
                chunking_settings,
                secrets,
                context,
            )
            .map(Model::from),
            TaskType::Rerank => RerankModel::from_maps(
                inference_entity_id,
                service_settings,
                task_settings,
                secrets,
                context,
            )
            .map(Model::from),
            other => Err(Error::InvalidTaskType {
                service: Self::NAME,
                task_type: other,
            }),
        }
    }

    fn resolve<'a>(&self, model: &'a dyn InferenceModel) -> Result<&'a Model> {
        model
            .as_any()
            .downcast_ref::<Model>()
            .ok_or_else(|| Error::InvalidModel {
                entity_id: model.inference_entity_id().to_string(),
                service: model.service().to_string(),
            })
    }

    pub async fn infer(
        &self,
        model: &dyn InferenceModel,
        inputs: InferenceInputs,
        task_settings: &ConfigMap,
        timeout: Duration,
    ) -> Result<InferenceResults> {
        let model = self.resolve(model)?;
        if let InferenceInputs::Embeddings(input) = &inputs {
            Self::validate_input_type(input.input_type, model.task_type())?;
        }

        let action = self.action_creator.create(model, task_settings)?;
        action.execute(inputs, timeout).await
    }

    /// Chunks each input, embeds the chunks in batches of at most
    /// [`Self::EMBEDDING_MAX_BATCH_SIZE`] and returns one result per input.
    ///
    /// Batches are sent concurrently. The first failed batch fails the call;
    /// batches already in flight still run to completion.
    pub async fn chunked_infer(
        &self,
        model: &dyn InferenceModel,
        inputs: Vec<ChunkInferenceInput>,
        input_type: InputType,
        task_settings: &ConfigMap,
        timeout: Duration,
    ) -> Result<Vec<ChunkedInference>> {
        if model.task_type() == TaskType::Rerank {
            return Err(Error::unsupported(
                "Chunked inference is not supported for rerank task",
            ));
        }

        let model = self.resolve(model)?;
        let Model::Embeddings(embeddings_model) = model else {
            return Err(Error::InvalidModel {
                entity_id: model.inference_entity_id().to_string(),
                service: Self::NAME.to_string(),
            });
        };
        Self::validate_input_type(input_type, model.task_type())?;

        let action = self.action_creator.create(model, task_settings)?;
        let (tx, rx) = oneshot::channel();
        let requests = EmbeddingRequestChunker::new(
            &inputs,
            Self::EMBEDDING_MAX_BATCH_SIZE,
            embeddings_model.chunking_settings().copied(),
        )
        .batch_requests_with_listeners(tx);

        debug!(
            "Sending {} embedding batches for {}",
            requests.len(),
            model.inference_entity_id()
        );

        let mut in_flight: FuturesUnordered<_> = requests
            .into_iter()
            .map(|BatchRequestAndListener { batch, listener }| {
                let action = &action;
                async move {
                    let inputs = InferenceInputs::Embeddings(EmbeddingsInput {
                        inputs: batch.into_inputs(),
                        input_type,
                    });
                    listener.on_result(action.execute(inputs, timeout).await);
                }
            })
            .collect();
        while in_flight.next().await.is_some() {}

        rx.await.map_err(|_| Error::ListenerDropped)?
    }

    pub async fn unified_completion_infer(
        &self,
        _model: &dyn InferenceModel,
        _inputs: UnifiedChatInput,
        _timeout: Duration,
    ) -> Result<InferenceResults> {
        Err(Error::unsupported(
            "Unified completion is not supported for FireworksAI service",
        ))
    }

    /// Embeddings take no input type; rerank accepts any.
    pub fn validate_input_type(input_type: InputType, task_type: TaskType) -> Result<()> {
        if task_type == TaskType::Rerank || input_type.is_unspecified_or_internal() {
            return Ok(());
        }
        let mut errors = ValidationErrors::new();
        errors.add(format!(
            "Invalid input_type [{}]. The input_type option is not supported by this service",
            input_type.as_str()
        ));
        errors.into_result()
    }

    pub fn reranker_window_size(&self, _model_id: &str) -> usize {
        Self::RERANKER_WINDOW_SIZE
    }

    /// Records the embedding size observed from the provider on the model.
    pub fn update_model_with_embedding_details(
        &self,
        model: &Model,
        embedding_size: u32,
    ) -> Result<Model> {
        match model {
            Model::Embeddings(embeddings) => {
                let settings = embeddings
                    .service_settings()
                    .with_embedding_details(embedding_size);
                Ok(Model::from(embeddings.with_service_settings(settings)))
            }
            Model::Rerank(_) => Err(Error::InvalidTaskType {
                service: Self::NAME,
                task_type: TaskType::Rerank,
            }),
        }
    }
}
