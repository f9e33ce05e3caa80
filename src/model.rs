use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingsModel;
use crate::error::Result;
use crate::reranker::RerankModel;
use crate::settings::{ConfigMap, TaskSettings};

/// Name the provider is registered under.
pub const SERVICE_NAME: &str = "fireworksai";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TextEmbedding,
    SparseEmbedding,
    Rerank,
    Completion,
    ChatCompletion,
    Any,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::TextEmbedding => "text_embedding",
            TaskType::SparseEmbedding => "sparse_embedding",
            TaskType::Rerank => "rerank",
            TaskType::Completion => "completion",
            TaskType::ChatCompletion => "chat_completion",
            TaskType::Any => "any",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "text_embedding" => Ok(TaskType::TextEmbedding),
            "sparse_embedding" => Ok(TaskType::SparseEmbedding),
            "rerank" => Ok(TaskType::Rerank),
            "completion" => Ok(TaskType::Completion),
            "chat_completion" => Ok(TaskType::ChatCompletion),
            "any" => Ok(TaskType::Any),
            other => Err(format!("Unknown task_type [{other}]")),
        }
    }
}

/// A model handed to the service by the host. Only [`Model`] values belong
/// to this provider; anything else is rejected before a request is built.
pub trait InferenceModel: Send + Sync + 'static {
    fn inference_entity_id(&self) -> &str;
    fn task_type(&self) -> TaskType;
    fn service(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

/// A FireworksAI model descriptor, one variant per supported task type.
#[derive(Debug, Clone)]
pub enum Model {
    Embeddings(Arc<EmbeddingsModel>),
    Rerank(Arc<RerankModel>),
}

impl Model {
    pub fn api_key(&self) -> Option<&SecretString> {
        match self {
            Model::Embeddings(model) => model.api_key(),
            Model::Rerank(model) => model.api_key(),
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Model::Embeddings(model) => model.model_id(),
            Model::Rerank(model) => model.model_id(),
        }
    }
}

impl From<EmbeddingsModel> for Model {
    fn from(model: EmbeddingsModel) -> Self {
        Model::Embeddings(Arc::new(model))
    }
}

impl From<RerankModel> for Model {
    fn from(model: RerankModel) -> Self {
        Model::Rerank(Arc::new(model))
    }
}

impl InferenceModel for Model {
    fn inference_entity_id(&self) -> &str {
        match self {
            Model::Embeddings(model) => model.inference_entity_id(),
            Model::Rerank(model) => model.inference_entity_id(),
        }
    }

    fn task_type(&self) -> TaskType {
        match self {
            Model::Embeddings(_) => TaskType::TextEmbedding,
            Model::Rerank(_) => TaskType::Rerank,
        }
    }

    fn service(&self) -> &str {
        SERVICE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Parses request-time overrides and merges them over `current`.
///
/// Returns `None` when there is nothing to override so callers can keep
/// sharing the original descriptor.
pub(crate) fn override_task_settings<T: TaskSettings>(
    current: &T,
    overrides: &ConfigMap,
) -> Result<Option<T>> {
    if overrides.is_empty() {
        return Ok(None);
    }
    let mut overrides = overrides.clone();
    let request = T::from_map(&mut overrides)?;
    Ok(Some(T::of(current, &request)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_round_trips_through_its_name() {
        for task_type in [TaskType::TextEmbedding, TaskType::Rerank, TaskType::Completion] {
            assert_eq!(task_type.as_str().parse::<TaskType>().unwrap(), task_type);
        }
        assert!("summarize".parse::<TaskType>().is_err());
    }

    #[test]
    fn task_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskType::TextEmbedding).unwrap(),
            "\"text_embedding\""
        );
    }
}
