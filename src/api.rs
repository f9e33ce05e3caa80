use serde::{Deserialize, Serialize};

use crate::chunking::{ChunkOffset, ChunkingSettings};
use crate::{Error, Result};

/// Why the caller is embedding the input.
///
/// FireworksAI embeddings take no input type, so only `Unspecified` and the
/// internal variants are accepted for the embeddings task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Ingest,
    Search,
    Classification,
    Clustering,
    #[default]
    Unspecified,
    InternalIngest,
    InternalSearch,
}

impl InputType {
    pub fn is_unspecified_or_internal(self) -> bool {
        matches!(
            self,
            InputType::Unspecified | InputType::InternalIngest | InputType::InternalSearch
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InputType::Ingest => "ingest",
            InputType::Search => "search",
            InputType::Classification => "classification",
            InputType::Clustering => "clustering",
            InputType::Unspecified => "unspecified",
            InputType::InternalIngest => "internal_ingest",
            InputType::InternalSearch => "internal_search",
        }
    }
}

/// Texts to embed in a single provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingsInput {
    pub inputs: Vec<String>,
    pub input_type: InputType,
}

/// A rerank call.
///
/// `top_n` and `return_documents` take precedence over the model's stored
/// task settings when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryAndDocsInputs {
    pub query: String,
    pub chunks: Vec<String>,
    pub top_n: Option<u32>,
    pub return_documents: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceInputs {
    Embeddings(EmbeddingsInput),
    QueryAndDocs(QueryAndDocsInputs),
}

/// Chat-style input; only accepted so it can be rejected with a clear error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedChatInput {
    pub messages: Vec<String>,
    pub stream: bool,
}

/// Embedding vectors, one per input, in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextEmbeddingFloatResults {
    pub embeddings: Vec<Vec<f32>>,
}

/// One reranked document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedDoc {
    /// Position of the document in the request.
    pub index: usize,
    pub relevance_score: f32,
    /// Present when the provider was asked to return documents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Reranked documents in the order the provider ranked them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedDocsResults {
    pub docs: Vec<RankedDoc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InferenceResults {
    TextEmbedding(TextEmbeddingFloatResults),
    RankedDocs(RankedDocsResults),
}

impl InferenceResults {
    pub fn into_embeddings(self) -> Result<Vec<Vec<f32>>> {
        match self {
            InferenceResults::TextEmbedding(results) => Ok(results.embeddings),
            InferenceResults::RankedDocs(_) => Err(Error::UnexpectedResults {
                expected: "text embedding",
            }),
        }
    }
}

/// One logical document for chunked inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInferenceInput {
    pub input: String,
    /// Overrides the model's chunking settings for this input only.
    pub chunking_settings: Option<ChunkingSettings>,
}

impl ChunkInferenceInput {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            chunking_settings: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingChunk {
    pub embedding: Vec<f32>,
    pub offset: ChunkOffset,
}

/// Chunk embeddings for one [`ChunkInferenceInput`], in chunk order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkedInference {
    pub chunks: Vec<EmbeddingChunk>,
}
