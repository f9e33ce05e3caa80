//! # fireworks-inference
//!
//! A Rust library that serves text embeddings and document reranking through
//! FireworksAI, with per-endpoint rate limiting, retries and input truncation.
//!
//! ## Features
//!
//! - **Model parsing**: Build embeddings and rerank models from request or
//!   persisted configuration maps, with strict validation of unknown keys
//! - **Inference**: Embed a list of texts or rerank documents against a query
//! - **Chunked inference**: Split long documents into chunks, embed them in
//!   concurrent batches and reassemble the results per document
//! - **Rate limiting**: Token bucket per endpoint, model and api key
//! - **Retries**: Exponential backoff for rate limited and server errors, and
//!   truncate-and-resend when the provider reports an oversized input
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use fireworks_inference::SenderConfig;
//! use fireworks_inference::api::{EmbeddingsInput, InferenceInputs, InputType};
//! use fireworks_inference::model::TaskType;
//! use fireworks_inference::service::FireworksAiService;
//! use serde_json::json;
//!
//! # async fn example() -> fireworks_inference::Result<()> {
//! let service = FireworksAiService::with_http_sender(SenderConfig::default())?;
//!
//! let config = json!({
//!     "service_settings": {
//!         "model_id": "nomic-ai/nomic-embed-text-v1.5",
//!         "api_key": "YOUR_API_KEY"
//!     }
//! });
//! let config = config.as_object().cloned().unwrap_or_default();
//! let model = service.parse_request_config("my-embeddings", TaskType::TextEmbedding, config)?;
//!
//! let results = service
//!     .infer(
//!         &model,
//!         InferenceInputs::Embeddings(EmbeddingsInput {
//!             inputs: vec!["hello world".to_string()],
//!             input_type: InputType::Unspecified,
//!         }),
//!         &serde_json::Map::new(),
//!         Duration::from_secs(30),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`service`] - Entry points: config parsing, inference, chunked inference
//! - [`embedding`] - Embeddings settings, model, request and response parsing
//! - [`reranker`] - Rerank settings, model, request and response parsing
//! - [`batching`] - Chunk batching and per-document result assembly
//! - [`action`] - Builds executable requests from a model and call-time settings
//! - Transport configuration re-exported from the private `config` module

pub mod action;
pub mod api;
pub mod batching;
pub mod chunking;
mod config;
pub mod embedding;
mod error;
pub mod model;
pub mod request;
mod reqwestx;
pub mod reranker;
pub mod response;
pub mod service;
pub mod settings;
pub mod truncation;

pub use config::*;
pub use error::{Error, ProviderError, ProviderErrorKind, Result, ValidationErrors};
pub use reqwestx::{HttpSender, Sender};
