//! Splits chunked inputs into provider-sized batches and reassembles the
//! per-batch embeddings in input order.
//!
//! Each batch gets a [`BatchListener`]. Listeners write into write-once slots
//! indexed by chunk position, so batches may complete in any order. The last
//! listener to complete sends the assembled result, or the first recorded
//! failure, on the caller's oneshot channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::api::{ChunkInferenceInput, ChunkedInference, EmbeddingChunk, InferenceResults};
use crate::chunking::{ChunkOffset, ChunkingSettings};
use crate::error::{Error, Result};

pub type ChunkedInferenceSender = oneshot::Sender<Result<Vec<ChunkedInference>>>;

/// Consecutive chunk texts sent in one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    requests: Vec<String>,
    start: usize,
}

impl Batch {
    pub fn inputs(&self) -> &[String] {
        &self.requests
    }

    pub fn into_inputs(self) -> Vec<String> {
        self.requests
    }

    /// Position of the first chunk of this batch across all inputs.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Debug)]
pub struct BatchRequestAndListener {
    pub batch: Batch,
    pub listener: BatchListener,
}

pub struct EmbeddingRequestChunker {
    offsets: Vec<Vec<ChunkOffset>>,
    batches: Vec<Batch>,
}

impl EmbeddingRequestChunker {
    /// Chunks every input with its own settings, falling back to
    /// `default_settings` and then to [`ChunkingSettings::default`].
    pub fn new(
        inputs: &[ChunkInferenceInput],
        max_batch_size: usize,
        default_settings: Option<ChunkingSettings>,
    ) -> Self {
        let max_batch_size = max_batch_size.max(1);
        let mut offsets = Vec::with_capacity(inputs.len());
        let mut chunks = Vec::new();

        for input in inputs {
            let settings = input
                .chunking_settings
                .or(default_settings)
                .unwrap_or_default();
            let input_offsets = settings.chunker().chunk(&input.input);
            chunks.extend(
                input_offsets
                    .iter()
                    .map(|offset| input.input[offset.start..offset.end].to_string()),
            );
            offsets.push(input_offsets);
        }

        let mut batches = Vec::with_capacity(chunks.len().div_ceil(max_batch_size));
        let mut start = 0;
        let mut chunks = chunks.into_iter().peekable();
        while chunks.peek().is_some() {
            let requests: Vec<String> = chunks.by_ref().take(max_batch_size).collect();
            let len = requests.len();
            batches.push(Batch { requests, start });
            start += len;
        }

        debug!(
            "Chunked {} inputs into {} chunks across {} batches",
            offsets.len(),
            start,
            batches.len()
        );

        Self { offsets, batches }
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Pairs every batch with the listener that records its outcome.
    ///
    /// With no inputs there are no batches and `listener` completes at once
    /// with an empty result.
    pub fn batch_requests_with_listeners(
        self,
        listener: ChunkedInferenceSender,
    ) -> Vec<BatchRequestAndListener> {
        if self.batches.is_empty() {
            let _ = listener.send(Ok(Vec::new()));
            return Vec::new();
        }

        let total_chunks = self.offsets.iter().map(Vec::len).sum();
        let state = Arc::new(AggregateState {
            slots: (0..total_chunks).map(|_| OnceCell::new()).collect(),
            offsets: self.offsets,
            pending: AtomicUsize::new(self.batches.len()),
            failure: Mutex::new(None),
            listener: Mutex::new(Some(listener)),
        });

        self.batches
            .into_iter()
            .map(|batch| BatchRequestAndListener {
                listener: BatchListener {
                    state: Arc::clone(&state),
                    start: batch.start,
                    len: batch.len(),
                    completed: false,
                },
                batch,
            })
            .collect()
    }
}

struct AggregateState {
    slots: Vec<OnceCell<Vec<f32>>>,
    offsets: Vec<Vec<ChunkOffset>>,
    pending: AtomicUsize,
    failure: Mutex<Option<Error>>,
    listener: Mutex<Option<ChunkedInferenceSender>>,
}

impl AggregateState {
    fn record_failure(&self, error: Error) {
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn finish(&self) {
        let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match failure {
            Some(error) => Err(error),
            None => self.assemble(),
        };
        if listener.send(result).is_err() {
            trace!("Chunked inference receiver dropped before completion");
        }
    }

    fn assemble(&self) -> Result<Vec<ChunkedInference>> {
        let mut slots = self.slots.iter();
        self.offsets
            .iter()
            .map(|offsets| {
                let chunks = offsets
                    .iter()
                    .map(|offset| {
                        let embedding = slots
                            .next()
                            .and_then(OnceCell::get)
                            .cloned()
                            .ok_or(Error::ListenerDropped)?;
                        Ok(EmbeddingChunk {
                            embedding,
                            offset: *offset,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(ChunkedInference { chunks })
            })
            .collect()
    }
}

/// Records the outcome of one batch.
///
/// Consumed by [`on_response`](Self::on_response),
/// [`on_failure`](Self::on_failure) or [`on_result`](Self::on_result); a
/// listener dropped without completing counts as a failed batch.
pub struct BatchListener {
    state: Arc<AggregateState>,
    start: usize,
    len: usize,
    completed: bool,
}

impl std::fmt::Debug for BatchListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchListener")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

impl BatchListener {
    pub fn on_response(mut self, embeddings: Vec<Vec<f32>>) {
        if embeddings.len() != self.len {
            let error = Error::EmbeddingCountMismatch {
                embeddings: embeddings.len(),
                inputs: self.len,
            };
            self.complete(Some(error));
            return;
        }

        for (slot, embedding) in self.state.slots[self.start..self.start + self.len]
            .iter()
            .zip(embeddings)
        {
            let _ = slot.set(embedding);
        }
        self.complete(None);
    }

    pub fn on_failure(mut self, error: Error) {
        self.complete(Some(error));
    }

    pub fn on_result(self, result: Result<InferenceResults>) {
        match result.and_then(InferenceResults::into_embeddings) {
            Ok(embeddings) => self.on_response(embeddings),
            Err(error) => self.on_failure(error),
        }
    }

    fn complete(&mut self, failure: Option<Error>) {
        if self.completed {
            return;
        }
        self.completed = true;

        if let Some(error) = failure {
            debug!("Batch starting at chunk {} failed: {}", self.start, error);
            self.state.record_failure(error);
        }
        if self.state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.finish();
        }
    }
}

impl Drop for BatchListener {
    fn drop(&mut self) {
        self.complete(Some(Error::ListenerDropped));
    }
}
