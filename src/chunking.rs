//! Pre-splitting of long inputs before they are batched for embedding.
//!
//! A [`ChunkingSettings`] value picks a [`Chunker`]; the chunker reports byte
//! offsets into the original text so results can point back at their source.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result, ValidationErrors};
use crate::settings::{CHUNKING_SETTINGS, ConfigMap};

pub const STRATEGY: &str = "strategy";
pub const MAX_CHUNK_SIZE: &str = "max_chunk_size";
pub const OVERLAP: &str = "overlap";
pub const SENTENCE_OVERLAP: &str = "sentence_overlap";

const WORD_MIN_CHUNK_SIZE: usize = 10;
const SENTENCE_MIN_CHUNK_SIZE: usize = 20;

/// Byte range `[start, end)` of a chunk within its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkOffset {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkingSettings {
    Word {
        max_chunk_size: usize,
        overlap: usize,
    },
    Sentence {
        max_chunk_size: usize,
        sentence_overlap: usize,
    },
    None,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        ChunkingSettings::Sentence {
            max_chunk_size: 250,
            sentence_overlap: 1,
        }
    }
}

impl ChunkingSettings {
    /// Used for models persisted before chunking settings were stored.
    pub const LEGACY_DEFAULT: ChunkingSettings = ChunkingSettings::Word {
        max_chunk_size: 250,
        overlap: 100,
    };

    /// `None` yields [`Self::LEGACY_DEFAULT`], an empty map the current default.
    pub fn from_map(map: Option<ConfigMap>) -> Result<Self> {
        let Some(mut map) = map else {
            return Ok(Self::LEGACY_DEFAULT);
        };
        if map.is_empty() {
            return Ok(Self::default());
        }

        let mut errors = ValidationErrors::new();
        let strategy = match map.remove(STRATEGY) {
            Some(Value::String(strategy)) => strategy.to_ascii_lowercase(),
            _ => {
                errors.add(format!(
                    "[{CHUNKING_SETTINGS}] does not contain the required setting [{STRATEGY}]"
                ));
                return Err(Error::Validation(errors));
            }
        };

        let settings = match strategy.as_str() {
            "word" => {
                let max_chunk_size = required_size(&mut map, MAX_CHUNK_SIZE, &mut errors);
                let overlap = required_size(&mut map, OVERLAP, &mut errors);
                if let Some(max) = max_chunk_size
                    && max < WORD_MIN_CHUNK_SIZE
                {
                    errors.add(format!(
                        "[{CHUNKING_SETTINGS}] Invalid value [{max}]. [{MAX_CHUNK_SIZE}] must be a greater than or equal to [{WORD_MIN_CHUNK_SIZE}]"
                    ));
                }
                if let (Some(max), Some(overlap)) = (max_chunk_size, overlap)
                    && overlap > max / 2
                {
                    errors.add(format!(
                        "[{CHUNKING_SETTINGS}] Invalid value [{overlap}]. [{OVERLAP}] must be a less than or equal to [{}]",
                        max / 2
                    ));
                }
                ChunkingSettings::Word {
                    max_chunk_size: max_chunk_size.unwrap_or_default(),
                    overlap: overlap.unwrap_or_default(),
                }
            }
            "sentence" => {
                let max_chunk_size = required_size(&mut map, MAX_CHUNK_SIZE, &mut errors);
                let sentence_overlap = optional_size(&mut map, SENTENCE_OVERLAP, &mut errors).unwrap_or(1);
                if let Some(max) = max_chunk_size
                    && max < SENTENCE_MIN_CHUNK_SIZE
                {
                    errors.add(format!(
                        "[{CHUNKING_SETTINGS}] Invalid value [{max}]. [{MAX_CHUNK_SIZE}] must be a greater than or equal to [{SENTENCE_MIN_CHUNK_SIZE}]"
                    ));
                }
                if sentence_overlap > 1 {
                    errors.add(format!(
                        "[{CHUNKING_SETTINGS}] Invalid value [{sentence_overlap}]. [{SENTENCE_OVERLAP}] must be 0 or 1"
                    ));
                }
                ChunkingSettings::Sentence {
                    max_chunk_size: max_chunk_size.unwrap_or_default(),
                    sentence_overlap,
                }
            }
            "none" => ChunkingSettings::None,
            other => {
                errors.add(format!("Invalid chunking strategy [{other}]"));
                ChunkingSettings::None
            }
        };

        if !map.is_empty() {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            errors.add(format!(
                "Chunking settings contain unknown settings [{}]",
                keys.join(", ")
            ));
        }

        errors.into_result()?;
        Ok(settings)
    }

    pub fn chunker(&self) -> Box<dyn Chunker> {
        match *self {
            ChunkingSettings::Word {
                max_chunk_size,
                overlap,
            } => Box::new(WordBoundaryChunker {
                max_chunk_size,
                overlap,
            }),
            ChunkingSettings::Sentence {
                max_chunk_size,
                sentence_overlap,
            } => Box::new(SentenceBoundaryChunker {
                max_chunk_size,
                sentence_overlap,
            }),
            ChunkingSettings::None => Box::new(NoopChunker),
        }
    }
}

fn optional_size(map: &mut ConfigMap, key: &str, errors: &mut ValidationErrors) -> Option<usize> {
    match map.remove(key) {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) if n.as_u64().is_some() => n.as_u64().map(|v| v as usize),
        Some(other) => {
            errors.add(format!(
                "[{CHUNKING_SETTINGS}] Invalid value [{other}]. [{key}] must be a non-negative integer"
            ));
            None
        }
    }
}

fn required_size(map: &mut ConfigMap, key: &str, errors: &mut ValidationErrors) -> Option<usize> {
    let missing = !map.contains_key(key);
    let value = optional_size(map, key, errors);
    if missing {
        errors.add(format!(
            "[{CHUNKING_SETTINGS}] does not contain the required setting [{key}]"
        ));
    }
    value
}

/// Splits one input into chunks.
pub trait Chunker: Send + Sync {
    /// Returns at least one chunk; the first starts at 0 and the last ends at
    /// `text.len()`.
    fn chunk(&self, text: &str) -> Vec<ChunkOffset>;
}

struct NoopChunker;

impl Chunker for NoopChunker {
    fn chunk(&self, text: &str) -> Vec<ChunkOffset> {
        vec![ChunkOffset {
            start: 0,
            end: text.len(),
        }]
    }
}

struct WordBoundaryChunker {
    max_chunk_size: usize,
    overlap: usize,
}

impl Chunker for WordBoundaryChunker {
    fn chunk(&self, text: &str) -> Vec<ChunkOffset> {
        let words = word_spans(text);
        if words.is_empty() {
            return NoopChunker.chunk(text);
        }

        let max = self.max_chunk_size.max(1);
        let step = max.saturating_sub(self.overlap).max(1);
        let mut chunks = Vec::new();
        let mut first = 0;
        loop {
            let last = (first + max).min(words.len());
            let start = if first == 0 { 0 } else { words[first].0 };
            let end = if last == words.len() {
                text.len()
            } else {
                words[last - 1].1
            };
            chunks.push(ChunkOffset { start, end });
            if last == words.len() {
                break;
            }
            first += step;
        }
        chunks
    }
}

struct SentenceBoundaryChunker {
    max_chunk_size: usize,
    sentence_overlap: usize,
}

impl Chunker for SentenceBoundaryChunker {
    fn chunk(&self, text: &str) -> Vec<ChunkOffset> {
        let sentences = sentence_spans(text);
        if sentences.is_empty() {
            return NoopChunker.chunk(text);
        }

        let max = self.max_chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut i = 0;
        while i < sentences.len() {
            let (start, end, words) = sentences[i];
            if words > max {
                // A single sentence over budget falls back to word chunking.
                let splitter = WordBoundaryChunker {
                    max_chunk_size: max,
                    overlap: 0,
                };
                chunks.extend(splitter.chunk(&text[start..end]).into_iter().map(|c| {
                    ChunkOffset {
                        start: start + c.start,
                        end: start + c.end,
                    }
                }));
                i += 1;
                continue;
            }

            let mut j = i;
            let mut budget = 0;
            while j < sentences.len() && budget + sentences[j].2 <= max {
                budget += sentences[j].2;
                j += 1;
            }
            chunks.push(ChunkOffset {
                start,
                end: sentences[j - 1].1,
            });
            if j >= sentences.len() {
                break;
            }
            i = if self.sentence_overlap > 0 && j - i > 1 {
                j - 1
            } else {
                j
            };
        }

        if let Some(first) = chunks.first_mut() {
            first.start = 0;
        }
        if let Some(last) = chunks.last_mut() {
            last.end = text.len();
        }
        chunks
    }
}

fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// `(start, end, word_count)` for each sentence.
fn sentence_spans(text: &str) -> Vec<(usize, usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if start.is_none() {
            if c.is_whitespace() {
                continue;
            }
            start = Some(i);
        }
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().is_none_or(|&(_, next)| next.is_whitespace());
        if at_boundary && let Some(s) = start.take() {
            let end = i + c.len_utf8();
            spans.push((s, end, text[s..end].split_whitespace().count()));
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len(), text[s..].split_whitespace().count()));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn texts<'a>(text: &'a str, chunks: &[ChunkOffset]) -> Vec<&'a str> {
        chunks.iter().map(|c| &text[c.start..c.end]).collect()
    }

    fn map(value: Value) -> ConfigMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn absent_map_uses_legacy_default_and_empty_map_the_current_one() {
        assert_eq!(ChunkingSettings::from_map(None).unwrap(), ChunkingSettings::LEGACY_DEFAULT);
        assert_eq!(
            ChunkingSettings::from_map(Some(ConfigMap::new())).unwrap(),
            ChunkingSettings::default()
        );
    }

    #[test]
    fn word_settings_are_validated() {
        let err = ChunkingSettings::from_map(Some(map(json!({
            "strategy": "word",
            "max_chunk_size": 5,
            "overlap": 4,
            "extra": true
        }))))
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("[max_chunk_size] must be a greater than or equal to [10]"));
        assert!(message.contains("[overlap] must be a less than or equal to [2]"));
        assert!(message.contains("unknown settings [extra]"));

        let settings = ChunkingSettings::from_map(Some(map(json!({
            "strategy": "word",
            "max_chunk_size": 10,
            "overlap": 5
        }))))
        .unwrap();
        assert_eq!(
            settings,
            ChunkingSettings::Word {
                max_chunk_size: 10,
                overlap: 5
            }
        );
    }

    #[test]
    fn sentence_overlap_must_be_zero_or_one() {
        let err = ChunkingSettings::from_map(Some(map(json!({
            "strategy": "sentence",
            "max_chunk_size": 20,
            "sentence_overlap": 2
        }))))
        .unwrap_err();
        assert!(err.to_string().contains("[sentence_overlap] must be 0 or 1"));
    }

    #[test]
    fn word_chunker_overlaps_and_covers_the_text() {
        let text = "one two three four five six seven";
        let chunks = WordBoundaryChunker {
            max_chunk_size: 3,
            overlap: 1,
        }
        .chunk(text);

        assert_eq!(
            texts(text, &chunks),
            vec!["one two three", "three four five", "five six seven"]
        );
        assert_eq!(chunks.first().unwrap().start, 0);
        assert_eq!(chunks.last().unwrap().end, text.len());
    }

    #[test]
    fn sentence_chunker_packs_sentences_within_budget() {
        let text = "Alpha beta. Gamma delta. Epsilon zeta eta.";
        let chunks = SentenceBoundaryChunker {
            max_chunk_size: 4,
            sentence_overlap: 0,
        }
        .chunk(text);
        assert_eq!(
            texts(text, &chunks),
            vec!["Alpha beta. Gamma delta.", "Epsilon zeta eta."]
        );
    }

    #[test]
    fn sentence_chunker_repeats_one_sentence_when_overlapping() {
        let text = "A b. C d. E f.";
        let chunks = SentenceBoundaryChunker {
            max_chunk_size: 4,
            sentence_overlap: 1,
        }
        .chunk(text);
        assert_eq!(texts(text, &chunks), vec!["A b. C d.", "C d. E f."]);
    }

    #[test]
    fn blank_text_is_a_single_chunk() {
        for settings in [
            ChunkingSettings::default(),
            ChunkingSettings::LEGACY_DEFAULT,
            ChunkingSettings::None,
        ] {
            assert_eq!(
                settings.chunker().chunk("   "),
                vec![ChunkOffset { start: 0, end: 3 }]
            );
        }
    }
}
