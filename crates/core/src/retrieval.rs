//! Retrieval-augmented context.
//!
//! A [`RetrievalIndex`] is built once per session from a directory of
//! plain-text/markdown files, holding one embedding vector per bounded-size
//! chunk. Queries rank chunks by cosine similarity, filter by a threshold,
//! and truncate to a token budget. Every failure mode degrades to "no
//! retrieval context" rather than an error: generation proceeds unmodified
//! when no knowledge base is configured, when the directory is missing, or
//! when the embedding backend misbehaves.

use crate::logging::{LogEvent, LogLevel, LogSink};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Opaque error produced by an embedding backend.
#[derive(Debug)]
pub struct EmbedderError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl EmbedderError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            inner: message.into().into(),
        }
    }
}

impl fmt::Display for EmbedderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for EmbedderError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Black-box vector embedding backend.
pub trait Embedder: Send + Sync {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut vectors = self.embed_batch(&[text.to_string()])?;
        vectors
            .pop()
            .ok_or_else(|| EmbedderError::message("embedding backend returned no vectors"))
    }
}

fn default_chunk_chars() -> usize {
    500
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum characters per indexed chunk.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Chunk {
    pub text: String,
    pub vector: Vec<f32>,
    pub source: String,
}

/// Read-only similarity index over a knowledge-base directory.
pub struct RetrievalIndex {
    chunks: Vec<Chunk>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl RetrievalIndex {
    /// An index that answers every query with nothing.
    pub fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            embedder: None,
        }
    }

    /// Chunks and embeds every `.txt`/`.md` file under `dir`.
    ///
    /// Yields an empty index when `dir` is `None`, missing, or empty, and
    /// when the embedding backend fails; the sink gets a warning in the
    /// failure cases.
    pub fn build(
        dir: Option<&Path>,
        embedder: Option<Arc<dyn Embedder>>,
        config: RetrievalConfig,
        sink: &dyn LogSink,
    ) -> Self {
        let (Some(dir), Some(embedder)) = (dir, embedder) else {
            return Self::empty();
        };

        let segments = match collect_segments(dir, config.chunk_chars) {
            Ok(segments) => segments,
            Err(message) => {
                sink.emit(LogEvent::new(
                    LogLevel::Warn,
                    format!("knowledge base unavailable, continuing without retrieval: {message}"),
                ));
                return Self::empty();
            }
        };
        if segments.is_empty() {
            return Self::empty();
        }

        let texts: Vec<String> = segments.iter().map(|(text, _)| text.clone()).collect();
        let vectors = match embedder.embed_batch(&texts) {
            Ok(vectors) if vectors.len() == texts.len() => vectors,
            Ok(_) => {
                sink.emit(LogEvent::new(
                    LogLevel::Warn,
                    "embedding backend returned a mismatched vector count, continuing without retrieval",
                ));
                return Self::empty();
            }
            Err(err) => {
                sink.emit(LogEvent::new(
                    LogLevel::Warn,
                    format!("embedding failed while indexing, continuing without retrieval: {err}"),
                ));
                return Self::empty();
            }
        };

        let chunks = segments
            .into_iter()
            .zip(vectors)
            .map(|((text, source), vector)| Chunk {
                text,
                vector,
                source,
            })
            .collect();

        Self {
            chunks,
            embedder: Some(embedder),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks ranked by similarity to `query`, filtered by
    /// `min_similarity`, capped at `top_k` results and `max_tokens` total
    /// budget. An empty index, an unconfigured embedder, or an embedding
    /// failure all return an empty sequence.
    pub fn query(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f32,
        max_tokens: usize,
    ) -> Vec<String> {
        if self.chunks.is_empty() || top_k == 0 || max_tokens == 0 {
            return Vec::new();
        }
        let Some(embedder) = &self.embedder else {
            return Vec::new();
        };
        let Ok(query_vector) = embedder.embed_one(query) else {
            return Vec::new();
        };

        let mut scored: Vec<(f32, &Chunk)> = self
            .chunks
            .iter()
            .map(|chunk| (cosine_similarity(&query_vector, &chunk.vector), chunk))
            .filter(|(score, _)| *score >= min_similarity)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut results = Vec::new();
        let mut budget = max_tokens;
        for (_, chunk) in scored.into_iter().take(top_k) {
            let cost = approximate_tokens(&chunk.text);
            if cost > budget {
                break;
            }
            budget -= cost;
            results.push(chunk.text.clone());
        }
        results
    }
}

/// Rough token estimate used for the query budget: four characters per
/// token, rounded up.
pub fn approximate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4).max(1)
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn collect_segments(dir: &Path, chunk_chars: usize) -> Result<Vec<(String, String)>, String> {
    if !dir.is_dir() {
        return Err(format!("`{}` is not a directory", dir.display()));
    }

    let mut paths = Vec::new();
    let entries = fs::read_dir(dir).map_err(|err| format!("{}: {err}", dir.display()))?;
    for entry in entries {
        let entry = entry.map_err(|err| format!("{}: {err}", dir.display()))?;
        let path = entry.path();
        let is_text = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "txt" | "md"));
        if path.is_file() && is_text {
            paths.push(path);
        }
    }
    paths.sort();

    let mut segments = Vec::new();
    for path in paths {
        let contents = fs::read_to_string(&path).map_err(|err| format!("{}: {err}", path.display()))?;
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        for segment in split_segments(&contents, chunk_chars) {
            segments.push((segment, source.clone()));
        }
    }
    Ok(segments)
}

/// Splits text into segments of at most `max_chars` characters, preferring
/// sentence boundaries, then paragraph breaks, then a hard length split.
pub fn split_segments(text: &str, max_chars: usize) -> Vec<String> {
    if text.trim().is_empty() || max_chars == 0 {
        return Vec::new();
    }

    let mut pieces = split_sentences(text);
    if pieces.iter().all(|piece| piece.trim().is_empty()) {
        pieces = text.split('\n').map(str::to_string).collect();
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }

        let piece_len = piece.chars().count();
        if piece_len > max_chars {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            segments.extend(hard_split(piece, max_chars));
            continue;
        }

        let current_len = current.chars().count();
        let joined_len = if current.is_empty() {
            piece_len
        } else {
            current_len + 1 + piece_len
        };
        if joined_len > max_chars && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece);
    }
    if !current.trim().is_empty() {
        segments.push(current.trim().to_string());
    }
    segments
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut buffer = String::new();
    for ch in text.chars() {
        buffer.push(ch);
        if matches!(ch, '.' | '!' | '?' | ';') {
            sentences.push(std::mem::take(&mut buffer));
        }
    }
    if !buffer.trim().is_empty() {
        sentences.push(buffer);
    }
    sentences
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect::<String>().trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}
