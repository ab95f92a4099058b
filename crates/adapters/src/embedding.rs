use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};

use fabula_core::provider::{ProviderHandle, ProviderScheme};
use fabula_core::retrieval::{Embedder, EmbedderError};

use crate::error::AdapterError;
use crate::llm::{chat_base_url, credential};
use crate::retry::{call_with_retry, RetryConfig};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Embedding backend over HTTP. Ollama is addressed through its native
/// `/api/embed` endpoint; every other scheme uses the OpenAI-compatible
/// `/embeddings` route.
pub struct HttpEmbedder {
    client: Client,
    handle: ProviderHandle,
    retry: RetryConfig,
}

impl HttpEmbedder {
    pub fn new(handle: ProviderHandle) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            handle,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError> {
        let url = embed_url(&self.handle);
        let body = EmbeddingRequest {
            model: self.handle.model(),
            input: texts,
        };

        let mut request = self.client.post(&url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = credential(&self.handle)? {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(AdapterError::HttpStatus { status, body });
        }

        match self.handle.scheme() {
            ProviderScheme::Ollama => {
                let parsed: OllamaEmbedResponse = response.json()?;
                Ok(parsed.embeddings)
            }
            _ => {
                let parsed: OpenAiEmbedResponse = response.json()?;
                let mut rows = parsed.data;
                rows.sort_by_key(|row| row.index);
                Ok(rows.into_iter().map(|row| row.embedding).collect())
            }
        }
    }
}

impl Embedder for HttpEmbedder {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        call_with_retry(|| self.embed_once(texts), &self.retry).map_err(EmbedderError::new)
    }
}

fn embed_url(handle: &ProviderHandle) -> String {
    match handle.scheme() {
        ProviderScheme::Ollama => {
            let base = chat_base_url(handle);
            format!("{}/api/embed", base.trim_end_matches("/v1"))
        }
        _ => format!("{}/embeddings", chat_base_url(handle)),
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedResponse {
    #[serde(default)]
    data: Vec<OpenAiEmbedRow>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedRow {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_uses_the_native_endpoint() {
        let handle = ProviderHandle::resolve("ollama://nomic-embed-text").unwrap();
        assert_eq!(embed_url(&handle), "http://localhost:11434/api/embed");

        let handle = ProviderHandle::resolve("ollama://nomic-embed-text@10.0.0.2:11434").unwrap();
        assert_eq!(embed_url(&handle), "http://10.0.0.2:11434/api/embed");
    }

    #[test]
    fn openai_compatible_schemes_use_the_embeddings_route() {
        let handle = ProviderHandle::resolve("openai://text-embedding-3-small").unwrap();
        assert_eq!(embed_url(&handle), "https://api.openai.com/v1/embeddings");

        let handle = ProviderHandle::resolve("lmstudio://embedder@localhost:1234").unwrap();
        assert_eq!(embed_url(&handle), "http://localhost:1234/v1/embeddings");
    }

    #[test]
    fn openai_rows_are_reordered_by_index() {
        let parsed: OpenAiEmbedResponse = serde_json::from_str(
            r#"{"data":[{"index":1,"embedding":[2.0]},{"index":0,"embedding":[1.0]}]}"#,
        )
        .unwrap();
        let mut rows = parsed.data;
        rows.sort_by_key(|row| row.index);
        let vectors: Vec<Vec<f32>> = rows.into_iter().map(|row| row.embedding).collect();
        assert_eq!(vectors, vec![vec![1.0], vec![2.0]]);
    }
}
