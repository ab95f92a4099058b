mod base_url;
mod embedding;
mod error;
mod llm;
mod retry;

pub use base_url::ensure_v1;
pub use embedding::HttpEmbedder;
pub use error::AdapterError;
pub use llm::{chat_base_url, HttpCompletionBackend};
pub use retry::{call_with_retry, RetryConfig};

pub use fabula_core::backend::{BackendError, CompletionBackend};
pub use fabula_core::provider::{ProviderHandle, ProviderScheme};
pub use fabula_core::retrieval::{Embedder, EmbedderError};
