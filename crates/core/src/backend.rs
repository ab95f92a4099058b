//! Completion backend seam.
//!
//! The engine only ever sees this trait; the HTTP implementations live in
//! the adapters crate, and tests script the trait directly.

use crate::provider::ProviderHandle;
use std::error::Error as StdError;
use std::fmt;

/// Opaque error produced by a completion backend.
#[derive(Debug)]
pub struct BackendError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl BackendError {
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

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for BackendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// A text-completion backend addressed by a resolved [`ProviderHandle`].
pub trait CompletionBackend: Send + Sync {
    fn complete(&self, handle: &ProviderHandle, prompt: &str) -> Result<String, BackendError>;
}
