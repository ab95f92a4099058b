//! Provider URI resolution.
//!
//! A backend is addressed as `scheme://model[@host[:port]]`. Resolution is
//! pure: it validates the URI and produces an immutable [`ProviderHandle`],
//! leaving network client construction to invocation time so every handle
//! can be checked before a generation run starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderScheme {
    /// Cloud API (api.openai.com and compatible).
    OpenAi,
    /// Locally hosted server speaking the native Ollama protocol.
    Ollama,
    /// Locally hosted server speaking the OpenAI-compatible protocol.
    LmStudio,
    /// Proxy aggregator routing to many upstream models.
    OpenRouter,
}

impl ProviderScheme {
    pub const ALL: [ProviderScheme; 4] = [
        ProviderScheme::OpenAi,
        ProviderScheme::Ollama,
        ProviderScheme::LmStudio,
        ProviderScheme::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::LmStudio => "lmstudio",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            "lmstudio" => Some(Self::LmStudio),
            "openrouter" => Some(Self::OpenRouter),
            _ => None,
        }
    }

    /// Environment variable consulted for the API credential, when the
    /// scheme requires one.
    pub fn credential_var(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("FABULA_OPENAI_API_KEY"),
            Self::OpenRouter => Some("FABULA_OPENROUTER_API_KEY"),
            Self::Ollama | Self::LmStudio => None,
        }
    }
}

impl fmt::Display for ProviderScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderResolutionError {
    #[error("provider URI `{0}` is missing the `://` separator")]
    MissingSeparator(String),
    #[error("unknown provider scheme `{scheme}` in `{uri}`")]
    UnknownScheme { scheme: String, uri: String },
    #[error("provider URI `{0}` has an empty model name")]
    EmptyModel(String),
    #[error("provider URI `{0}` has an empty host after `@`")]
    EmptyHost(String),
    #[error("provider URI `{uri}` has an invalid port `{port}`")]
    InvalidPort { uri: String, port: String },
}

/// A resolved, validated reference to a generation backend and model.
///
/// Immutable once resolved. Distinct workflow stages may hold distinct
/// handles, so outline work and chapter drafting can run on different
/// backends.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProviderHandle {
    scheme: ProviderScheme,
    model: String,
    host: Option<String>,
    port: Option<u16>,
}

impl ProviderHandle {
    pub fn resolve(uri: &str) -> Result<Self, ProviderResolutionError> {
        let trimmed = uri.trim();
        let (scheme_text, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| ProviderResolutionError::MissingSeparator(trimmed.to_string()))?;

        let scheme = ProviderScheme::parse(scheme_text).ok_or_else(|| {
            ProviderResolutionError::UnknownScheme {
                scheme: scheme_text.to_string(),
                uri: trimmed.to_string(),
            }
        })?;

        let (model_text, endpoint) = match rest.split_once('@') {
            Some((model, endpoint)) => (model, Some(endpoint)),
            None => (rest, None),
        };

        if model_text.is_empty() {
            return Err(ProviderResolutionError::EmptyModel(trimmed.to_string()));
        }

        let (host, port) = match endpoint {
            None => (None, None),
            Some(endpoint) => {
                let (host_text, port) = match endpoint.rsplit_once(':') {
                    Some((host, port_text)) => {
                        let port: u16 = port_text.parse().map_err(|_| {
                            ProviderResolutionError::InvalidPort {
                                uri: trimmed.to_string(),
                                port: port_text.to_string(),
                            }
                        })?;
                        (host, Some(port))
                    }
                    None => (endpoint, None),
                };
                if host_text.is_empty() {
                    return Err(ProviderResolutionError::EmptyHost(trimmed.to_string()));
                }
                (Some(host_text.to_string()), port)
            }
        };

        Ok(Self {
            scheme,
            model: model_text.to_string(),
            host,
            port,
        })
    }

    pub fn scheme(&self) -> ProviderScheme {
        self.scheme
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.model)?;
        if let Some(host) = &self.host {
            write!(f, "@{host}")?;
            if let Some(port) = self.port {
                write!(f, ":{port}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bare_model() {
        let handle = ProviderHandle::resolve("openai://gpt-4o-mini").unwrap();
        assert_eq!(handle.scheme(), ProviderScheme::OpenAi);
        assert_eq!(handle.model(), "gpt-4o-mini");
        assert_eq!(handle.host(), None);
        assert_eq!(handle.port(), None);
    }

    #[test]
    fn resolves_host_and_port() {
        let handle = ProviderHandle::resolve("ollama://qwen2.5@192.168.1.4:11434").unwrap();
        assert_eq!(handle.scheme(), ProviderScheme::Ollama);
        assert_eq!(handle.host(), Some("192.168.1.4"));
        assert_eq!(handle.port(), Some(11434));
    }

    #[test]
    fn round_trips_valid_uris() {
        for uri in [
            "openai://gpt-4o",
            "openrouter://meta-llama/llama-3-70b",
            "lmstudio://local-model@localhost",
            "ollama://mistral@10.0.0.2:11434",
        ] {
            let handle = ProviderHandle::resolve(uri).unwrap();
            assert_eq!(handle.to_string(), uri);
        }
    }

    #[test]
    fn unknown_scheme_is_named_in_error() {
        let err = ProviderHandle::resolve("zeppelin://gpt-4o").unwrap_err();
        match err {
            ProviderResolutionError::UnknownScheme { scheme, .. } => {
                assert_eq!(scheme, "zeppelin");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_separator_fails() {
        assert!(matches!(
            ProviderHandle::resolve("openai:gpt-4o"),
            Err(ProviderResolutionError::MissingSeparator(_))
        ));
    }

    #[test]
    fn empty_model_fails() {
        assert!(matches!(
            ProviderHandle::resolve("openai://"),
            Err(ProviderResolutionError::EmptyModel(_))
        ));
        assert!(matches!(
            ProviderHandle::resolve("openai://@localhost"),
            Err(ProviderResolutionError::EmptyModel(_))
        ));
    }

    #[test]
    fn invalid_port_fails() {
        let err = ProviderHandle::resolve("ollama://m@host:70000").unwrap_err();
        assert!(matches!(err, ProviderResolutionError::InvalidPort { .. }));
    }

    #[test]
    fn serde_round_trip() {
        let handle = ProviderHandle::resolve("lmstudio://story-model@localhost:1234").unwrap();
        let json = serde_json::to_string(&handle).unwrap();
        let back: ProviderHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(handle, back);
    }
}
