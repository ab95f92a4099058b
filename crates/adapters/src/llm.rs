use std::env;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};

use fabula_core::backend::{BackendError, CompletionBackend};
use fabula_core::provider::{ProviderHandle, ProviderScheme};

use crate::base_url::ensure_v1;
use crate::error::AdapterError;
use crate::retry::{call_with_retry, RetryConfig};

const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Chat completion backend speaking the OpenAI-compatible wire protocol.
///
/// One instance serves every scheme: the handle passed to each call decides
/// the endpoint and credential, so distinct workflow stages can route to
/// distinct providers through the same backend.
pub struct HttpCompletionBackend {
    client: Client,
    retry: RetryConfig,
    max_tokens: Option<u32>,
    temperature: f32,
    system_prompt: Option<String>,
}

impl HttpCompletionBackend {
    pub fn new() -> Result<Self, AdapterError> {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(timeout_secs: u64) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            retry: RetryConfig::default(),
            max_tokens: None,
            temperature: 0.7,
            system_prompt: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = if max_tokens == 0 {
            None
        } else {
            Some(max_tokens)
        };
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    fn invoke_once(&self, handle: &ProviderHandle, prompt: &str) -> Result<String, AdapterError> {
        let mut messages: Vec<ChatMessageRequest<'_>> = Vec::new();
        if let Some(system) = self.system_prompt.as_deref() {
            messages.push(ChatMessageRequest {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessageRequest {
            role: "user",
            content: prompt,
        });

        let body = ChatCompletionRequest {
            model: handle.model(),
            messages,
            max_tokens: self.max_tokens,
            temperature: Some(self.temperature),
        };

        let url = format!("{}/chat/completions", chat_base_url(handle));
        let mut request = self.client.post(&url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if let Some(key) = credential(handle)? {
            request = request.bearer_auth(key);
        }

        let response = request.json(&body).send()?;
        handle_chat_response(response)
    }
}

impl CompletionBackend for HttpCompletionBackend {
    fn complete(&self, handle: &ProviderHandle, prompt: &str) -> Result<String, BackendError> {
        call_with_retry(|| self.invoke_once(handle, prompt), &self.retry)
            .map_err(BackendError::new)
    }
}

/// OpenAI-compatible base URL for a resolved handle. A host in the handle
/// overrides the scheme default and is addressed over plain http, the
/// local-deployment case the override exists for.
pub fn chat_base_url(handle: &ProviderHandle) -> String {
    if let Some(host) = handle.host() {
        let authority = match handle.port().or(default_port(handle.scheme())) {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        return ensure_v1(&format!("http://{authority}"));
    }
    match handle.scheme() {
        ProviderScheme::OpenAi => "https://api.openai.com/v1".to_string(),
        ProviderScheme::OpenRouter => "https://openrouter.ai/api/v1".to_string(),
        ProviderScheme::Ollama => "http://localhost:11434/v1".to_string(),
        ProviderScheme::LmStudio => "http://localhost:1234/v1".to_string(),
    }
}

fn default_port(scheme: ProviderScheme) -> Option<u16> {
    match scheme {
        ProviderScheme::Ollama => Some(11434),
        ProviderScheme::LmStudio => Some(1234),
        ProviderScheme::OpenAi | ProviderScheme::OpenRouter => None,
    }
}

pub(crate) fn credential(handle: &ProviderHandle) -> Result<Option<String>, AdapterError> {
    let Some(var) = handle.scheme().credential_var() else {
        return Ok(None);
    };
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
        _ => Err(AdapterError::MissingCredential {
            scheme: handle.scheme().to_string(),
            var: var.to_string(),
        }),
    }
}

fn handle_chat_response(response: reqwest::blocking::Response) -> Result<String, AdapterError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        return Err(AdapterError::HttpStatus { status, body });
    }

    let parsed: ChatCompletionResponse = response.json()?;
    extract_choice_content(parsed).ok_or(AdapterError::EmptyResponse)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    // Some local servers put the text directly on the choice.
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn extract_choice_content(response: ChatCompletionResponse) -> Option<String> {
    for choice in response.choices {
        if let Some(message) = choice.message {
            if let Some(content) = message.content {
                if !content.trim().is_empty() {
                    return Some(content);
                }
            }
        }
        if let Some(content) = choice.content {
            if !content.trim().is_empty() {
                return Some(content);
            }
        }
    }
    None
}
