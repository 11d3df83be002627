use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::http_client::build_http_client_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// OpenAI-compatible `/chat/completions` (OpenRouter by default).
    OpenRouter,
    /// Ollama's native `/api/chat`.
    Ollama,
}

impl LlmProvider {
    pub fn from_config_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => LlmProvider::Ollama,
            _ => LlmProvider::OpenRouter,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: LlmProvider,
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, api_url: String, api_key: String, model: String) -> Self {
        Self {
            provider,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client: build_http_client_with_timeout(Some(std::time::Duration::from_secs(120))),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let provider = LlmProvider::from_config_str(&config.provider);
        match provider {
            LlmProvider::Ollama => Self::new(
                provider,
                config.ollama_url.clone(),
                String::new(),
                config.ollama_model.clone(),
            ),
            LlmProvider::OpenRouter => Self::new(
                provider,
                config.api_url.clone(),
                config.api_key.clone().unwrap_or_default(),
                config.model.clone(),
            ),
        }
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one chat completion with `system` prepended to `messages`.
    ///
    /// A response without any content comes back as an empty string; callers
    /// treat that as "nothing to say" rather than an error.
    pub async fn chat(&self, system: &str, messages: &[Message]) -> Result<String> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        full.push(Message::system(system));
        full.extend_from_slice(messages);

        match self.provider {
            LlmProvider::OpenRouter => self.chat_openai(&full).await,
            LlmProvider::Ollama => self.chat_ollama(&full).await,
        }
    }

    async fn chat_openai(&self, messages: &[Message]) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
        };

        let mut req = self
            .client
            .post(&url)
            .json(&request)
            .header("X-Title", "murmur");

        // Local OpenAI-compatible servers run without a key.
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content.or(c.message.text))
            .unwrap_or_default())
    }

    async fn chat_ollama(&self, messages: &[Message]) -> Result<String> {
        let url = format!("{}/api/chat", self.api_url);
        let request = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send Ollama request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Ollama returned error {}: {}", status, body);
        }

        let parsed: OllamaChatResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response")?;

        Ok(parsed.message.map(|m| m.content).unwrap_or_default())
    }
}

/// Anything that can turn a system prompt plus history into one reply.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, messages: &[Message]) -> Result<String>;
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, system: &str, messages: &[Message]) -> Result<String> {
        self.chat(system, messages).await
    }
}

/// Parses a model reply as JSON, tolerating markdown code fences and chatter
/// around a single top-level object.
pub fn parse_json_reply<T>(response: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = response.find("```json") {
        let after_start = &response[start + 7..];
        match after_start.find("```") {
            Some(end) => after_start[..end].trim(),
            None => after_start.trim(),
        }
    } else if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if start < end {
            &response[start..=end]
        } else {
            response
        }
    } else {
        response
    };

    serde_json::from_str::<T>(json_content)
        .with_context(|| format!("Failed to parse JSON response. Raw response: {}", response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        value: u32,
    }

    #[test]
    fn provider_parsing_defaults_to_openrouter() {
        assert_eq!(LlmProvider::from_config_str("Ollama"), LlmProvider::Ollama);
        assert_eq!(LlmProvider::from_config_str("openrouter"), LlmProvider::OpenRouter);
        assert_eq!(LlmProvider::from_config_str("something"), LlmProvider::OpenRouter);
    }

    #[test]
    fn json_reply_accepts_plain_fenced_and_wrapped_forms() {
        let plain: Sample = parse_json_reply(r#"{"value": 1}"#).unwrap();
        assert_eq!(plain, Sample { value: 1 });

        let fenced: Sample = parse_json_reply("```json\n{\"value\": 2}\n```").unwrap();
        assert_eq!(fenced, Sample { value: 2 });

        let wrapped: Sample = parse_json_reply("sure! {\"value\": 3} hope that helps").unwrap();
        assert_eq!(wrapped, Sample { value: 3 });

        assert!(parse_json_reply::<Sample>("no json here").is_err());
    }

    #[test]
    fn completion_without_content_decodes_as_empty() {
        let raw = r#"{"choices": [{"message": {"role": "assistant"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content.or(c.message.text))
            .unwrap_or_default();
        assert!(content.is_empty());

        let raw = r#"{"choices": []}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.choices.is_empty());
    }

    #[test]
    fn from_config_picks_ollama_endpoint_and_model() {
        let mut config = LlmConfig::default();
        config.provider = "ollama".to_string();
        config.ollama_url = "http://ollama.local:11434/".to_string();
        let client = LlmClient::from_config(&config);
        assert_eq!(client.provider(), LlmProvider::Ollama);
        assert_eq!(client.model(), config.ollama_model);
        assert_eq!(client.api_url, "http://ollama.local:11434");
    }
}
