//! Model backend contract and an HTTP implementation for the supported
//! providers.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tabula_core::config::{LlmConfig, LlmProvider};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self { max_tokens: 512, temperature: 0.0 }
    }
}

impl CompletionOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Ordered, append-only sequence of text chunks from a streaming call.
pub struct ThoughtStream {
    receiver: mpsc::UnboundedReceiver<String>,
    received: String,
}

impl ThoughtStream {
    pub fn channel() -> (mpsc::UnboundedSender<String>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self { receiver, received: String::new() })
    }

    /// Replays an already complete response word by word.
    pub fn from_text(text: &str) -> Self {
        let (sender, stream) = Self::channel();
        for chunk in text.split_inclusive(char::is_whitespace) {
            if sender.send(chunk.to_string()).is_err() {
                break;
            }
        }
        stream
    }

    pub async fn next_chunk(&mut self) -> Option<String> {
        let chunk = self.receiver.recv().await?;
        self.received.push_str(&chunk);
        Some(chunk)
    }

    /// Text received so far; always displayable.
    pub fn partial(&self) -> &str {
        &self.received
    }

    /// Drains the stream until it closes or `deadline` passes, returning
    /// whatever arrived.
    pub async fn collect_partial(mut self, deadline: Duration) -> String {
        let _ = tokio::time::timeout(deadline, async {
            while self.next_chunk().await.is_some() {}
        })
        .await;
        self.received
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;

    async fn stream(&self, prompt: &str, options: &CompletionOptions) -> Result<ThoughtStream> {
        let text = self.complete(prompt, options).await?;
        Ok(ThoughtStream::from_text(&text))
    }

    fn model_name(&self) -> &str;
}

/// Runs `complete` under a deadline; an elapsed deadline is an error like any
/// other backend failure.
pub async fn complete_within(
    client: &dyn LlmClient,
    prompt: &str,
    options: &CompletionOptions,
    deadline: Duration,
) -> Result<String> {
    tokio::time::timeout(deadline, client.complete(prompt, options))
        .await
        .map_err(|_| anyhow!("model call timed out after {}s", deadline.as_secs()))?
}

pub struct HttpLlmClient {
    provider: LlmProvider,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, LlmProvider::OpenAi) => "https://api.openai.com".to_string(),
            (None, LlmProvider::Anthropic) => "https://api.anthropic.com".to_string(),
            (None, LlmProvider::Ollama) => "http://localhost:11434".to_string(),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            provider: config.provider,
            api_key: config.api_key.clone(),
            base_url,
            model: config.model.clone(),
            client,
        })
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_ref()
            .map(|key| key.expose_secret())
            .ok_or_else(|| anyhow!("llm.api_key is not configured"))
    }

    async fn call_openai(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        #[derive(Deserialize)]
        struct Message {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            choices: Vec<Choice>,
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.api_key()?)
            .json(&serde_json::json!({
                "model": &self.model,
                "max_tokens": options.max_tokens,
                "temperature": options.temperature,
                "messages": [{"role": "user", "content": prompt}]
            }))
            .send()
            .await?;
        let response = check_status(response, "OpenAI").await?;
        let body: ApiResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("empty response from OpenAI"))
    }

    async fn call_anthropic(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        #[derive(Deserialize)]
        struct ContentBlock {
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", "2023-06-01")
            .json(&serde_json::json!({
                "model": &self.model,
                "max_tokens": options.max_tokens,
                "temperature": options.temperature,
                "messages": [{"role": "user", "content": prompt}]
            }))
            .send()
            .await?;
        let response = check_status(response, "Anthropic").await?;
        let body: ApiResponse = response.json().await?;
        body.content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow!("empty response from Anthropic"))
    }

    async fn call_ollama(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        #[derive(Deserialize)]
        struct ApiResponse {
            response: String,
        }

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&serde_json::json!({
                "model": &self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "num_predict": options.max_tokens,
                    "temperature": options.temperature
                }
            }))
            .send()
            .await?;
        let response = check_status(response, "Ollama").await?;
        let body: ApiResponse = response.json().await?;
        Ok(body.response)
    }
}

async fn check_status(response: reqwest::Response, provider: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!("{provider} API error {status}: {body}"))
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        tracing::debug!(
            event_name = "llm.request",
            provider = ?self.provider,
            model = %self.model,
            max_tokens = options.max_tokens,
            "sending completion request"
        );
        match self.provider {
            LlmProvider::OpenAi => self.call_openai(prompt, options).await,
            LlmProvider::Anthropic => self.call_anthropic(prompt, options).await,
            LlmProvider::Ollama => self.call_ollama(prompt, options).await,
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tabula_core::config::{LlmConfig, LlmProvider};

    use super::{HttpLlmClient, LlmClient, ThoughtStream};

    #[tokio::test]
    async fn replayed_stream_preserves_order() {
        let mut stream = ThoughtStream::from_text("look at the totals first");
        assert_eq!(stream.next_chunk().await.as_deref(), Some("look "));
        assert_eq!(stream.partial(), "look ");
        let rest = stream.collect_partial(Duration::from_millis(50)).await;
        assert_eq!(rest, "look at the totals first");
    }

    #[tokio::test]
    async fn cancelled_stream_keeps_partial_text() {
        let (sender, stream) = ThoughtStream::channel();
        sender.send("checking ".to_string()).expect("open channel");
        sender.send("columns".to_string()).expect("open channel");

        let partial = stream.collect_partial(Duration::from_millis(20)).await;
        assert_eq!(partial, "checking columns");
        drop(sender);
    }

    #[test]
    fn client_defaults_base_url_per_provider() {
        let config = LlmConfig {
            provider: LlmProvider::OpenAi,
            api_key: Some("sk-test".to_string().into()),
            base_url: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 5,
            max_tokens: 256,
        };
        let client = HttpLlmClient::from_config(&config).expect("client builds");
        assert_eq!(client.base_url, "https://api.openai.com");
        assert_eq!(client.model_name(), "gpt-4o-mini");
    }
}
