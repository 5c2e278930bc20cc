//! Client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Transient failures (429, 5xx, transport) are retried per [`RetryConfig`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{LlmError, RetryConfig};
use super::TextGenerator;

const SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry_config: RetryConfig,
}

impl OpenAiClient {
    /// Create a client with the default retry configuration.
    /// Without an API key every call fails with `NotConfigured`.
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self::with_retry_config(base_url, api_key, RetryConfig::default())
    }

    pub fn with_retry_config(
        base_url: &str,
        api_key: Option<String>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            retry_config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// One round trip. Non-success statuses carry their `Retry-After`.
    async fn complete_once(
        &self,
        api_key: &str,
        request: &ChatRequest<'_>,
    ) -> Result<String, LlmError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let retry_after = retry_after_secs(response.headers());
        let body = response.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &body, retry_after));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::malformed(format!("{} in body {}", e, body)))?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::malformed("response carried no message content"))
    }
}

/// `Retry-After` in its delta-seconds form; HTTP dates are ignored.
fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, prompt: &'a str) -> Self {
        Self {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, prompt: &str, model: &str) -> Result<String, LlmError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(LlmError::not_configured("OPENAI_API_KEY is not set"));
        };
        let request = &ChatRequest::new(model, prompt);
        self.retry_config
            .run("openai", move || self.complete_once(api_key, request))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmErrorKind;

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let client = OpenAiClient::new("https://api.openai.com/v1", None);
        assert!(!client.is_configured());
        let err = client
            .generate("hi", "gpt-4o")
            .await
            .expect_err("no api key");
        assert_eq!(err.kind, LlmErrorKind::NotConfigured);
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest::new("gpt-4o-mini", "Explain Rust lifetimes");
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], SYSTEM_PROMPT);
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["messages"][1]["content"], "Explain Rust lifetimes");
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(retry_after_secs(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().expect("header"));
        assert_eq!(retry_after_secs(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().expect("header"),
        );
        assert_eq!(retry_after_secs(&headers), None);
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hi!"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(body).expect("parse");
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Hi!"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_gives_up_without_retries() {
        let client = OpenAiClient::with_retry_config(
            "http://127.0.0.1:9/v1",
            Some("key".to_string()),
            RetryConfig::disabled(),
        );
        let err = client.generate("hi", "gpt-4o").await.expect_err("no server");
        assert_eq!(err.kind, LlmErrorKind::Transport);
    }
}
