//! LLM provider adapter contract.
//!
//! The runtime specifies providers only by this request/response contract;
//! concrete provider wiring lives outside the core. The bundled
//! [`HttpProviderAdapter`] speaks the contract over HTTP with retry and
//! backoff, honoring `Retry-After` on 429/5xx the way a well-behaved client
//! should.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::error::Result;
use crate::error::RyeErr;
use crate::flags::RYE_REQUEST_MAX_RETRIES;
use crate::util::backoff;

/// One message in the provider conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ProviderMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// The provider's reply for one turn, with usage. A reply without tool
/// calls is terminal for the thread loop.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub spend: f64,
}

/// The seam the thread runner drives. Implementations own transport,
/// authentication, and model selection.
pub trait ProviderAdapter: Send + Sync {
    fn model(&self) -> &str;

    fn create_completion(
        &self,
        messages: &[ProviderMessage],
        tools: &[Value],
    ) -> impl Future<Output = Result<CompletionResponse>> + Send;
}

#[derive(Debug, Serialize)]
struct CompletionPayload<'a> {
    model: &'a str,
    messages: &'a [ProviderMessage],
    tools: &'a [Value],
    stream: bool,
}

/// HTTP implementation of the provider contract.
pub struct HttpProviderAdapter {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpProviderAdapter {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    async fn post_once(
        &self,
        payload: &CompletionPayload<'_>,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut builder = self.client.post(&self.endpoint).json(payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.send().await
    }
}

impl ProviderAdapter for HttpProviderAdapter {
    fn model(&self) -> &str {
        &self.model
    }

    async fn create_completion(
        &self,
        messages: &[ProviderMessage],
        tools: &[Value],
    ) -> Result<CompletionResponse> {
        let payload = CompletionPayload {
            model: &self.model,
            messages,
            tools,
            stream: false,
        };
        trace!(
            "completion payload: {}",
            serde_json::to_string(&payload).unwrap_or_default()
        );

        let max_retries = *RYE_REQUEST_MAX_RETRIES;
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.post_once(&payload).await {
                Ok(response) if response.status().is_success() => {
                    let completion: CompletionResponse = response.json().await?;
                    debug!(
                        model = %self.model,
                        tool_calls = completion.tool_calls.len(),
                        "completion received"
                    );
                    return Ok(completion);
                }
                Ok(response) => {
                    let status = response.status();
                    // Non-retryable statuses bubble with the body so callers
                    // see the server's exact message.
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = response.text().await.unwrap_or_default();
                        return Err(RyeErr::UnexpectedStatus(status, body));
                    }
                    if attempt > max_retries {
                        return Err(RyeErr::RetryLimit(status));
                    }
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let delay = retry_after.unwrap_or_else(|| backoff(attempt));
                    warn!(%status, attempt, ?delay, "provider error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > max_retries {
                        return Err(e.into());
                    }
                    let delay = backoff(attempt);
                    warn!(attempt, ?delay, "provider transport error, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;

    #[tokio::test]
    async fn parses_completion_with_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "text": "Running the tool now.",
                "tool_calls": [
                    {"id": "call-1", "name": "rye_execute", "input": {"item_id": "x"}}
                ],
                "input_tokens": 120,
                "output_tokens": 30,
                "spend": 0.004,
            })))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(server.uri(), "standard-1", None);
        let completion = adapter
            .create_completion(&[ProviderMessage::user("go")], &[])
            .await
            .unwrap();
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "rye_execute");
        assert_eq!(completion.input_tokens, 120);
    }

    #[tokio::test]
    async fn client_error_bubbles_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unknown parameter: x"))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(server.uri(), "standard-1", None);
        let err = adapter
            .create_completion(&[ProviderMessage::user("go")], &[])
            .await
            .unwrap_err();
        match err {
            RyeErr::UnexpectedStatus(status, body) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("unknown parameter"));
            }
            other => panic!("expected UnexpectedStatus, got {other}"),
        }
    }

    #[tokio::test]
    async fn server_error_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "done"})))
            .mount(&server)
            .await;

        let adapter = HttpProviderAdapter::new(server.uri(), "standard-1", None);
        let completion = adapter
            .create_completion(&[ProviderMessage::user("go")], &[])
            .await
            .unwrap();
        assert_eq!(completion.text, "done");
        assert!(completion.tool_calls.is_empty());
    }
}
