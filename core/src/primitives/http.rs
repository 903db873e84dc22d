//! HTTP sync primitive: one-shot requests with retry and auth.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::env::resolve_var_refs;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResult {
    pub success: bool,
    pub status_code: u16,
    pub body: Value,
    pub headers: HashMap<String, String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub stream_events_count: Option<u64>,
    pub stream_destinations: Option<Vec<String>>,
}

impl HttpResult {
    pub fn to_json(&self) -> Value {
        let mut out = serde_json::json!({
            "success": self.success,
            "status_code": self.status_code,
            "body": self.body,
            "headers": self.headers,
            "duration_ms": self.duration_ms,
        });
        if let Some(error) = &self.error {
            out["error"] = Value::String(error.clone());
        }
        if let Some(count) = self.stream_events_count {
            out["stream_events_count"] = Value::from(count);
        }
        if let Some(dests) = &self.stream_destinations {
            out["stream_destinations"] = serde_json::to_value(dests).unwrap_or(Value::Null);
        }
        out
    }

    pub(crate) fn failed(error: String, started: Instant) -> HttpResult {
        HttpResult {
            success: false,
            status_code: 0,
            body: Value::Null,
            headers: HashMap::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(error),
            stream_events_count: None,
            stream_destinations: None,
        }
    }
}

pub struct HttpPrimitive {
    client: reqwest::Client,
}

impl Default for HttpPrimitive {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpPrimitive {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Execute a one-shot request. `success` iff `200 <= status < 400`.
    pub async fn execute(&self, config: &Value, params: &Value) -> HttpResult {
        let started = Instant::now();

        let request = match build_request(config, params) {
            Ok(request) => request,
            Err(e) => return HttpResult::failed(e, started),
        };

        let retry = config.get("retry").cloned().unwrap_or(Value::Null);
        let max_attempts = retry
            .get("max_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1);
        let backoff = retry
            .get("backoff")
            .and_then(Value::as_str)
            .unwrap_or("exponential")
            .to_string();

        let mut last_error = String::new();
        for attempt in 0..max_attempts {
            let outcome = self
                .send_once(&request)
                .await;
            match outcome {
                Ok(result) => return finalize(result, started).await,
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 == max_attempts {
                        break;
                    }
                    let delay = if backoff == "fixed" {
                        Duration::from_secs(1)
                    } else {
                        Duration::from_secs(1 << attempt)
                    };
                    debug!(attempt, ?delay, "http retry after transport error");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        HttpResult::failed(
            format!("Request failed after {max_attempts} attempts: {last_error}"),
            started,
        )
    }

    async fn send_once(
        &self,
        request: &PreparedRequest,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder.send().await
    }
}

pub(crate) struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

/// Resolve env refs in URL and headers, apply the auth block, and template
/// the URL with runtime parameters.
pub(crate) fn build_request(
    config: &Value,
    params: &Value,
) -> std::result::Result<PreparedRequest, String> {
    let env: HashMap<String, String> = std::env::vars().collect();

    let method_str = config
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_uppercase();
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| format!("invalid method: {method_str}"))?;

    let url = config
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| "url is required in config".to_string())?;
    let url = resolve_var_refs(url, &env);
    let url = template_url(&url, params);

    let mut headers: HashMap<String, String> = HashMap::new();
    if let Some(declared) = config.get("headers").and_then(Value::as_object) {
        for (key, value) in declared {
            let raw = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            headers.insert(key.clone(), resolve_var_refs(&raw, &env));
        }
    }

    if let Some(auth) = config.get("auth").and_then(Value::as_object) {
        match auth.get("type").and_then(Value::as_str) {
            Some("bearer") => {
                let token = auth.get("token").and_then(Value::as_str).unwrap_or_default();
                headers.insert(
                    "Authorization".to_string(),
                    format!("Bearer {}", resolve_var_refs(token, &env)),
                );
            }
            Some("api_key") => {
                let key = auth.get("key").and_then(Value::as_str).unwrap_or_default();
                let header = auth
                    .get("header")
                    .and_then(Value::as_str)
                    .unwrap_or("X-API-Key");
                headers.insert(header.to_string(), resolve_var_refs(key, &env));
            }
            _ => {}
        }
    }

    let body = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        config.get("body").cloned().filter(|b| !b.is_null())
    } else {
        None
    };

    let timeout = Duration::from_secs(config.get("timeout").and_then(Value::as_u64).unwrap_or(30));

    Ok(PreparedRequest {
        method,
        url,
        headers,
        body,
        timeout,
    })
}

fn template_url(url: &str, params: &Value) -> String {
    let mut result = url.to_string();
    if let Some(map) = params.as_object() {
        for (key, value) in map {
            let needle = format!("{{{key}}}");
            if result.contains(&needle) {
                let rendered = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                result = result.replace(&needle, &rendered);
            }
        }
    }
    result
}

async fn finalize(response: reqwest::Response, started: Instant) -> HttpResult {
    let status = response.status();
    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

    let success = status.as_u16() >= 200 && status.as_u16() < 400;
    HttpResult {
        success,
        status_code: status.as_u16(),
        body,
        headers,
        duration_ms: started.elapsed().as_millis() as u64,
        error: (!success).then(|| format!("HTTP {}", status)),
        stream_events_count: None,
        stream_destinations: None,
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
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    #[tokio::test]
    async fn get_with_params_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items/42"))
            .and(header("Authorization", "Bearer sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
            .mount(&server)
            .await;

        let config = json!({
            "method": "GET",
            "url": format!("{}/items/{{id}}", server.uri()),
            "auth": {"type": "bearer", "token": "sekrit"},
        });
        let result = HttpPrimitive::new()
            .execute(&config, &json!({"id": 42}))
            .await;
        assert!(result.success);
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body, json!({"id": 42}));
    }

    #[tokio::test]
    async fn non_2xx_is_failure_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let config = json!({"url": server.uri()});
        let result = HttpPrimitive::new().execute(&config, &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.status_code, 503);
        assert_eq!(result.body, json!("overloaded"));
        assert!(result.error.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn redirect_class_counts_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        let result = HttpPrimitive::new()
            .execute(&json!({"url": server.uri()}), &json!({}))
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn missing_url_is_an_error() {
        let result = HttpPrimitive::new().execute(&json!({}), &json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("url is required in config"));
    }

    #[tokio::test]
    async fn api_key_auth_uses_custom_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Custom-Key", "k123"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        let config = json!({
            "method": "POST",
            "url": server.uri(),
            "body": {"x": 1},
            "auth": {"type": "api_key", "key": "k123", "header": "X-Custom-Key"},
        });
        let result = HttpPrimitive::new().execute(&config, &json!({})).await;
        assert!(result.success);
        assert_eq!(result.status_code, 201);
    }
}
