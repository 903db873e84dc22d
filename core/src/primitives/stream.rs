//! HTTP/SSE streaming primitive with destination fan-out.
//!
//! Opens a streaming response, reads `data:` lines, and fans each event out
//! to every supplied sink concurrently. A `return` sink buffers events (to
//! a size cap) and becomes the result body on close.

use std::collections::HashMap;
use std::time::Instant;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::primitives::http::HttpPrimitive;
use crate::primitives::http::HttpResult;
use crate::primitives::http::build_request;

pub const DEFAULT_BUFFER_CAP: usize = 10_000;

/// Where streamed events go. Sinks receive every event concurrently.
pub trait StreamSink: Send + Sync {
    fn name(&self) -> String;
    /// Deliver one event. Errors are logged, not fatal to the stream.
    fn write<'a>(
        &'a self,
        event: &'a str,
    ) -> std::pin::Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send + 'a>>;
    fn close<'a>(
        &'a self,
    ) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Buffers events for inclusion in the result body.
pub struct ReturnSink {
    buffer: Mutex<Vec<String>>,
    cap: usize,
}

impl ReturnSink {
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            cap,
        }
    }

    pub async fn events(&self) -> Vec<String> {
        self.buffer.lock().await.clone()
    }
}

impl Default for ReturnSink {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAP)
    }
}

impl StreamSink for ReturnSink {
    fn name(&self) -> String {
        "return".to_string()
    }

    fn write<'a>(
        &'a self,
        event: &'a str,
    ) -> std::pin::Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() < self.cap {
                buffer.push(event.to_string());
            }
            Ok(())
        })
    }
}

impl HttpPrimitive {
    /// Execute a streaming request, fanning events out to `sinks`. When a
    /// [`ReturnSink`] is among them its buffered events become the body.
    pub async fn execute_stream(
        &self,
        config: &Value,
        params: &Value,
        sinks: &[&dyn StreamSink],
        return_sink: Option<&ReturnSink>,
    ) -> HttpResult {
        let started = Instant::now();

        let request = match build_request(config, params) {
            Ok(request) => request,
            Err(e) => return HttpResult::failed(e, started),
        };

        let mut builder = self
            .client()
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return HttpResult::failed(format!("stream request failed: {e}"), started),
        };

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let mut event_count: u64 = 0;
        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    event_count += 1;
                    // Fan out to every sink concurrently.
                    let writes = sinks.iter().map(|sink| {
                        let name = sink.name();
                        async move {
                            if let Err(e) = sink.write(data).await {
                                warn!(sink = name, "sink write failed: {e}");
                            }
                        }
                    });
                    futures::future::join_all(writes).await;
                }
                Err(e) => {
                    debug!("SSE stream ended with error: {e}");
                    break;
                }
            }
        }

        for sink in sinks {
            sink.close().await;
        }

        let body = match return_sink {
            Some(sink) => Value::Array(
                sink.events()
                    .await
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            ),
            None => Value::Null,
        };

        let success = status.as_u16() >= 200 && status.as_u16() < 400;
        HttpResult {
            success,
            status_code: status.as_u16(),
            body,
            headers,
            duration_ms: started.elapsed().as_millis() as u64,
            error: (!success).then(|| format!("HTTP {status}")),
            stream_events_count: Some(event_count),
            stream_destinations: Some(sinks.iter().map(|s| s.name()).collect()),
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

    struct CountingSink {
        seen: Mutex<Vec<String>>,
    }

    impl StreamSink for CountingSink {
        fn name(&self) -> String {
            "counting".to_string()
        }

        fn write<'a>(
            &'a self,
            event: &'a str,
        ) -> std::pin::Pin<
            Box<dyn Future<Output = std::result::Result<(), String>> + Send + 'a>,
        > {
            Box::pin(async move {
                self.seen.lock().await.push(event.to_string());
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn fans_out_to_all_sinks_and_buffers_return() {
        let server = MockServer::start().await;
        let sse_body = "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: {\"n\":3}\n\n";
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let return_sink = ReturnSink::default();
        let counting = CountingSink {
            seen: Mutex::new(Vec::new()),
        };
        let sinks: Vec<&dyn StreamSink> = vec![&return_sink, &counting];

        let result = HttpPrimitive::new()
            .execute_stream(&json!({"url": server.uri()}), &json!({}), &sinks, Some(&return_sink))
            .await;

        assert!(result.success);
        assert_eq!(result.stream_events_count, Some(3));
        assert_eq!(
            result.stream_destinations,
            Some(vec!["return".to_string(), "counting".to_string()])
        );
        assert_eq!(counting.seen.lock().await.len(), 3);
        assert_eq!(
            result.body,
            json!(["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"])
        );
    }

    #[tokio::test]
    async fn buffer_cap_is_respected() {
        let sink = ReturnSink::new(2);
        for i in 0..5 {
            sink.write(&format!("e{i}")).await.unwrap();
        }
        assert_eq!(sink.events().await, vec!["e0".to_string(), "e1".to_string()]);
    }
}
