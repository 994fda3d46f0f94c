//! Generic OpenAI-compatible upstream adapter.
//!
//! Works against any provider exposing the OpenAI chat completions wire
//! shape (`POST {base}/v1/chat/completions` with bearer auth), which is how
//! most hosted providers and aggregators are fronted. Model ids are
//! de-namespaced before dispatch: the upstream sees `gpt-4o`, not
//! `openai/gpt-4o`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use url::Url;

use crate::chat::{FinishReason, ModelRequest, StreamDelta, Usage};
use crate::errors::{Error, Result};

use super::{Completion, UpstreamAdapter};

pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl OpenAiCompatAdapter {
    pub fn new(base_url: Url, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    /// Strip the gateway's provider namespace from a model id.
    fn wire_model(model_id: &str) -> &str {
        model_id.split_once('/').map(|(_, name)| name).unwrap_or(model_id)
    }

    /// Translate a gateway request into the provider-native payload.
    fn to_wire(model_id: &str, req: &ModelRequest, stream: bool) -> serde_json::Value {
        let mut payload = serde_json::to_value(req).expect("request serializes");
        let object = payload.as_object_mut().expect("request is a JSON object");
        // Routing controls are gateway-internal
        object.remove("route");
        object.remove("fallbacks");
        object.insert(
            "model".to_string(),
            serde_json::Value::String(Self::wire_model(model_id).to_string()),
        );
        object.insert("stream".to_string(), serde_json::Value::Bool(stream));
        payload
    }

    fn request_builder(&self, model_id: &str, req: &ModelRequest, stream: bool, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .timeout(timeout)
            .json(&Self::to_wire(model_id, req, stream));
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {api_key}"));
        }
        builder
    }

    fn map_send_error(model_id: &str, timeout: Duration, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::UpstreamTimeout {
                model: model_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            Error::Upstream {
                model: model_id.to_string(),
                message: err.to_string(),
            }
        }
    }
}

fn parse_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("length") => FinishReason::Length,
        Some("function_call") => FinishReason::FunctionCall,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChunkChoice {
    delta: WireChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl UpstreamAdapter for OpenAiCompatAdapter {
    async fn available(&self, model_id: &str, timeout: Duration) -> bool {
        let mut builder = self.client.get(self.endpoint("/v1/models")).timeout(timeout);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {api_key}"));
        }
        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(model = %model_id, error = %e, "Availability probe failed");
                false
            }
        }
    }

    #[tracing::instrument(skip(self, req), fields(model = %model_id))]
    async fn complete(
        &self,
        model_id: &str,
        req: &ModelRequest,
        timeout: Duration,
    ) -> Result<Completion> {
        let response = self
            .request_builder(model_id, req, false, timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(model_id, timeout, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Self::map_send_error(model_id, timeout, e))?;

        if !status.is_success() {
            return Err(Error::Upstream {
                model: model_id.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }

        let wire: WireResponse = serde_json::from_str(&body).map_err(|e| Error::Upstream {
            model: model_id.to_string(),
            message: format!("malformed completion body: {e}"),
        })?;

        let choice = wire.choices.into_iter().next().ok_or_else(|| Error::Upstream {
            model: model_id.to_string(),
            message: "completion had no choices".to_string(),
        })?;

        let usage = wire
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            usage,
            raw_id: wire.id,
        })
    }

    async fn stream(
        &self,
        model_id: &str,
        req: &ModelRequest,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Result<StreamDelta>>> {
        let response = self
            .request_builder(model_id, req, true, timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(model_id, timeout, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                model: model_id.to_string(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let model = model_id.to_string();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();

            'outer: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::Upstream {
                                model: model.clone(),
                                message: format!("stream read failed: {e}"),
                            }))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Drain complete SSE lines, keeping any partial tail
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'outer;
                    }

                    let parsed: WireChunk = match serde_json::from_str(data) {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::debug!(model = %model, error = %e, "Skipping malformed stream chunk");
                            continue;
                        }
                    };

                    let (content, finish_reason) = parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| (c.delta.content, parse_finish_reason_opt(c.finish_reason)))
                        .unwrap_or((None, None));
                    let delta = StreamDelta {
                        content,
                        finish_reason,
                        usage: parsed
                            .usage
                            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens)),
                    };
                    if tx.send(Ok(delta)).await.is_err() {
                        // Receiver dropped: the caller cancelled the stream
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn parse_finish_reason_opt(raw: Option<String>) -> Option<FinishReason> {
    raw.map(|r| parse_finish_reason(Some(r.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, Role};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ModelRequest {
        ModelRequest::new("openai/gpt-4o", vec![ChatMessage::text(Role::User, "Hi")])
    }

    fn adapter(server: &MockServer) -> OpenAiCompatAdapter {
        OpenAiCompatAdapter::new(server.uri().parse().unwrap(), Some("sk-test".to_string()))
    }

    #[test]
    fn test_wire_payload_strips_routing_controls() {
        let mut req = request();
        req.route = Some(crate::chat::RouteStrategy::Fallback);
        req.fallbacks = Some(vec!["openai/gpt-3.5-turbo".to_string()]);

        let payload = OpenAiCompatAdapter::to_wire("openai/gpt-4o", &req, false);
        assert_eq!(payload["model"], "gpt-4o");
        assert!(payload.get("route").is_none());
        assert!(payload.get("fallbacks").is_none());
        assert_eq!(payload["stream"], false);
    }

    #[tokio::test]
    async fn test_complete_parses_openai_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-abc",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let completion = adapter(&server)
            .complete("openai/gpt-4o", &request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(completion.content, "Hello!");
        assert_eq!(completion.finish_reason, FinishReason::Stop);
        assert_eq!(completion.usage.total_tokens, 12);
        assert_eq!(completion.raw_id.as_deref(), Some("chatcmpl-abc"));
    }

    #[tokio::test]
    async fn test_complete_maps_http_error_to_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .complete("openai/gpt-4o", &request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_available_reflects_models_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        assert!(adapter.available("openai/gpt-4o", Duration::from_secs(2)).await);

        // An unreachable base is simply unavailable
        let dead = OpenAiCompatAdapter::new("http://127.0.0.1:1".parse().unwrap(), None);
        assert!(!dead.available("openai/gpt-4o", Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn test_stream_parses_sse_chunks() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}],",
            "\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let mut rx = adapter(&server)
            .stream("openai/gpt-4o", &request(), Duration::from_secs(5))
            .await
            .unwrap();

        let mut text = String::new();
        let mut usage = None;
        let mut finish = None;
        while let Some(delta) = rx.recv().await {
            let delta = delta.unwrap();
            if let Some(chunk) = delta.content {
                text.push_str(&chunk);
            }
            if delta.usage.is_some() {
                usage = delta.usage;
            }
            if delta.finish_reason.is_some() {
                finish = delta.finish_reason;
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(usage.unwrap().total_tokens, 11);
        assert_eq!(finish, Some(FinishReason::Stop));
    }
}
