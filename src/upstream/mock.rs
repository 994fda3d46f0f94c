//! Scriptable upstream adapter for tests.
//!
//! Allows configuring per-model availability and queued completion results
//! without making real HTTP calls, and records every dispatch for assertions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::chat::{FinishReason, ModelRequest, StreamDelta, Usage};
use crate::errors::Result;

use super::{Completion, UpstreamAdapter};

/// Record of a dispatch made against the mock.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub model: String,
    pub request: ModelRequest,
}

#[derive(Default)]
struct Inner {
    unavailable: HashSet<String>,
    /// Queued results per model, returned FIFO
    scripted: HashMap<String, VecDeque<Result<Completion>>>,
    calls: Vec<MockCall>,
    probes: Vec<String>,
}

/// Mock upstream adapter.
///
/// Unscripted models succeed with a deterministic canned completion, so most
/// tests only need to script the interesting paths.
#[derive(Clone, Default)]
pub struct MockUpstream {
    inner: Arc<Mutex<Inner>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `available()` return false for this model.
    pub fn mark_unavailable(&self, model: &str) {
        self.inner.lock().unavailable.insert(model.to_string());
    }

    pub fn mark_available(&self, model: &str) {
        self.inner.lock().unavailable.remove(model);
    }

    /// Queue a completion result for a model; queued results are consumed
    /// FIFO before the canned default kicks back in.
    pub fn push_result(&self, model: &str, result: Result<Completion>) {
        self.inner
            .lock()
            .scripted
            .entry(model.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Models probed via `available()`, in order.
    pub fn probed_models(&self) -> Vec<String> {
        self.inner.lock().probes.clone()
    }

    fn canned(model: &str) -> Completion {
        Completion {
            content: format!("mock completion from {model}"),
            finish_reason: FinishReason::Stop,
            usage: Usage::new(12, 8),
            raw_id: None,
        }
    }
}

#[async_trait]
impl UpstreamAdapter for MockUpstream {
    async fn available(&self, model_id: &str, _timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        inner.probes.push(model_id.to_string());
        !inner.unavailable.contains(model_id)
    }

    async fn complete(
        &self,
        model_id: &str,
        req: &ModelRequest,
        _timeout: Duration,
    ) -> Result<Completion> {
        let mut inner = self.inner.lock();
        inner.calls.push(MockCall {
            model: model_id.to_string(),
            request: req.clone(),
        });
        if let Some(queue) = inner.scripted.get_mut(model_id) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        Ok(Self::canned(model_id))
    }

    async fn stream(
        &self,
        model_id: &str,
        req: &ModelRequest,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Result<StreamDelta>>> {
        let completion = self.complete(model_id, req, timeout).await?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for word in completion.content.split_whitespace() {
                let delta = StreamDelta {
                    content: Some(format!("{word} ")),
                    ..Default::default()
                };
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(Ok(StreamDelta {
                    content: None,
                    finish_reason: Some(completion.finish_reason),
                    usage: Some(completion.usage),
                }))
                .await;
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, Role};
    use crate::errors::Error;

    fn request() -> ModelRequest {
        ModelRequest::new("openai/gpt-4o", vec![ChatMessage::text(Role::User, "Hi")])
    }

    #[tokio::test]
    async fn test_canned_completion_and_call_recording() {
        let mock = MockUpstream::new();
        let completion = mock
            .complete("openai/gpt-4o", &request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(completion.content.contains("openai/gpt-4o"));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.calls()[0].model, "openai/gpt-4o");
    }

    #[tokio::test]
    async fn test_scripted_results_are_fifo() {
        let mock = MockUpstream::new();
        mock.push_result(
            "openai/gpt-4o",
            Err(Error::Upstream {
                model: "openai/gpt-4o".to_string(),
                message: "overloaded".to_string(),
            }),
        );

        let first = mock
            .complete("openai/gpt-4o", &request(), Duration::from_secs(1))
            .await;
        assert!(first.is_err());
        // Queue drained; back to the canned default
        let second = mock
            .complete("openai/gpt-4o", &request(), Duration::from_secs(1))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_availability_switch_and_probe_recording() {
        let mock = MockUpstream::new();
        assert!(mock.available("openai/gpt-4o", Duration::from_secs(1)).await);
        mock.mark_unavailable("openai/gpt-4o");
        assert!(!mock.available("openai/gpt-4o", Duration::from_secs(1)).await);
        mock.mark_available("openai/gpt-4o");
        assert!(mock.available("openai/gpt-4o", Duration::from_secs(1)).await);
        assert_eq!(mock.probed_models().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_ends_with_usage() {
        let mock = MockUpstream::new();
        let mut rx = mock
            .stream("openai/gpt-4o", &request(), Duration::from_secs(1))
            .await
            .unwrap();

        let mut text = String::new();
        let mut final_usage = None;
        while let Some(delta) = rx.recv().await {
            let delta = delta.unwrap();
            if let Some(chunk) = delta.content {
                text.push_str(&chunk);
            }
            if let Some(usage) = delta.usage {
                final_usage = Some(usage);
            }
        }
        assert!(text.contains("mock completion"));
        assert_eq!(final_usage.unwrap().total_tokens, 20);
    }
}
