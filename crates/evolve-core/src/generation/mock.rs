//! Scripted text generation (tests and dry runs, no network).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{GenerationError, GenerationRequest, GenerationResponse, TextGeneration};

type Script =
    Box<dyn Fn(&GenerationRequest) -> std::result::Result<String, GenerationError> + Send + Sync>;

/// Deterministic [`TextGeneration`] driven by a closure.
///
/// Every request is recorded so tests can assert on what was sent and how
/// many calls were made.
pub struct ScriptedGeneration {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGeneration {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&GenerationRequest) -> std::result::Result<String, GenerationError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with the same text.
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Always fail with a transport error.
    pub fn failing() -> Self {
        Self::new(|_| Err(GenerationError::Transport("scripted failure".to_string())))
    }

    /// Answer with each text in turn, then fail once exhausted.
    pub fn sequence<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queue: Mutex<VecDeque<String>> =
            Mutex::new(texts.into_iter().map(Into::into).collect());
        Self::new(move |_| {
            queue
                .lock()
                .map_err(|e| GenerationError::Transport(e.to_string()))?
                .pop_front()
                .ok_or_else(|| GenerationError::Transport("script exhausted".to_string()))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TextGeneration for ScriptedGeneration {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.script)(&request);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        result.map(GenerationResponse::text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_then_exhausted() {
        let gen = ScriptedGeneration::sequence(["one", "two"]);
        let req = || GenerationRequest::new("s", "u");
        assert_eq!(gen.generate(req()).await.unwrap().content, "one");
        assert_eq!(gen.generate(req()).await.unwrap().content, "two");
        assert!(gen.generate(req()).await.is_err());
        assert_eq!(gen.calls(), 3);
        assert_eq!(gen.requests().len(), 3);
    }

    #[tokio::test]
    async fn closure_sees_request() {
        let gen = ScriptedGeneration::new(|r| Ok(format!("echo:{}", r.user)));
        let out = gen
            .generate(GenerationRequest::new("s", "hello"))
            .await
            .unwrap();
        assert_eq!(out.content, "echo:hello");
    }
}
