//! In-process dispatcher answering from a closure. Used by tests and the demo.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::DispatchError;
use crate::domain::task::ResponseEnvelope;
use crate::ports::dispatch::{Dispatcher, Route};

type Handler =
    dyn Fn(&str, &serde_json::Value) -> Result<ResponseEnvelope, DispatchError> + Send + Sync;

/// A call seen by a `StubDispatcher`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub url: String,
    pub body: serde_json::Value,
}

#[derive(Clone)]
pub struct StubDispatcher {
    handler: Arc<Handler>,
    latency: Duration,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl StubDispatcher {
    /// `handler` receives the full URL and the body.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) -> Result<ResponseEnvelope, DispatchError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Arc::new(handler),
            latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Echoes the body back as `data`.
    pub fn always_ok() -> Self {
        Self::new(|_, body| Ok(ResponseEnvelope::success(body.clone())))
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl Dispatcher for StubDispatcher {
    async fn dispatch(
        &self,
        base_url: &str,
        route: &Route,
        body: &serde_json::Value,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let url = route.url(base_url);
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedCall {
                url: url.clone(),
                body: body.clone(),
            });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(&url, body)
    }
}
