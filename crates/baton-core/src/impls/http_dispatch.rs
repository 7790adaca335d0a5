//! Dispatcher over HTTP with reqwest.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::errors::DispatchError;
use crate::domain::task::ResponseEnvelope;
use crate::ports::dispatch::{Dispatcher, HttpMethod, Route};

/// One request per `dispatch`; retries are the caller's business.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDispatcher {
    /// `timeout` bounds each request on its own.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn request(&self, method: HttpMethod, url: String) -> reqwest::RequestBuilder {
        match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Turn a decoded envelope into the dispatch result.
pub(crate) fn check_envelope(envelope: ResponseEnvelope) -> Result<ResponseEnvelope, DispatchError> {
    if envelope.result {
        Ok(envelope)
    } else {
        Err(DispatchError::Rejected {
            code: envelope.code,
            message: envelope.message,
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        base_url: &str,
        route: &Route,
        body: &serde_json::Value,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let url = route.url(base_url);
        debug!(%url, method = %route.method, "dispatching sub-task");

        let response = self
            .request(route.method, url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status(status.as_u16()));
        }

        let envelope: ResponseEnvelope = response
            .json()
            .await
            .map_err(|e| DispatchError::Decode(e.to_string()))?;
        check_envelope(envelope)
    }
}
