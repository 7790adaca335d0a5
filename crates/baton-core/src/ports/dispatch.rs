//! Dispatcher port - sub-task をダウンストリームサービスへ送る
//!
//! A task type maps to one `Route`. The sub-task's data is the JSON body and
//! the reply is a `ResponseEnvelope`.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DispatchError;
use crate::domain::task::ResponseEnvelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Where the sub-tasks of one task type are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Service type resolved through discovery.
    pub service: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Path appended to the instance base URL, e.g. `/sync/host`.
    pub path: String,
}

impl Route {
    pub fn new(service: impl Into<String>, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method,
            path: path.into(),
        }
    }

    pub fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// One call to one instance. `Ok` only when the envelope says `result: true`;
    /// a `result: false` reply becomes `DispatchError::Rejected`.
    async fn dispatch(
        &self,
        base_url: &str,
        route: &Route,
        body: &serde_json::Value,
    ) -> Result<ResponseEnvelope, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://10.0.0.1:8080", "/sync/host")]
    #[case("http://10.0.0.1:8080/", "/sync/host")]
    #[case("http://10.0.0.1:8080", "sync/host")]
    fn route_url_has_single_separator(#[case] base: &str, #[case] path: &str) {
        let route = Route::new("host", HttpMethod::Post, path);
        assert_eq!(route.url(base), "http://10.0.0.1:8080/sync/host");
    }

    #[test]
    fn method_defaults_to_post() {
        let route: Route = serde_json::from_str(r#"{"service":"host","path":"/x"}"#).unwrap();
        assert_eq!(route.method, HttpMethod::Post);
        let route: Route =
            serde_json::from_str(r#"{"service":"host","method":"PUT","path":"/x"}"#).unwrap();
        assert_eq!(route.method.to_string(), "PUT");
    }
}
