use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::FetchConfig;
use crate::error::{PreflightError, PreflightResult};

/// A request on its way out of the laboratory
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutgoingRequest {
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
}

impl OutgoingRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub status: u16,
    pub body: String,
}

/// Sends the substituted request. Implementations never see placeholders
/// the environment could resolve.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(&self, request: OutgoingRequest) -> PreflightResult<DispatchResponse>;
}

/// Dispatcher that POSTs the request body over HTTP
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(config: &FetchConfig) -> PreflightResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PreflightError::Dispatch {
                message: format!("Failed to initialize HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    fn header_map(headers: &IndexMap<String, String>) -> PreflightResult<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let header_name = HeaderName::from_str(name).map_err(|e| PreflightError::Dispatch {
                message: format!("Invalid header name '{}': {}", name, e),
            })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| PreflightError::Dispatch {
                    message: format!("Invalid value for header '{}': {}", name, e),
                })?;
            map.insert(header_name, header_value);
        }
        if !map.contains_key(CONTENT_TYPE) {
            map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        Ok(map)
    }
}

#[async_trait]
impl RequestDispatcher for HttpDispatcher {
    async fn dispatch(&self, request: OutgoingRequest) -> PreflightResult<DispatchResponse> {
        let headers = Self::header_map(&request.headers)?;
        debug!(url = %request.url, headers = request.headers.len(), "Dispatching request");

        let response = self
            .client
            .post(&request.url)
            .headers(headers)
            .body(request.body.unwrap_or_default())
            .send()
            .await
            .map_err(|e| {
                error!(url = %request.url, "Request dispatch failed: {}", e);
                PreflightError::Dispatch {
                    message: e.to_string(),
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| PreflightError::Dispatch {
            message: format!("Failed to read response: {}", e),
        })?;
        Ok(DispatchResponse { status, body })
    }
}
