//! HTTP Client Module
//!
//! Backs the `fetch` global available to preflight scripts.
//!
//! # Security Features
//!
//! 1. URL validation to block private IPs and localhost
//! 2. Only `http` and `https` schemes
//! 3. Response size limits to prevent memory exhaustion
//! 4. Timeout enforcement, capped by the remaining script budget

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::FetchConfig;

/// HTTP client for requests made by scripts
pub struct HttpClient {
    client: reqwest::blocking::Client,
    default_timeout: Duration,
    max_response_size: usize,
    /// Allow localhost/private IPs (test mode only)
    allow_private: bool,
}

impl HttpClient {
    /// Create a new HTTP client from fetch settings.
    ///
    /// The blocking client must be created and used off the async runtime;
    /// the sandbox builds it on its engine thread.
    pub fn new(config: &FetchConfig) -> Result<Self, HttpError> {
        let default_timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::blocking::Client::builder()
            .timeout(default_timeout)
            .build()
            .map_err(|e| HttpError::ClientInitialization(e.to_string()))?;

        Ok(Self {
            client,
            default_timeout,
            max_response_size: config.max_response_bytes,
            allow_private: config.allow_private_network,
        })
    }

    /// Make an HTTP request with the Fetch API interface.
    ///
    /// `budget` caps the request timeout so a slow server cannot outlive the
    /// script's deadline.
    pub fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
        budget: Option<Duration>,
    ) -> Result<FetchResponse, HttpError> {
        let parsed_url = if self.allow_private {
            Self::validate_url_scheme(url)?
        } else {
            Self::validate_url(url)?
        };

        let method = Method::from_str(&options.method.to_uppercase())
            .map_err(|_| HttpError::InvalidMethod(options.method.clone()))?;

        let headers = Self::build_headers(options.headers)?;

        let mut timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        if let Some(budget) = budget {
            if budget.is_zero() {
                return Err(HttpError::BudgetExhausted);
            }
            timeout = timeout.min(budget);
        }

        let mut request = self
            .client
            .request(method, parsed_url.as_str())
            .headers(headers)
            .timeout(timeout);

        if let Some(body) = options.body {
            request = request.body(body);
        }

        debug!(url = %parsed_url, method = %options.method, "Script fetch");
        let response = request
            .send()
            .map_err(|e| HttpError::RequestFailed(e.to_string()))?;

        self.convert_response(response)
    }

    /// Validate URL and block private IPs, localhost, and malicious URLs
    fn validate_url(url: &str) -> Result<Url, HttpError> {
        let parsed = Self::validate_url_scheme(url)?;

        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?;

        if host == "localhost" || host.ends_with(".localhost") {
            return Err(HttpError::BlockedUrl(
                "Localhost is not allowed".to_string(),
            ));
        }

        // IPv6 hosts come bracketed from `host_str`
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = IpAddr::from_str(bare_host)
            && Self::is_private_ip(&ip)
        {
            return Err(HttpError::BlockedUrl(format!(
                "Private IP address not allowed: {}",
                ip
            )));
        }

        Ok(parsed)
    }

    /// Scheme and host checks only (private networks allowed)
    fn validate_url_scheme(url: &str) -> Result<Url, HttpError> {
        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            _ => return Err(HttpError::InvalidUrlScheme(parsed.scheme().to_string())),
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl("No host in URL".to_string()));
        }

        Ok(parsed)
    }

    /// Check if an IP address is private
    fn is_private_ip(ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(ipv4) => {
                ipv4.is_private()
                    || ipv4.is_loopback()
                    || ipv4.is_link_local()
                    || ipv4.is_broadcast()
                    || ipv4.is_documentation()
                    || ipv4.is_unspecified()
            }
            IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
        }
    }

    fn build_headers(headers: Option<HashMap<String, String>>) -> Result<HeaderMap, HttpError> {
        let mut header_map = HeaderMap::new();

        for (key, value) in headers.unwrap_or_default() {
            let header_name = reqwest::header::HeaderName::from_str(&key)
                .map_err(|e| HttpError::InvalidHeader(format!("Invalid header name: {}", e)))?;
            let header_value = reqwest::header::HeaderValue::from_str(&value)
                .map_err(|e| HttpError::InvalidHeader(format!("Invalid header value: {}", e)))?;
            header_map.insert(header_name, header_value);
        }

        Ok(header_map)
    }

    /// Convert reqwest response to FetchResponse
    fn convert_response(
        &self,
        response: reqwest::blocking::Response,
    ) -> Result<FetchResponse, HttpError> {
        let status = response.status().as_u16();
        let ok = response.status().is_success();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string();
        let url = response.url().to_string();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(value_str) = value.to_str() {
                headers.insert(key.as_str().to_lowercase(), value_str.to_string());
            }
        }

        if let Some(content_length) = response.content_length()
            && content_length > self.max_response_size as u64
        {
            return Err(HttpError::ResponseTooLarge(content_length));
        }

        let bytes = response
            .bytes()
            .map_err(|e| HttpError::ResponseReadFailed(e.to_string()))?;

        if bytes.len() > self.max_response_size {
            return Err(HttpError::ResponseTooLarge(bytes.len() as u64));
        }

        let body = String::from_utf8(bytes.to_vec())
            .map_err(|e| HttpError::ResponseEncodingError(e.to_string()))?;

        Ok(FetchResponse {
            status,
            status_text,
            url,
            headers,
            body,
            ok,
        })
    }
}

/// Options for fetch request (the `init` argument of `fetch`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    #[serde(default)]
    pub body: Option<String>,

    /// Timeout in milliseconds
    #[serde(default, rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: None,
            body: None,
            timeout_ms: None,
        }
    }
}

/// Response from fetch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    /// Final URL after redirects
    pub url: String,
    /// Response headers, names lowercased
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Whether the request was successful (2xx status)
    pub ok: bool,
}

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Failed to initialize HTTP client: {0}")]
    ClientInitialization(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid URL scheme: {0} (only http and https are allowed)")]
    InvalidUrlScheme(String),

    #[error("Blocked URL: {0}")]
    BlockedUrl(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("No time left in the script budget for a request")]
    BudgetExhausted,

    #[error("Response too large: {0} bytes")]
    ResponseTooLarge(u64),

    #[error("Failed to read response: {0}")]
    ResponseReadFailed(String),

    #[error("Response encoding error: {0}")]
    ResponseEncodingError(String),
}
