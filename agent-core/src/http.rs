//! Generic retrying HTTP client used for enrollment, version checks, update-status
//! reporting, and binary downloads — the agent's only unary (non-WebSocket) transport.
//!
//! Built on `reqwest` with `reqwest-middleware`/`reqwest-retry` providing automatic
//! exponential-backoff retries of transient failures, the same pattern this codebase
//! already uses for outbound API calls.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

/// Outcome of a unary API call: the HTTP transport itself succeeded (no network error, no
/// retry exhaustion) but the response may still carry a non-2xx status.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// Deserialized payload, present when `success` is `true`.
    pub data: Option<T>,
    /// Raw response body, present when `success` is `false`.
    pub error_body: Option<String>,
    /// HTTP status code.
    pub status: u16,
    /// Whether the status code was in the 2xx range.
    pub success: bool,
    /// Response headers.
    pub headers: HeaderMap,
}

/// A generic HTTP client for the agent's unary calls to the control server: enrollment,
/// version checks, update-status reporting, and binary downloads.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Builds a client against `base_url`, retrying transient failures up to 3 times with
    /// exponential backoff. `auth_token`, when present, is sent as a Bearer token on every
    /// request.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, url::ParseError> {
        let url = Url::parse(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    /// Sends a JSON request and deserializes the response body into `T` on success.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: Option<HeaderMap>,
    ) -> Result<ApiResponse<T>, reqwest_middleware::Error>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let full_url = self
            .base_url
            .join(path)
            .map_err(|e| reqwest_middleware::Error::Middleware(e.into()))?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(b) = body {
            let json_body = serde_json::to_string(b)
                .map_err(|e| reqwest_middleware::Error::Middleware(e.into()))?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();
        let success = status.is_success();

        if success {
            let data = response
                .json::<T>()
                .await
                .map_err(reqwest_middleware::Error::Reqwest)?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Streams a GET response body to `sink`, returning the total number of bytes
    /// written. Used for binary downloads where buffering the whole response in memory is
    /// undesirable.
    pub async fn download(
        &self,
        url: &str,
        mut sink: impl std::io::Write,
    ) -> Result<u64, reqwest_middleware::Error> {
        use futures_util::StreamExt;

        let response = self.inner.get(url).send().await?;
        let mut stream = response.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(reqwest_middleware::Error::Reqwest)?;
            sink.write_all(&chunk)
                .map_err(|e| reqwest_middleware::Error::Middleware(anyhow::Error::from(e)))?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Request timeout applied by callers that need a harder deadline than the retry
    /// policy alone provides (e.g. version checks during a tight update-loop tick).
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Derives the unary HTTP(S) base URL from a control-plane WebSocket URL: `ws`/`wss` map to
/// `http`/`https`, and any path/query/fragment is dropped since enrollment, version-check,
/// and update-result calls all hit well-known paths under the bare host.
pub fn derive_http_base_url(control_url: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(control_url)?;
    let scheme = match url.scheme() {
        "wss" => "https",
        "ws" => "http",
        other => other,
    };
    url.set_scheme(scheme)
        .expect("http/https/ws/wss are all non-opaque schemes");
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Builds a single-header `HeaderMap`, for callers (like enrollment) that need one ad hoc
/// header alongside the standard JSON content type `request` already sets.
pub fn single_header(name: &'static str, value: impl Into<String>) -> Option<HeaderMap> {
    let mut map = HeaderMap::new();
    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        return None;
    };
    let Ok(header_value) = HeaderValue::from_str(&value.into()) else {
        return None;
    };
    map.insert(header_name, header_value);
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_base_url() {
        assert!(ApiClient::new("not-a-url", None).is_err());
    }

    #[test]
    fn accepts_valid_base_url() {
        assert!(ApiClient::new("https://example.com", Some("tok".into())).is_ok());
    }

    #[test]
    fn derive_http_base_url_maps_websocket_schemes() {
        let url = derive_http_base_url("wss://agents.example.test:8443/ws/agent?x=1").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.as_str(), "https://agents.example.test:8443/");

        let url = derive_http_base_url("ws://localhost:8080/ws/agent").unwrap();
        assert_eq!(url.scheme(), "http");
    }

    #[test]
    fn single_header_rejects_invalid_values() {
        assert!(single_header("x-token", "valid").is_some());
        assert!(single_header("x-token", "bad\nvalue").is_none());
    }
}
