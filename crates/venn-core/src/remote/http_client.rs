use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client, ClientBuilder,
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    errors::RpcError,
    types::{JsonRpcRequest, JsonRpcResponse, Payload},
};

/// Configuration for HTTP client concurrency and timeout behavior.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of concurrent HTTP requests to one remote
    pub concurrent_limit: usize,
    /// Permit acquisition timeout
    pub permit_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 1000,
            permit_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(45),
        }
    }
}

/// Unary JSON-RPC over HTTP to a single remote URL.
///
/// Concurrency is bounded by a semaphore; there are no retries here because the cluster fails
/// over to the next remote instead.
pub struct HttpClient {
    client: Client,
    url: String,
    headers: HeaderMap,
    concurrent_limit: Arc<Semaphore>,
    config: HttpClientConfig,
}

/// RAII guard ensuring semaphore permits are always released.
struct PermitGuard {
    _permit: OwnedSemaphorePermit,
    semaphore: Arc<Semaphore>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        tracing::trace!(
            available_permits = self.semaphore.available_permits(),
            "permit guard dropped"
        );
    }
}

impl HttpClient {
    /// Creates a client for `url` sending `headers` on every request.
    ///
    /// # Errors
    ///
    /// Returns an error if a header is invalid or the reqwest client fails to build.
    pub fn new(
        url: &str,
        headers: &HashMap<String, String>,
        config: HttpClientConfig,
    ) -> Result<Self, RpcError> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.request_timeout)
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("venn/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                RpcError::Internal(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            client,
            url: url.to_string(),
            headers: header_map(headers)?,
            concurrent_limit: Arc::new(Semaphore::new(config.concurrent_limit)),
            config,
        })
    }

    /// Sanitizes network errors so upstream URLs (which may embed API keys) never reach clients.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_timeout() {
            "connection timed out".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else if error.is_redirect() {
            "too many redirects".to_string()
        } else {
            "network error".to_string()
        }
    }

    /// Sends one JSON-RPC call and returns its raw result.
    ///
    /// # Errors
    ///
    /// - [`RpcError::JsonRpc`] when the remote answers with an error object
    /// - [`RpcError::Http`] for non-success HTTP status codes
    /// - [`RpcError::Timeout`] if permit acquisition or the request times out
    /// - [`RpcError::Transport`] for network failures and undecodable bodies
    pub async fn request(&self, method: &str, params: &Value) -> Result<Payload, RpcError> {
        let permit = tokio::time::timeout(
            self.config.permit_timeout,
            Arc::clone(&self.concurrent_limit).acquire_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                available_permits = self.concurrent_limit.available_permits(),
                "http client semaphore acquisition timeout"
            );
            RpcError::Timeout
        })?
        .map_err(|_| RpcError::Closed)?;
        let _guard = PermitGuard { _permit: permit, semaphore: Arc::clone(&self.concurrent_limit) };

        let params = match params {
            Value::Null => None,
            other => Some(other.clone()),
        };
        let body = serde_json::to_vec(&JsonRpcRequest::new(method, params, Value::from(1)))
            .map_err(|e| RpcError::Internal(format!("failed to encode request: {e}")))?;

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RpcError::Timeout
                } else {
                    RpcError::Transport(Self::sanitize_network_error(&e))
                }
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout
            } else {
                RpcError::Transport(Self::sanitize_network_error(&e))
            }
        })?;

        if !status.is_success() {
            // some nodes attach a JSON-RPC error to a 4xx; prefer it when present
            if let Ok(decoded) = serde_json::from_slice::<JsonRpcResponse>(&bytes) {
                if decoded.error.is_some() {
                    return decoded.into_outcome();
                }
            }
            let text = String::from_utf8_lossy(&bytes);
            let body = if text.len() > 256 {
                let mut end = 256;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}... (truncated)", &text[..end])
            } else {
                text.into_owned()
            };
            return Err(RpcError::Http { status: status.as_u16(), body });
        }

        let decoded: JsonRpcResponse = serde_json::from_slice(&bytes)
            .map_err(|e| RpcError::Transport(format!("invalid JSON-RPC response: {e}")))?;
        decoded.into_outcome()
    }

    #[cfg(test)]
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.concurrent_limit.available_permits()
    }
}

/// Builds a header map from configured remote headers.
///
/// # Errors
///
/// Returns [`RpcError::Internal`] naming the offending header.
pub fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, RpcError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| RpcError::Internal(format!("invalid header name {key}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RpcError::Internal(format!("invalid header value for {key}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_http_client_config_default() {
        let config = HttpClientConfig::default();
        assert_eq!(config.concurrent_limit, 1000);
        assert_eq!(config.permit_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&headers).is_err());
        headers.clear();
        headers.insert("x-api-key".to_string(), "abc".to_string());
        assert_eq!(header_map(&headers).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_request_relays_result_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("x-api-key", "secret")
            .match_body(mockito::Matcher::PartialJson(json!({"method": "eth_chainId"})))
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#)
            .create_async()
            .await;

        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), "secret".to_string());
        let client = HttpClient::new(&server.url(), &headers, HttpClientConfig::default()).unwrap();
        let result = client.request("eth_chainId", &json!([])).await.unwrap();
        assert_eq!(result.get(), r#""0x1""#);
        assert_eq!(client.available_permits(), 1000);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_maps_http_and_rpc_errors() {
        let mut server = mockito::Server::new_async().await;
        server.mock("POST", "/").with_status(503).with_body("overloaded").create_async().await;
        let client =
            HttpClient::new(&server.url(), &HashMap::new(), HttpClientConfig::default()).unwrap();
        match client.request("eth_call", &json!([])).await {
            Err(RpcError::Http { status: 503, body }) => assert_eq!(body, "overloaded"),
            other => panic!("unexpected: {other:?}"),
        }

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"invalid block"}}"#)
            .create_async()
            .await;
        let client =
            HttpClient::new(&server.url(), &HashMap::new(), HttpClientConfig::default()).unwrap();
        let err = client.request("eth_call", &json!([])).await.unwrap_err();
        assert_eq!(err.code(), -32602);
    }
}
