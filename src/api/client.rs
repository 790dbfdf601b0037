//! J-Quants API client with automatic token renewal
//!
//! This module provides functionality to authenticate against the J-Quants
//! API and fetch resource data. The client owns the access-token lifecycle:
//! it lazily exchanges the refresh token for an ID token that is reused
//! across requests, and it re-derives that token exactly once when a
//! request is rejected with HTTP 401.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Base URL for the J-Quants API
pub const DEFAULT_BASE_URL: &str = "https://api.jpx-jquants.com/v1";

/// Environment variable consulted by [`ApiClient::from_env`]
pub const REFRESH_TOKEN_ENV: &str = "JQUANTS_REFRESH_TOKEN";

/// HTTP statuses treated as transient and retried by the transport layer
const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors that can occur when talking to the API
#[derive(Debug, Error)]
pub enum ApiError {
    /// No refresh token was supplied and the environment variable is unset
    #[error("no refresh token: pass one explicitly or set JQUANTS_REFRESH_TOKEN")]
    MissingCredential,

    /// The token issuance call failed (network failure or a bad response)
    #[error("token refresh failed: {0}")]
    Auth(String),

    /// A resource fetch returned a non-success status after all retries
    #[error("GET {path} returned HTTP {status}")]
    Http {
        /// Resource path the request was for
        path: String,
        /// Final HTTP status code
        status: u16,
    },

    /// The response body did not have the expected shape
    #[error("unexpected response shape: {0}")]
    Schema(String),

    /// HTTP transport failed after exhausting transient retries
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Failed to parse a JSON response body
    #[error("failed to parse JSON response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Constructor-time configuration for [`ApiClient`]
///
/// None of these values can be changed after the client is built.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL that resource paths are appended to
    pub base_url: String,
    /// Per-request socket timeout
    pub timeout: Duration,
    /// Maximum number of transient-failure retries per request
    pub retry_count: u32,
    /// Base delay for exponential backoff between retries
    pub backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
            retry_count: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Body of a successful token issuance response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "idToken")]
    id_token: String,
}

/// Client for authenticated requests against the J-Quants API
///
/// Holds the refresh token for its whole lifetime and lazily derives the
/// short-lived ID token from it. The ID token is private to the instance;
/// all operations run to completion sequentially, so no locking is involved.
#[derive(Debug)]
pub struct ApiClient {
    http: Client,
    config: ClientConfig,
    refresh_token: String,
    id_token: Option<String>,
}

impl ApiClient {
    /// Creates a client with default configuration
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self::with_config(refresh_token, ClientConfig::default())
    }

    /// Creates a client with a custom configuration
    pub fn with_config(refresh_token: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            http: Client::new(),
            config,
            refresh_token: refresh_token.into(),
            id_token: None,
        }
    }

    /// Creates a client with the refresh token taken from `JQUANTS_REFRESH_TOKEN`
    ///
    /// # Returns
    /// * `Err(ApiError::MissingCredential)` if the variable is unset or empty
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_env_with_config(ClientConfig::default())
    }

    /// Like [`ApiClient::from_env`], with a custom configuration
    pub fn from_env_with_config(config: ClientConfig) -> Result<Self, ApiError> {
        let refresh_token = std::env::var(REFRESH_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::MissingCredential)?;
        Ok(Self::with_config(refresh_token, config))
    }

    /// Returns the configured base URL
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Discards the cached ID token; the next request derives a fresh one
    pub fn reset_access_token(&mut self) {
        self.id_token = None;
    }

    /// Returns the cached ID token, deriving one from the refresh token first
    /// if none is held
    ///
    /// Issuance failures are not retried here: an invalid refresh token
    /// would fail the same way every time.
    pub async fn access_token(&mut self) -> Result<String, ApiError> {
        if let Some(token) = &self.id_token {
            return Ok(token.clone());
        }

        let url = format!(
            "{}/token/auth_refresh?refreshtoken={}",
            self.config.base_url, self.refresh_token
        );
        let response = self
            .http
            .get(&url)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| ApiError::Auth(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Auth(format!(
                "token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Auth(e.to_string()))?;

        debug!("derived a fresh ID token from the refresh token");
        self.id_token = Some(body.id_token.clone());
        Ok(body.id_token)
    }

    /// Fetches the raw envelope for a resource path
    ///
    /// Issues `GET {base_url}{path}` with a bearer header. Transient
    /// failures are retried by [`Self::send_with_retry`]; a 401 triggers a
    /// single token refresh followed by one more attempt. A second 401 (or
    /// any other non-success status) after that is surfaced as
    /// [`ApiError::Http`].
    pub async fn fetch_envelope(&mut self, path: &str) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.config.base_url, path);

        let token = self.access_token().await?;
        let mut response = self.send_with_retry(&url, &token).await?;

        // A 401 almost always means the ID token expired. Discard it,
        // derive a fresh one, and retry the request once.
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "request rejected with 401; refreshing ID token");
            self.reset_access_token();
            let token = self.access_token().await?;
            response = self.send_with_retry(&url, &token).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Http {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Fetches a resource and unwraps its single-key envelope
    pub async fn fetch_data_part(&mut self, path: &str) -> Result<Value, ApiError> {
        let envelope = self.fetch_envelope(path).await?;
        unwrap_envelope(envelope)
    }

    /// Fetches a resource and converts its data part to rows
    pub async fn fetch_records(&mut self, path: &str) -> Result<Vec<Map<String, Value>>, ApiError> {
        let data = self.fetch_data_part(path).await?;
        to_records(data)
    }

    /// Sends one authenticated GET, retrying transient failures with
    /// exponential backoff up to the configured retry count
    ///
    /// Only transport errors and the statuses in [`RETRY_STATUSES`] are
    /// retried; everything else (401 included) is returned to the caller
    /// untouched.
    async fn send_with_retry(&self, url: &str, token: &str) -> Result<Response, ApiError> {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .http
                .get(url)
                .timeout(self.config.timeout)
                .bearer_auth(token)
                .send()
                .await;

            let transient = match &outcome {
                Ok(response) => RETRY_STATUSES.contains(&response.status().as_u16()),
                Err(_) => true,
            };

            if !transient || attempt >= self.config.retry_count {
                return outcome.map_err(ApiError::from);
            }

            let delay = self.config.backoff * 2u32.saturating_pow(attempt);
            debug!(
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient failure; backing off before retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Unwraps a `{ "<key>": <data> }` envelope to its data part
///
/// Every API payload arrives wrapped in an object with a single key whose
/// name carries no information. Anything other than exactly one key signals
/// an upstream contract change and fails loudly rather than guessing.
pub fn unwrap_envelope(envelope: Value) -> Result<Value, ApiError> {
    let Value::Object(fields) = envelope else {
        return Err(ApiError::Schema("envelope is not a JSON object".to_string()));
    };
    if fields.len() != 1 {
        return Err(ApiError::Schema(format!(
            "expected exactly one top-level key, found {}",
            fields.len()
        )));
    }
    fields
        .into_iter()
        .next()
        .map(|(_, data)| data)
        .ok_or_else(|| ApiError::Schema("envelope is empty".to_string()))
}

/// Converts a data part into rows, one map per record
///
/// Endpoints return the data part as an array of flat objects; this is the
/// row-oriented view of that shape.
pub fn to_records(data: Value) -> Result<Vec<Map<String, Value>>, ApiError> {
    let Value::Array(items) = data else {
        return Err(ApiError::Schema("data part is not a JSON array".to_string()));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(fields) => Ok(fields),
            other => Err(ApiError::Schema(format!(
                "expected a JSON object per record, found {}",
                json_type_name(&other)
            ))),
        })
        .collect()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Config pointed at a mock server, with fast backoff for retry tests
    fn test_config(base_url: String) -> ClientConfig {
        ClientConfig {
            base_url,
            timeout: Duration::from_secs(5),
            retry_count: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_unwrap_envelope_single_key() {
        let envelope = json!({ "info": [{ "Code": "1301" }] });
        let data = unwrap_envelope(envelope).expect("single-key envelope should unwrap");
        assert_eq!(data, json!([{ "Code": "1301" }]));
    }

    #[test]
    fn test_unwrap_envelope_rejects_multiple_keys() {
        let envelope = json!({ "info": [], "pagination_key": "abc" });
        let result = unwrap_envelope(envelope);
        match result {
            Err(ApiError::Schema(msg)) => assert!(msg.contains("found 2"), "got: {}", msg),
            other => panic!("expected Schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_unwrap_envelope_rejects_empty_object() {
        let result = unwrap_envelope(json!({}));
        assert!(matches!(result, Err(ApiError::Schema(_))));
    }

    #[test]
    fn test_unwrap_envelope_rejects_non_object() {
        assert!(matches!(
            unwrap_envelope(json!([1, 2, 3])),
            Err(ApiError::Schema(_))
        ));
        assert!(matches!(unwrap_envelope(json!(42)), Err(ApiError::Schema(_))));
        assert!(matches!(
            unwrap_envelope(Value::Null),
            Err(ApiError::Schema(_))
        ));
    }

    #[test]
    fn test_to_records_array_of_objects() {
        let data = json!([
            { "Code": "1301", "Close": 3000.0 },
            { "Code": "1305", "Close": 2100.5 }
        ]);
        let records = to_records(data).expect("rows should convert");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Code"], json!("1301"));
        assert_eq!(records[1]["Close"], json!(2100.5));
    }

    #[test]
    fn test_to_records_rejects_non_array() {
        let result = to_records(json!({ "Code": "1301" }));
        assert!(matches!(result, Err(ApiError::Schema(_))));
    }

    #[test]
    fn test_to_records_rejects_scalar_items() {
        let result = to_records(json!([1, 2, 3]));
        match result {
            Err(ApiError::Schema(msg)) => assert!(msg.contains("a number"), "got: {}", msg),
            other => panic!("expected Schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_env_reads_and_rejects() {
        // Both cases in one test: the variable is process-global and
        // parallel tests must not race on it.
        std::env::set_var(REFRESH_TOKEN_ENV, "env-token");
        let client = ApiClient::from_env().expect("client should build from env");
        assert_eq!(client.refresh_token, "env-token");

        std::env::remove_var(REFRESH_TOKEN_ENV);
        assert!(matches!(
            ApiClient::from_env(),
            Err(ApiError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn test_token_issued_once_and_reused() {
        let mut server = mockito::Server::new_async().await;

        let token_mock = server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::UrlEncoded(
                "refreshtoken".into(),
                "refresh-abc".into(),
            ))
            .with_status(200)
            .with_body(r#"{"idToken":"id-1"}"#)
            .expect(1)
            .create_async()
            .await;

        let resource_mock = server
            .mock("GET", "/listed/info")
            .match_header("authorization", "Bearer id-1")
            .with_status(200)
            .with_body(r#"{"info":[]}"#)
            .expect(2)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", test_config(server.url()));

        client
            .fetch_envelope("/listed/info")
            .await
            .expect("first fetch should succeed");
        client
            .fetch_envelope("/listed/info")
            .await
            .expect("second fetch should succeed");

        // The issuance endpoint was hit exactly once across both fetches
        token_mock.assert_async().await;
        resource_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_triggers_single_refresh_then_succeeds() {
        let mut server = mockito::Server::new_async().await;

        // Each issuance call mints a distinct token so the two resource
        // mocks below can tell the attempts apart by bearer header.
        let minted = Arc::new(AtomicUsize::new(0));
        let token_mock = server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body_from_request({
                let minted = Arc::clone(&minted);
                move |_| {
                    let n = minted.fetch_add(1, Ordering::SeqCst);
                    format!(r#"{{"idToken":"id-{}"}}"#, n).into_bytes()
                }
            })
            .expect(2)
            .create_async()
            .await;

        let rejected = server
            .mock("GET", "/prices/daily_quotes")
            .match_header("authorization", "Bearer id-0")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let accepted = server
            .mock("GET", "/prices/daily_quotes")
            .match_header("authorization", "Bearer id-1")
            .with_status(200)
            .with_body(r#"{"daily_quotes":[{"Code":"7203"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", test_config(server.url()));

        let envelope = client
            .fetch_envelope("/prices/daily_quotes")
            .await
            .expect("fetch should succeed after one refresh");
        assert_eq!(envelope, json!({ "daily_quotes": [{ "Code": "7203" }] }));

        token_mock.assert_async().await;
        rejected.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_is_surfaced_not_looped() {
        let mut server = mockito::Server::new_async().await;

        let token_mock = server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"idToken":"id-1"}"#)
            .expect(2)
            .create_async()
            .await;

        let resource_mock = server
            .mock("GET", "/listed/info")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", test_config(server.url()));

        let result = client.fetch_envelope("/listed/info").await;
        match result {
            Err(ApiError::Http { path, status }) => {
                assert_eq!(path, "/listed/info");
                assert_eq!(status, 401);
            }
            other => panic!("expected Http(401), got {:?}", other),
        }

        // Exactly one refresh and exactly two resource attempts: no loop
        token_mock.assert_async().await;
        resource_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_status_retries_are_bounded() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"idToken":"id-1"}"#)
            .create_async()
            .await;

        let mut config = test_config(server.url());
        config.retry_count = 2;

        // Initial attempt plus two retries
        let resource_mock = server
            .mock("GET", "/listed/info")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", config);

        let result = client.fetch_envelope("/listed/info").await;
        match result {
            Err(ApiError::Http { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected Http(503), got {:?}", other),
        }
        resource_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_issuance_failure_is_auth_error() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", test_config(server.url()));

        let result = client.access_token().await;
        match result {
            Err(ApiError::Auth(msg)) => assert!(msg.contains("500"), "got: {}", msg),
            other => panic!("expected Auth error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_issuance_body_without_token_is_auth_error() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"message":"ok"}"#)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", test_config(server.url()));

        assert!(matches!(client.access_token().await, Err(ApiError::Auth(_))));
    }

    #[tokio::test]
    async fn test_reset_access_token_is_idempotent() {
        let mut server = mockito::Server::new_async().await;

        let token_mock = server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"idToken":"id-1"}"#)
            .expect(2)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", test_config(server.url()));

        client.access_token().await.expect("first mint");
        client.reset_access_token();
        client.reset_access_token();
        client.access_token().await.expect("second mint");

        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_data_part_unwraps_envelope() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/token/auth_refresh")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"idToken":"id-1"}"#)
            .create_async()
            .await;

        server
            .mock("GET", "/listed/info")
            .with_status(200)
            .with_body(r#"{"info":[{"Code":"1301","CompanyName":"KYOKUYO"}]}"#)
            .create_async()
            .await;

        let mut client = ApiClient::with_config("refresh-abc", test_config(server.url()));

        let data = client
            .fetch_data_part("/listed/info")
            .await
            .expect("data part should unwrap");
        assert_eq!(data, json!([{ "Code": "1301", "CompanyName": "KYOKUYO" }]));
    }
}
