// Authenticated REST client
//
// Wraps `reqwest::Client` with the vendor's headers, response
// classification and a retry loop that refreshes the access token on
// 401/403. Endpoint groups (subscriptions, ...) are implemented as
// inherent methods in separate files to keep this module focused on
// request mechanics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::auth::Grant;
use crate::callbacks::CallbackHandle;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::response::{ApiResponse, ErrorEnvelope, ErrorKind, classify};
use crate::token::{TokenGrant, TokenStore};
use crate::transport::JSON_CONTENT_TYPE;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthCheckResponse {
    user_id: u64,
}

/// Async client for the SimpliSafe REST API.
///
/// Owns the token store; every request goes through [`request`](Self::request),
/// which adds the bearer token, classifies the response and retries per the
/// configured [`RetryPolicy`](crate::RetryPolicy).
pub struct ApiClient {
    http: reqwest::Client,
    api_base: Url,
    auth_base: Url,
    config: ClientConfig,
    tokens: TokenStore,
    retries_enabled: AtomicBool,
    user_id: RwLock<Option<u64>>,
}

impl ApiClient {
    // ── Constructors ─────────────────────────────────────────────────

    /// Create an unauthenticated client, building the HTTP client from
    /// `config.transport`.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let http = config.transport.build_client()?;
        Self::with_client(http, config)
    }

    /// Create an unauthenticated client around a caller-managed
    /// `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, config: ClientConfig) -> Result<Self, Error> {
        let api_base = normalize_base(&config.api_base)?;
        let auth_base = normalize_base(&config.auth_base)?;
        let tokens = TokenStore::new(config.refresh_window);

        Ok(Self {
            http,
            api_base,
            auth_base,
            config,
            tokens,
            retries_enabled: AtomicBool::new(true),
            user_id: RwLock::new(None),
        })
    }

    /// Authenticate with an authorization code and its PKCE verifier.
    pub async fn from_authorization_code(
        code: &str,
        code_verifier: &str,
        config: ClientConfig,
    ) -> Result<Self, Error> {
        let client = Self::new(config)?;
        client
            .authenticate(Grant::AuthorizationCode {
                code: SecretString::from(code.to_owned()),
                code_verifier: SecretString::from(code_verifier.to_owned()),
            })
            .await?;
        Ok(client)
    }

    /// Authenticate with a stored refresh token.
    pub async fn from_refresh_token(refresh_token: &str, config: ClientConfig) -> Result<Self, Error> {
        let client = Self::new(config)?;
        client
            .authenticate(Grant::RefreshToken(SecretString::from(refresh_token.to_owned())))
            .await?;
        Ok(client)
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Current access token; `None` until the first authentication.
    pub fn access_token(&self) -> Option<SecretString> {
        self.tokens.access_token()
    }

    pub fn refresh_token(&self) -> Option<SecretString> {
        self.tokens.refresh_token()
    }

    /// When the current access token expires, if the server said.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.tokens.expires_at()
    }

    /// SimpliSafe user id, known after authentication.
    pub fn user_id(&self) -> Option<u64> {
        *self.user_id.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Enable or disable retries at runtime. Disabled means one attempt.
    pub fn set_retries_enabled(&self, enabled: bool) {
        self.retries_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn retries_enabled(&self) -> bool {
        self.retries_enabled.load(Ordering::Relaxed)
    }

    /// Register a callback invoked with the new refresh token after every
    /// successful refresh, before the refresh returns.
    pub fn add_refresh_token_callback(
        &self,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.tokens.add_listener(Arc::new(callback))
    }

    // ── Authentication ───────────────────────────────────────────────

    /// Exchange `grant` for tokens, install them and fetch the user id.
    pub async fn authenticate(&self, grant: Grant) -> Result<(), Error> {
        debug!(grant_type = grant.name(), "authenticating");
        let presented = match &grant {
            Grant::RefreshToken(token) => Some(token.clone()),
            Grant::AuthorizationCode { .. } => None,
        };

        self.tokens
            .authenticate(presented, || self.exchange(grant))
            .await?;

        let user_id = self.auth_check().await?;
        *self.user_id.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id);
        info!(user_id, "authenticated");
        Ok(())
    }

    /// Force a refresh of the access token.
    ///
    /// Serialized with any refresh triggered by in-flight requests; refresh
    /// listeners have been notified by the time this returns.
    pub async fn refresh_access_token(&self) -> Result<(), Error> {
        self.tokens
            .refresh(None, |refresh_token| {
                self.exchange(Grant::RefreshToken(refresh_token))
            })
            .await?;
        Ok(())
    }

    /// `GET api/authCheck` → the user id.
    pub async fn auth_check(&self) -> Result<u64, Error> {
        let resp: AuthCheckResponse = self.get("api/authCheck").await?;
        Ok(resp.user_id)
    }

    /// One `POST oauth/token` call. Never retried here: a rejected grant is
    /// `InvalidCredentials`, anything else is `RequestFailed`.
    async fn exchange(&self, grant: Grant) -> Result<TokenGrant, Error> {
        let url = self.auth_base.join("oauth/token")?;
        debug!(grant_type = grant.name(), "requesting tokens at {url}");

        let outcome = self
            .http
            .post(url.clone())
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(USER_AGENT, self.config.transport.user_agent.as_str())
            .json(&grant.to_body())
            .send()
            .await;

        let failed = |source: Error| Error::RequestFailed {
            endpoint: url.path().to_owned(),
            attempts: 1,
            source: Box::new(source),
        };

        let resp = outcome.map_err(|e| failed(Error::Transport(e)))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| failed(Error::Transport(e)))?;

        match classify(status, &body) {
            ApiResponse::Success(value) => decode(value),
            ApiResponse::Error(envelope) => match envelope.kind {
                ErrorKind::Unauthorized => Err(Error::InvalidCredentials {
                    message: envelope.message,
                }),
                _ => Err(failed(envelope_error(url.path(), envelope))),
            },
        }
    }

    // ── Request engine ───────────────────────────────────────────────

    /// Make an API request relative to the API base and return the parsed
    /// JSON body.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, Error> {
        self.request_with_query(method, path, &[], body).await
    }

    /// [`request`](Self::request) with query parameters.
    ///
    /// Generic failures are retried with exponential backoff. A 401/403
    /// triggers a coordinated token refresh and an immediate retry with the
    /// new token, counted against the same attempt budget. A rejected
    /// refresh or a plan restriction ends the request at once.
    pub async fn request_with_query(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, Error> {
        let url = self.api_base.join(path.trim_start_matches('/'))?;
        let attempts = self.config.retry.attempts(self.retries_enabled());

        let mut last_error: Option<Error> = None;
        let mut backoff_retry: Option<u32> = None;

        for attempt in 1..=attempts {
            if let Some(retry) = backoff_retry.take() {
                let delay = self.config.retry.backoff(retry);
                if !delay.is_zero() {
                    trace!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "backing off");
                    tokio::time::sleep(delay).await;
                }
            }

            let snapshot = self.tokens.snapshot();
            let err = match self
                .attempt(&method, &url, query, body, snapshot.access_token.as_ref())
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_auth_failure() {
                if snapshot.access_token.is_none() || attempt == attempts {
                    last_error = Some(err);
                    break;
                }

                info!(endpoint = path, attempt, "auth failure detected; refreshing token");
                match self
                    .tokens
                    .refresh(Some(snapshot.generation), |refresh_token| {
                        self.exchange(Grant::RefreshToken(refresh_token))
                    })
                    .await
                {
                    Ok(outcome) => {
                        debug!(?outcome, "retrying with current token");
                        last_error = Some(err);
                    }
                    Err(refresh_err) if refresh_err.is_invalid_credentials() => {
                        return Err(refresh_err);
                    }
                    Err(refresh_err) => {
                        warn!(error = %refresh_err, "token refresh failed");
                        last_error = Some(refresh_err);
                        backoff_retry = Some(attempt - 1);
                    }
                }
            } else if err.is_transient() {
                warn!(
                    endpoint = path,
                    attempt,
                    attempts,
                    error = %err,
                    "request failed"
                );
                last_error = Some(err);
                backoff_retry = Some(attempt - 1);
            } else {
                return Err(err);
            }
        }

        Err(match last_error {
            Some(err) if err.is_auth_failure() => Error::InvalidCredentials {
                message: format!("{path}: {err}"),
            },
            Some(err) => Error::RequestFailed {
                endpoint: path.to_owned(),
                attempts,
                source: Box::new(err),
            },
            None => Error::RequestFailed {
                endpoint: path.to_owned(),
                attempts,
                source: Box::new(Error::Api {
                    status: 0,
                    message: "no attempt was made".into(),
                }),
            },
        })
    }

    /// A single HTTP exchange, classified.
    async fn attempt(
        &self,
        method: &Method,
        url: &Url,
        query: &[(&str, String)],
        body: Option<&Value>,
        access_token: Option<&SecretString>,
    ) -> Result<Value, Error> {
        trace!("{method} {url}");

        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(USER_AGENT, self.config.transport.user_agent.as_str());
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;

        if body.is_some() {
            debug!(%method, %url, status, response = %text, "request with body completed");
        }

        match classify(status, &text) {
            ApiResponse::Success(value) => Ok(value),
            ApiResponse::Error(envelope) => Err(envelope_error(url.path(), envelope)),
        }
    }

    // ── Typed helpers ────────────────────────────────────────────────

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        decode(self.request(Method::GET, path, None).await?)
    }

    pub async fn get_with_params<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, Error> {
        decode(self.request_with_query(Method::GET, path, params, None).await?)
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let body = encode(body)?;
        decode(self.request(Method::POST, path, Some(&body)).await?)
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        decode(self.request(Method::DELETE, path, None).await?)
    }
}

/// Parse a base URL, making sure it ends with `/` so `join` appends.
fn normalize_base(raw: &str) -> Result<Url, Error> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn envelope_error(endpoint: &str, envelope: ErrorEnvelope) -> Error {
    match envelope.kind {
        ErrorKind::Unauthorized => Error::Unauthorized {
            status: envelope.status,
            message: envelope.message,
        },
        ErrorKind::EndpointUnavailable => Error::EndpointUnavailable {
            endpoint: endpoint.to_owned(),
        },
        ErrorKind::Other => Error::Api {
            status: envelope.status,
            message: envelope.message,
        },
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    T::deserialize(&value).map_err(|e| {
        let body = value.to_string();
        let preview: String = body.chars().take(200).collect();
        Error::Deserialization {
            message: format!("{e} (body preview: {preview:?})"),
            body,
        }
    })
}

fn encode<B: Serialize>(body: &B) -> Result<Value, Error> {
    serde_json::to_value(body).map_err(|e| Error::Deserialization {
        message: format!("failed to encode request body: {e}"),
        body: String::new(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_urls_gain_trailing_slash() {
        let url = normalize_base("http://127.0.0.1:8080/v1").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/v1/");
        assert_eq!(
            url.join("api/authCheck").unwrap().as_str(),
            "http://127.0.0.1:8080/v1/api/authCheck"
        );
    }

    #[test]
    fn envelope_maps_to_error_taxonomy() {
        let err = envelope_error(
            "/v1/ss3/subscriptions/1/settings",
            ErrorEnvelope {
                kind: ErrorKind::EndpointUnavailable,
                status: 403,
                message: "plan".into(),
            },
        );
        assert!(matches!(err, Error::EndpointUnavailable { .. }));

        let err = envelope_error(
            "/v1/api/authCheck",
            ErrorEnvelope {
                kind: ErrorKind::Other,
                status: 500,
                message: "boom".into(),
            },
        );
        assert!(err.is_transient());
    }

    #[test]
    fn decode_reports_body_preview() {
        let err = decode::<AuthCheckResponse>(serde_json::json!({"nope": 1})).unwrap_err();
        match err {
            Error::Deserialization { message, body } => {
                assert!(message.contains("userId"), "unexpected message: {message}");
                assert_eq!(body, r#"{"nope":1}"#);
            }
            other => panic!("expected Deserialization, got {other:?}"),
        }
    }
}
