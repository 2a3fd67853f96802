// Shared transport configuration for building the reqwest::Client.
//
// The REST engine and the token exchange share one client; callers that
// manage their own client pass it to `ApiClient::with_client` instead.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};

use crate::config::DEFAULT_USER_AGENT;
use crate::error::Error;

/// Content type the API expects on every call.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.into(),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    ///
    /// `Content-Type` and `User-Agent` are installed as default headers;
    /// the bearer token is added per request since it rotates.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(Error::Transport)
    }
}
