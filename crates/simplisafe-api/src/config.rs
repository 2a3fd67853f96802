// ── Runtime client configuration ──
//
// These types describe *how* to talk to the SimpliSafe cloud. They carry
// endpoints and tuning knobs only; credentials are passed to the
// constructors and nothing here touches disk or the environment.

use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::transport::TransportConfig;

/// Base URL for the REST API.
pub const API_URL_BASE: &str = "https://api.simplisafe.com/v1/";

/// Base URL for the OAuth endpoints.
pub const AUTH_URL_BASE: &str = "https://auth.simplisafe.com/";

/// The push-event endpoint.
pub const WEBSOCKET_SERVER_URL: &str = "wss://socketlink.prd.aser.simplisafe.com";

/// User agent the vendor's web app sends; the API rejects unknown agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_6) \
     AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.1.2 Safari/605.1.15";

/// Configuration for a single [`ApiClient`](crate::ApiClient) and the
/// [`WebsocketClient`](crate::WebsocketClient) built on top of it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base, e.g. `https://api.simplisafe.com/v1/`.
    pub api_base: String,
    /// OAuth base, e.g. `https://auth.simplisafe.com/`.
    pub auth_base: String,
    /// Event stream URL.
    pub websocket_url: String,
    /// HTTP client settings (timeout, user agent).
    pub transport: TransportConfig,
    /// Retry/backoff policy for REST calls.
    pub retry: RetryPolicy,
    /// A request that hits 401 within this long after the last successful
    /// refresh reuses the current token instead of refreshing again.
    pub refresh_window: Duration,
    /// Inactivity period after which the event stream is reconnected.
    pub watchdog_timeout: Duration,
    /// Interval between keepalive pings on the event stream.
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: API_URL_BASE.into(),
            auth_base: AUTH_URL_BASE.into(),
            websocket_url: WEBSOCKET_SERVER_URL.into(),
            transport: TransportConfig::default(),
            retry: RetryPolicy::default(),
            refresh_window: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(5 * 60),
            heartbeat_interval: Duration::from_secs(55),
        }
    }
}

impl ClientConfig {
    /// Point both REST bases at a single server (mock servers, proxies).
    pub fn with_base_url(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.api_base = format!("{base}/v1/");
        self.auth_base = format!("{base}/");
        self
    }
}
