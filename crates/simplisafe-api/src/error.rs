use thiserror::Error;

/// Top-level error type for the `simplisafe-api` crate.
///
/// Covers every failure mode across the REST engine and the event stream.
/// Decode-time anomalies (unknown event codes, unknown device types) are
/// never errors; they surface as `Unknown` values instead.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Authentication or token refresh rejected by the server (401/403),
    /// or no usable credentials are left. The caller must re-authenticate.
    #[error("Invalid credentials: {message}")]
    InvalidCredentials { message: String },

    /// The account's plan does not include the requested endpoint.
    #[error("Endpoint unavailable in plan: {endpoint}")]
    EndpointUnavailable { endpoint: String },

    // ── Request engine ──────────────────────────────────────────────
    /// A request kept failing until the retry budget ran out.
    #[error("Requesting {endpoint} failed after {attempts} attempt(s): {source}")]
    RequestFailed {
        endpoint: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Non-2xx response from the API that is not an auth failure.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// An authenticated call was answered with 401/403. Consumed by the
    /// retry layer; only surfaces wrapped inside [`Error::RequestFailed`].
    #[error("Unauthorized (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Event stream ────────────────────────────────────────────────
    /// The event stream could not be opened.
    #[error("Cannot connect to websocket: {0}")]
    CannotConnect(String),

    /// The server closed the event stream.
    #[error("Websocket closed (code {code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    /// The event stream errored while listening.
    #[error("Websocket connection failed: {0}")]
    ConnectionFailed(String),

    /// A non-text or non-JSON frame arrived on the event stream.
    #[error("Invalid websocket message: {0}")]
    InvalidMessage(String),

    /// An operation needed an open event stream.
    #[error("Not connected to the websocket server")]
    NotConnected,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` for 401/403-class failures that a token refresh
    /// might resolve.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_builder() && !e.is_decode(),
            Self::Api { .. } => true,
            Self::CannotConnect(_) => true,
            _ => false,
        }
    }

    /// Returns `true` if the caller has to authenticate from scratch.
    pub fn is_invalid_credentials(&self) -> bool {
        match self {
            Self::InvalidCredentials { .. } => true,
            Self::RequestFailed { source, .. } => source.is_invalid_credentials(),
            _ => false,
        }
    }

    /// HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Unauthorized { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::RequestFailed { source, .. } => source.status(),
            _ => None,
        }
    }
}
