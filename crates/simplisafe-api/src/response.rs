// Response classification for the REST engine.
//
// The API is inconsistent about error shapes: some errors are objects,
// some are JSON-quoted strings served as application/json, some are plain
// text. Every body is normalized into a JSON value first, then a single
// function decides what kind of outcome the response represents.

use serde_json::{Map, Value};

/// `type` value the API uses when the account plan lacks an endpoint.
const NO_REMOTE_MANAGEMENT: &str = "NoRemoteManagement";

/// Classified outcome of one HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Success(Value),
    Error(ErrorEnvelope),
}

/// Why a response counts as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// HTTP 401/403: refresh the token and retry.
    Unauthorized,
    /// The plan does not include this endpoint: never retried.
    EndpointUnavailable,
    /// Anything else: retried per policy.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

/// Normalize a raw response body into a JSON value.
///
/// - empty body → `null`
/// - JSON string (e.g. `"\"Unauthorized\""`) → `{"error": "Unauthorized"}`
/// - non-JSON text → `{"error": <text>}`
/// - any other JSON → unchanged
pub fn normalize_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::String(message)) => error_object(message.replace('"', "")),
        Ok(value) => value,
        Err(_) => error_object(body.to_owned()),
    }
}

fn error_object(message: String) -> Value {
    let mut map = Map::new();
    map.insert("error".into(), Value::String(message));
    Value::Object(map)
}

/// Classify a status code and raw body.
pub fn classify(status: u16, body: &str) -> ApiResponse {
    let payload = normalize_body(body);

    if (200..300).contains(&status) {
        return ApiResponse::Success(payload);
    }

    let kind = if payload.get("type").and_then(Value::as_str) == Some(NO_REMOTE_MANAGEMENT) {
        ErrorKind::EndpointUnavailable
    } else if status == 401 || status == 403 {
        ErrorKind::Unauthorized
    } else {
        ErrorKind::Other
    };

    ApiResponse::Error(ErrorEnvelope {
        kind,
        status,
        message: error_message(&payload).unwrap_or_else(|| format!("HTTP {status}")),
    })
}

fn error_message(payload: &Value) -> Option<String> {
    ["error_description", "error", "message"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .filter(|message| !message.is_empty())
        .map(str::to_owned)
}
