#![allow(clippy::unwrap_used, dead_code)]
// Shared fixtures for the integration tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use simplisafe_api::{ApiClient, ClientConfig, RetryPolicy};

pub const USER_ID: u64 = 12345;
pub const AUTH_CODE: &str = "123abc";
pub const CODE_VERIFIER: &str = "verifier-xyz";

/// Config pointed at `server`, with instant retries and no freshness window.
pub fn config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        refresh_window: Duration::ZERO,
        ..ClientConfig::default()
    }
    .with_base_url(&server.uri())
}

pub fn token_body(access: &str, refresh: &str) -> Value {
    json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": 3600,
        "token_type": "Bearer"
    })
}

/// Mount the authorization-code exchange (→ A/B) and `authCheck`.
pub async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_partial_json(json!({
            "grant_type": "authorization_code",
            "code": AUTH_CODE,
            "code_verifier": CODE_VERIFIER,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("A", "B")))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/api/authCheck"))
        .and(header("Authorization", "Bearer A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"userId": USER_ID})))
        .mount(server)
        .await;
}

/// Mount a refresh of `refresh_token` answered with `status` and `body`.
pub async fn mount_refresh(
    server: &MockServer,
    refresh_token: &str,
    response: ResponseTemplate,
    expected_calls: u64,
) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_partial_json(json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        })))
        .respond_with(response)
        .expect(expected_calls)
        .mount(server)
        .await;
}

/// Start a mock API and return a client logged in as A/B.
pub async fn logged_in() -> (MockServer, ApiClient) {
    let server = MockServer::start().await;
    mount_login(&server).await;
    let client = ApiClient::from_authorization_code(AUTH_CODE, CODE_VERIFIER, config(&server))
        .await
        .unwrap();
    (server, client)
}

// ── Event stream server ─────────────────────────────────────────────

/// Server side of one accepted websocket connection.
pub struct ServerConnection {
    outgoing: mpsc::UnboundedSender<Message>,
    incoming: mpsc::UnboundedReceiver<Message>,
}

impl ServerConnection {
    pub fn send(&self, message: Message) {
        self.outgoing.send(message).unwrap();
    }

    pub fn send_json(&self, value: &Value) {
        self.send(Message::text(value.to_string()));
    }

    /// Next text frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.incoming.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client connection closed");
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }
}

/// Local websocket server handing each accepted connection to the test.
pub struct StreamServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl StreamServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(socket) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                let (mut sink, mut stream) = socket.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                let (in_tx, in_rx) = mpsc::unbounded_channel();

                tokio::spawn(async move {
                    while let Some(message) = out_rx.recv().await {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                });
                tokio::spawn(async move {
                    while let Some(Ok(message)) = stream.next().await {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                });

                let connection = ServerConnection {
                    outgoing: out_tx,
                    incoming: in_rx,
                };
                if conn_tx.send(connection).is_err() {
                    break;
                }
            }
        });

        Self { url, connections }
    }

    pub async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .unwrap()
    }

    /// `true` if a connection arrives within `wait`.
    pub async fn has_connection_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.connections.recv())
            .await
            .is_ok()
    }
}

/// A `com.simplisafe.event.standard` envelope.
pub fn standard_event(event_cid: u32) -> Value {
    json!({
        "data": {
            "eventCid": event_cid,
            "eventTimestamp": 1_632_957_286_000_i64,
            "info": "System Disarmed by Master PIN",
            "pinName": "Master PIN",
            "sensorName": "",
            "sensorSerial": "abcdef12",
            "sensorType": 1,
            "sid": USER_ID,
            "userId": USER_ID
        },
        "datacontenttype": "application/json",
        "id": "id:16803409109",
        "source": "messagequeue",
        "specversion": "1.0",
        "time": "2021-09-29T23:14:46.000Z",
        "type": "com.simplisafe.event.standard"
    })
}
