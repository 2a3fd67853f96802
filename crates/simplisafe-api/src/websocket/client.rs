// Event stream client
//
// One socket per client. `connect` opens it and identifies, `listen` owns
// the read half until the socket ends, `disconnect` tears everything down
// from any task. A lifecycle lock serializes connect/disconnect/reconnect
// so the watchdog, a token refresh and the caller cannot interleave.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::event::{
    CONNECTION_IDENTIFY, EVENT_STANDARD, EventEnvelope, EventPayload, WebsocketEvent, decode_event,
};
use crate::callbacks::{Callback, CallbackHandle, CallbackRegistry};
use crate::client::ApiClient;
use crate::error::Error;
use crate::watchdog::Watchdog;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;
type SocketStream = SplitStream<Socket>;

/// Lifecycle of the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Open and identified; nobody is reading yet.
    Connected,
    /// Open, with a task blocked in `listen()` owning the read half.
    Listening,
}

impl ConnectionState {
    /// `true` while a socket is open, whether or not it is being read.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Listening)
    }
}

/// Per-connection bookkeeping. Replaced on every reconnect.
struct Session {
    generation: u64,
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
}

enum Flow {
    Continue,
    Closed,
    Canceled,
}

struct Inner {
    api: Arc<ApiClient>,
    url: String,
    heartbeat_interval: Duration,

    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    next_generation: Mutex<u64>,
    lifecycle: tokio::sync::Mutex<()>,
    sink: tokio::sync::Mutex<Option<SocketSink>>,
    stream: tokio::sync::Mutex<Option<SocketStream>>,

    watchdog: Watchdog,
    refresh_listener: Mutex<Option<CallbackHandle>>,

    connect_callbacks: CallbackRegistry<Callback<()>>,
    disconnect_callbacks: CallbackRegistry<Callback<()>>,
    event_callbacks: CallbackRegistry<Callback<WebsocketEvent>>,
}

/// Client for the SimpliSafe push-event stream.
///
/// Cheap to clone; clones share one connection, so one task can block in
/// [`listen`](Self::listen) while another calls
/// [`disconnect`](Self::disconnect).
///
/// After every token refresh on the underlying [`ApiClient`] the stream
/// re-identifies with the new access token without dropping the socket.
#[derive(Clone)]
pub struct WebsocketClient {
    inner: Arc<Inner>,
}

impl WebsocketClient {
    pub fn new(api: Arc<ApiClient>) -> Self {
        let config = api.config();
        let url = config.websocket_url.clone();
        let heartbeat_interval = config.heartbeat_interval;
        let watchdog_timeout = config.watchdog_timeout;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_expiry = weak.clone();
            let watchdog = Watchdog::new(
                watchdog_timeout,
                Callback::from_async(move |()| {
                    let weak = on_expiry.clone();
                    async move {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        info!("no activity on websocket; reconnecting");
                        if let Err(e) = inner.reconnect().await {
                            warn!(error = %e, "websocket reconnect failed");
                        }
                    }
                }),
            );

            Inner {
                api,
                url,
                heartbeat_interval,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                next_generation: Mutex::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                sink: tokio::sync::Mutex::new(None),
                stream: tokio::sync::Mutex::new(None),
                watchdog,
                refresh_listener: Mutex::new(None),
                connect_callbacks: CallbackRegistry::default(),
                disconnect_callbacks: CallbackRegistry::default(),
                event_callbacks: CallbackRegistry::default(),
            }
        });

        let weak = Arc::downgrade(&inner);
        let handle = inner.api.add_refresh_token_callback(move |_refresh_token| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.state().is_open() {
                return;
            }
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { inner.reidentify().await });
                }
                Err(_) => warn!("token refreshed outside a runtime; stream keeps the old token"),
            }
        });
        *inner
            .refresh_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Self { inner }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.inner.api
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_open()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Open the stream and identify. No-op when already connected.
    pub async fn connect(&self) -> Result<(), Error> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.connect_locked().await
    }

    /// Receive until the socket ends.
    ///
    /// A close frame or the end of the stream returns `Ok(())`. A watchdog
    /// reconnect is followed transparently; an explicit
    /// [`disconnect`](Self::disconnect) makes this return `Ok(())`.
    pub async fn listen(&self) -> Result<(), Error> {
        self.inner.listen().await
    }

    /// Close the stream. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.teardown_locked().await;
    }

    /// Disconnect, then connect again.
    pub async fn reconnect(&self) -> Result<(), Error> {
        self.inner.reconnect().await
    }

    // ── Callbacks ────────────────────────────────────────────────────

    pub fn add_connect_callback(&self, f: impl Fn() + Send + Sync + 'static) -> CallbackHandle {
        self.inner
            .connect_callbacks
            .add(Callback::from_fn(move |_: &()| f()))
    }

    pub fn add_async_connect_callback<F, Fut>(&self, f: F) -> CallbackHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .connect_callbacks
            .add(Callback::from_async(move |()| f()))
    }

    pub fn add_disconnect_callback(&self, f: impl Fn() + Send + Sync + 'static) -> CallbackHandle {
        self.inner
            .disconnect_callbacks
            .add(Callback::from_fn(move |_: &()| f()))
    }

    pub fn add_async_disconnect_callback<F, Fut>(&self, f: F) -> CallbackHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .disconnect_callbacks
            .add(Callback::from_async(move |()| f()))
    }

    /// Sync event callbacks run on the listening task; keep them short.
    pub fn add_event_callback(
        &self,
        f: impl Fn(&WebsocketEvent) + Send + Sync + 'static,
    ) -> CallbackHandle {
        self.inner.event_callbacks.add(Callback::from_fn(f))
    }

    /// Async event callbacks are spawned and never block the receive loop.
    pub fn add_async_event_callback<F, Fut>(&self, f: F) -> CallbackHandle
    where
        F: Fn(WebsocketEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.event_callbacks.add(Callback::from_async(f))
    }
}

impl std::fmt::Debug for WebsocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketClient")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn current_session(&self) -> Option<(u64, CancellationToken)> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| (s.generation, s.cancel.clone()))
    }

    async fn reconnect(self: &Arc<Self>) -> Result<(), Error> {
        let _guard = self.lifecycle.lock().await;
        self.teardown_locked().await;
        self.connect_locked().await
    }

    // ── Connect ──────────────────────────────────────────────────────

    async fn connect_locked(self: &Arc<Self>) -> Result<(), Error> {
        if self.state().is_open() {
            debug!("already connected to websocket server");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.open().await {
            self.discard_socket().await;
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        self.set_state(ConnectionState::Connected);
        self.watchdog.trigger();
        info!(url = %self.url, "connected to websocket server");

        for callback in self.connect_callbacks.snapshot() {
            callback.dispatch(&());
        }
        Ok(())
    }

    async fn open(self: &Arc<Self>) -> Result<(), Error> {
        let identify = self.identify_message()?;
        let uri: tungstenite::http::Uri = self
            .url
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::CannotConnect(e.to_string()))?;
        let request = ClientRequestBuilder::new(uri).with_header(
            "User-Agent",
            self.api.config().transport.user_agent.as_str(),
        );

        debug!(url = %self.url, "connecting to websocket server");
        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::CannotConnect(e.to_string()))?;

        let (sink, stream) = socket.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);

        self.send_json(&identify).await.map_err(identify_failed)?;

        let generation = {
            let mut next = self
                .next_generation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            Arc::downgrade(self),
            self.heartbeat_interval,
            cancel.clone(),
        ));
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session {
            generation,
            cancel,
            heartbeat,
        });
        Ok(())
    }

    fn identify_message(&self) -> Result<Value, Error> {
        let not_authenticated = || Error::InvalidCredentials {
            message: "websocket requires an authenticated client".into(),
        };
        let token = self.api.access_token().ok_or_else(not_authenticated)?;
        let user_id = self.api.user_id().ok_or_else(not_authenticated)?;

        let now = Utc::now();
        Ok(json!({
            "datacontenttype": "application/json",
            "type": CONNECTION_IDENTIFY,
            "time": now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "id": format!("ts:{}", now.timestamp_millis()),
            "specversion": "1.0",
            "source": self.api.config().transport.user_agent,
            "data": {
                "auth": {
                    "schema": "bearer",
                    "token": token.expose_secret(),
                },
                "join": [format!("uid:{user_id}")],
            },
        }))
    }

    /// Re-send the identify message with the current access token.
    async fn reidentify(self: Arc<Self>) {
        let _guard = self.lifecycle.lock().await;
        if !self.state().is_open() {
            return;
        }
        let result = match self.identify_message() {
            Ok(message) => self.send_json(&message).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!("re-identified websocket with refreshed token"),
            Err(e) => warn!(error = %e, "failed to re-identify websocket"),
        }
    }

    async fn send_json(&self, payload: &Value) -> Result<(), Error> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(Error::NotConnected)?;

        trace!(kind = %payload["type"], "sending websocket message");
        sink.send(Message::text(payload.to_string()))
            .await
            .map_err(|e| match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    Error::ConnectionClosed {
                        code: 1006,
                        reason: e.to_string(),
                    }
                }
                other => Error::ConnectionFailed(other.to_string()),
            })
    }

    // ── Listen ───────────────────────────────────────────────────────

    async fn listen(self: &Arc<Self>) -> Result<(), Error> {
        let (mut stream, (mut generation, mut cancel)) = {
            let _guard = self.lifecycle.lock().await;
            self.claim_stream().await?
        };
        info!("listening to websocket server");

        loop {
            let flow = tokio::select! {
                biased;
                () = cancel.cancelled() => Ok(Flow::Canceled),
                frame = stream.next() => self.handle_frame(frame),
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Canceled) => {
                    drop(stream);
                    // A reconnect holds the lifecycle lock until the new
                    // socket is up; follow it if there is one.
                    let _guard = self.lifecycle.lock().await;
                    if !self.state().is_open() {
                        return Ok(());
                    }
                    match self.claim_stream().await {
                        Ok((next, (next_generation, next_cancel))) => {
                            debug!(generation = next_generation, "listening on new connection");
                            stream = next;
                            generation = next_generation;
                            cancel = next_cancel;
                        }
                        Err(_) => return Ok(()),
                    }
                }
                Ok(Flow::Closed) => {
                    drop(stream);
                    self.close_session(generation).await;
                    return Ok(());
                }
                Err(e) => {
                    drop(stream);
                    self.close_session(generation).await;
                    return Err(e);
                }
            }
        }
    }

    /// Take the read half of the live connection. Caller holds the
    /// lifecycle lock.
    async fn claim_stream(&self) -> Result<(SocketStream, (u64, CancellationToken)), Error> {
        let session = self.current_session().ok_or(Error::NotConnected)?;
        let stream = self.stream.lock().await.take().ok_or(Error::NotConnected)?;
        self.set_state(ConnectionState::Listening);
        Ok((stream, session))
    }

    fn handle_frame(&self, frame: Option<Result<Message, tungstenite::Error>>) -> Result<Flow, Error> {
        let message = match frame {
            None => {
                info!("websocket stream ended");
                return Ok(Flow::Closed);
            }
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                return Ok(Flow::Closed);
            }
            Some(Err(e)) => return Err(Error::ConnectionFailed(e.to_string())),
            Some(Ok(message)) => message,
        };

        match message {
            Message::Text(text) => {
                self.watchdog.trigger();
                let envelope: EventEnvelope = serde_json::from_str(text.as_str())
                    .map_err(|e| Error::InvalidMessage(format!("invalid JSON: {e}")))?;
                self.handle_envelope(envelope)?;
                Ok(Flow::Continue)
            }
            Message::Binary(data) => Err(Error::InvalidMessage(format!(
                "received non-text message ({} bytes)",
                data.len()
            ))),
            Message::Ping(_) | Message::Pong(_) => {
                trace!("websocket keepalive");
                self.watchdog.trigger();
                Ok(Flow::Continue)
            }
            Message::Close(frame) => {
                match frame {
                    Some(cf) => info!(code = %cf.code, reason = %cf.reason, "websocket close frame received"),
                    None => info!("websocket close frame received"),
                }
                Ok(Flow::Closed)
            }
            Message::Frame(_) => Ok(Flow::Continue),
        }
    }

    fn handle_envelope(&self, envelope: EventEnvelope) -> Result<(), Error> {
        if envelope.kind != EVENT_STANDARD {
            debug!(kind = %envelope.kind, "ignoring websocket message");
            return Ok(());
        }

        let payload = EventPayload::deserialize(envelope.data)
            .map_err(|e| Error::InvalidMessage(format!("malformed event payload: {e}")))?;
        let event = decode_event(&payload);
        debug!(
            event_type = ?event.event_type,
            system_id = event.system_id,
            "websocket event received"
        );

        for callback in self.event_callbacks.snapshot() {
            callback.dispatch(&event);
        }
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Tear down if `generation` is still the live connection.
    async fn close_session(&self, generation: u64) {
        let _guard = self.lifecycle.lock().await;
        if self.current_session().is_some_and(|(current, _)| current == generation) {
            self.teardown_locked().await;
        }
    }

    /// Close the live connection and fire disconnect callbacks. No-op when
    /// there is no live connection.
    async fn teardown_locked(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(session) = session else {
            return;
        };

        session.cancel.cancel();
        session.heartbeat.abort();
        self.watchdog.cancel();
        self.discard_socket().await;
        self.set_state(ConnectionState::Disconnected);
        info!(generation = session.generation, "disconnected from websocket server");

        for callback in self.disconnect_callbacks.snapshot() {
            callback.dispatch(&());
        }
    }

    /// Close and drop both socket halves.
    async fn discard_socket(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "websocket close handshake failed");
            }
        }
        self.stream.lock().await.take();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .refresh_listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.remove();
        }
        if let Some(session) = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            session.cancel.cancel();
            session.heartbeat.abort();
        }
    }
}

/// A failed identify means the handshake never completed.
fn identify_failed(err: Error) -> Error {
    match err {
        Error::ConnectionClosed { .. } | Error::ConnectionFailed(_) => {
            Error::CannotConnect(format!("identify failed: {err}"))
        }
        other => other,
    }
}

/// Keepalive: ping every `interval` until the session is canceled.
async fn heartbeat(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut sink = inner.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.send(Message::Ping(Default::default())).await {
            warn!(error = %e, "websocket keepalive failed");
            return;
        }
        trace!("websocket keepalive sent");
    }
}
