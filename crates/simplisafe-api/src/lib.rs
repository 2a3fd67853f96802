// simplisafe-api: Async Rust client for the SimpliSafe cloud (REST + event stream)

pub mod auth;
pub mod callbacks;
pub mod client;
pub mod config;
pub mod error;
pub mod response;
pub mod retry;
pub mod subscriptions;
pub mod token;
pub mod transport;
pub mod watchdog;
pub mod websocket;

pub use auth::Grant;
pub use callbacks::{Callback, CallbackHandle, CallbackId};
pub use client::ApiClient;
pub use config::ClientConfig;
pub use error::Error;
pub use retry::RetryPolicy;
pub use subscriptions::Subscription;
pub use token::{RefreshOutcome, TokenGrant};
pub use transport::TransportConfig;
pub use watchdog::Watchdog;
pub use websocket::{ConnectionState, WebsocketClient, WebsocketEvent};
