//! Push-event stream.
//!
//! [`WebsocketClient`] keeps a persistent connection to the vendor's event
//! endpoint and hands decoded [`WebsocketEvent`]s to registered callbacks.

mod client;
pub mod event;

pub use client::{ConnectionState, WebsocketClient};
pub use event::{DeviceType, EventPayload, EventType, WebsocketEvent, decode_event};
