//! Transport layer for socket communication
//!
//! - `codec`: NDJSON encoding/decoding for messages
//! - `async_transport`: tokio client transport, subscriptions and the
//!   service-side connection

mod async_transport;
mod codec;

pub use async_transport::{AsyncTransport, ServiceConnection, Subscription};
pub use codec::encode_server_message;
