//! Edge-gateway client.
//!
//! The edge gateway is a venue-local server acting as a trusted
//! intermediary when the cloud is unreachable. This crate covers the
//! device side: a configuration-gated health probe, pass-through reads
//! of the gateway's cache, forwarding mutations into the gateway's
//! durable queue, and a persistent WebSocket session with registration,
//! heartbeats, and automatic reconnect.

mod client;
mod error;
mod protocol;
mod session;

pub use client::{GatewayClient, GatewayConfig, GatewayQueueStats};
pub use error::{GatewayError, GatewayResult};
pub use protocol::GatewayMessage;
pub use session::{GatewayEvent, GatewaySession};
