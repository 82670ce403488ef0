//! Cloud API client and idempotent replay engine.
//!
//! The replay engine drains the durable command queue against the
//! cloud REST API. Consistency is achieved entirely through
//! idempotency keys and at-least-once delivery: every attempt carries
//! the command's `request_id` as `X-Idempotency-Key`, so a retried
//! call produces no duplicate server-side effect even when an earlier
//! attempt succeeded but the acknowledgment was lost.
//!
//! Failures are classified: 4xx responses are terminal (a validation
//! error cannot succeed on retry), 5xx and network failures consume
//! the bounded retry budget.

mod client;
mod engine;
mod error;

pub use client::{CloudClient, CloudConfig};
pub use engine::{CycleReport, ReplayConfig, ReplayEngine};
pub use error::{CloudError, CloudResult};
