//! Resilience orchestrator.
//!
//! Ties the durable queue, replay engine, edge-gateway client, and
//! device-mesh client together: polls reachability, derives the
//! operating mode with strict precedence (online, then edge, then
//! mesh, then device), fires mode-entry side effects, and routes
//! command submission through whichever tier is current.

mod mode;
mod orchestrator;

pub use mode::decide_mode;
pub use orchestrator::{OrchestratorConfig, ResilienceOrchestrator, SubmitOutcome};
