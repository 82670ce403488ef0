//! Queued mutations and their lifecycle.
//!
//! A `QueuedCommand` is a mutation that could not be confirmed against
//! the cloud at the time it was made. It lives in the local command
//! queue until the replay engine drains it, and is never mutated by UI
//! code.

use crate::ids::{CommandId, DeviceId, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A POS mutation, as a closed set of variants.
///
/// Dispatch in the replay engine is an exhaustive match on this enum;
/// an unknown entity type is unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "body", rename_all = "snake_case")]
pub enum CommandAction {
    /// Create a new order.
    CreateOrder { payload: serde_json::Value },
    /// Add a line item to an existing (possibly placeholder) order.
    AddOrderItem {
        order_id: String,
        payload: serde_json::Value,
    },
    /// Record a payment against an order.
    RecordPayment {
        order_id: String,
        payload: serde_json::Value,
    },
    /// Bump a kitchen-display ticket at a station.
    BumpTicket { station: String, ticket_id: String },
    /// Adjust inventory levels.
    AdjustInventory { payload: serde_json::Value },
}

impl CommandAction {
    /// The entity type this action mutates, for audit rows and stats.
    #[must_use]
    pub fn entity_type(&self) -> &'static str {
        match self {
            CommandAction::CreateOrder { .. } => "order",
            CommandAction::AddOrderItem { .. } => "order_item",
            CommandAction::RecordPayment { .. } => "payment",
            CommandAction::BumpTicket { .. } => "kds_ticket",
            CommandAction::AdjustInventory { .. } => "inventory",
        }
    }

    /// Short action name, for audit rows.
    #[must_use]
    pub fn action_name(&self) -> &'static str {
        match self {
            CommandAction::CreateOrder { .. } => "create",
            CommandAction::AddOrderItem { .. } => "add_item",
            CommandAction::RecordPayment { .. } => "pay",
            CommandAction::BumpTicket { .. } => "bump",
            CommandAction::AdjustInventory { .. } => "adjust",
        }
    }

    /// Returns true if this action creates a record whose server ID
    /// other commands may depend on.
    #[must_use]
    pub fn is_create(&self) -> bool {
        matches!(self, CommandAction::CreateOrder { .. })
    }
}

/// Status of a queued command.
///
/// Legal transitions: Pending → Processing → {Synced | Pending} and,
/// once the retry budget is exhausted, Processing → Failed. Synced and
/// Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Processing,
    Synced,
    Failed,
}

impl CommandStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Synced) | (Processing, Pending) | (Processing, Failed)
        )
    }

    /// Whether this status will never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Synced | CommandStatus::Failed)
    }

    /// Stable string form used in the store and audit log.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Processing => "PROCESSING",
            CommandStatus::Synced => "SYNCED",
            CommandStatus::Failed => "FAILED",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CommandStatus::Pending),
            "PROCESSING" => Some(CommandStatus::Processing),
            "SYNCED" => Some(CommandStatus::Synced),
            "FAILED" => Some(CommandStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command waiting in (or finished with) the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedCommand {
    /// Store-assigned row ID.
    pub id: CommandId,
    /// Client-generated idempotency key, unique for the record's lifetime.
    pub request_id: RequestId,
    /// The mutation itself.
    pub action: CommandAction,
    /// Creation time, milliseconds since Unix epoch. Replay order.
    pub timestamp: i64,
    /// Current lifecycle status.
    pub status: CommandStatus,
    /// Number of replay attempts that have failed so far. Never decreases.
    pub retry_count: u32,
    /// Device that originated the mutation.
    pub device_id: DeviceId,
    /// True when this copy arrived via mesh replication. Replicated
    /// copies are never re-replicated.
    pub replicated: bool,
    /// Server response body from a successful replay, if any.
    pub result: Option<serde_json::Value>,
    /// When the command reached Synced, milliseconds since Unix epoch.
    pub synced_at: Option<i64>,
}

/// Fields the caller supplies when enqueueing; the store assigns the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommand {
    pub request_id: RequestId,
    pub action: CommandAction,
    pub device_id: DeviceId,
    #[serde(default)]
    pub replicated: bool,
}

impl NewCommand {
    /// Creates a new locally originated command with a fresh request ID.
    #[must_use]
    pub fn local(action: CommandAction, device_id: DeviceId) -> Self {
        Self {
            request_id: RequestId::new(),
            action,
            device_id,
            replicated: false,
        }
    }

    /// Marks this command as a replicated copy from another device.
    #[must_use]
    pub fn replicated(mut self) -> Self {
        self.replicated = true;
        self
    }
}
