//! Audit trail entries for delegation-tree mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use session_amount::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationEvent {
    Create,
    Revoke,
    CascadeRevoke,
    Rotate,
    BudgetExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationLogEntry {
    /// Assigned by the logger, monotonically increasing.
    pub id: u64,
    pub event: DelegationEvent,
    pub parent_id: Option<String>,
    pub child_id: Option<String>,
    pub root_id: String,
    pub owner_addr: String,
    pub depth: u32,
    pub amount: Option<Amount>,
    pub reason: Option<String>,
    pub ancestor_chain: Vec<String>,
    pub at: DateTime<Utc>,
}
