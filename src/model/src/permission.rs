//! The declarative envelope a session key carries: spending caps,
//! validity window, recipient gating, and capability scopes.

use crate::scope::{default_scopes, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use session_amount::Amount;
use session_error::{Result, SessionError};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub max_per_tx: Option<Amount>,
    pub max_per_day: Option<Amount>,
    pub max_total: Option<Amount>,
    pub expires_at: DateTime<Utc>,
    pub valid_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allowed_recipients: HashSet<String>,
    #[serde(default)]
    pub allowed_service_types: HashSet<String>,
    #[serde(default)]
    pub allowed_service_agents: HashSet<String>,
    #[serde(default)]
    pub allow_any: bool,
    #[serde(default = "default_scopes")]
    pub scopes: HashSet<Scope>,
    pub label: Option<String>,
}

impl Permission {
    /// At least one recipient gate must be present: a non-empty
    /// recipient/service-type/service-agent set, or `allow_any`.
    pub fn has_recipient_gate(&self) -> bool {
        self.allow_any
            || !self.allowed_recipients.is_empty()
            || !self.allowed_service_types.is_empty()
            || !self.allowed_service_agents.is_empty()
    }

    /// Effective scope set: explicit scopes, or the default `{spend,
    /// read}` when none were set.
    pub fn effective_scopes(&self) -> HashSet<Scope> {
        if self.scopes.is_empty() {
            default_scopes()
        } else {
            self.scopes.clone()
        }
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.effective_scopes().contains(&scope)
    }

    /// Validates this permission's shape in isolation (not against a
    /// parent) — used at creation time (§4.5.1).
    pub fn validate_standalone(&self) -> Result<()> {
        if !self.has_recipient_gate() {
            return Err(SessionError::NoRecipientGate);
        }
        for scope in &self.scopes {
            if !Scope::ALL.contains(scope) {
                return Err(SessionError::InvalidScope(scope.to_string()));
            }
        }
        Ok(())
    }
}
