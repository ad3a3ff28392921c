//! Inbound request shapes for the three mutating engine entry points.

use chrono::{DateTime, Duration, Utc};
use session_error::{Result, SessionError};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct CreateKeyRequest {
    pub public_key: String,
    pub max_per_tx: Option<String>,
    pub max_per_day: Option<String>,
    pub max_total: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in: Option<String>,
    pub valid_after: Option<DateTime<Utc>>,
    pub allowed_recipients: HashSet<String>,
    pub allowed_service_types: HashSet<String>,
    pub allowed_service_agents: HashSet<String>,
    pub allow_any: bool,
    pub scopes: HashSet<String>,
    pub label: Option<String>,
}

/// A delegation request, signed by the parent key over
/// [`session_crypto::delegation_message`].
#[derive(Debug, Clone, Default)]
pub struct DelegationRequest {
    pub child_public_key: String,
    pub max_per_tx: Option<String>,
    pub max_per_day: Option<String>,
    pub max_total: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub valid_after: Option<DateTime<Utc>>,
    /// `None` means "inherit the parent's set"; `Some(empty)` means "no
    /// recipients of this kind", which is distinct from inheritance.
    pub allowed_recipients: Option<HashSet<String>>,
    pub allowed_service_types: Option<HashSet<String>>,
    pub allowed_service_agents: Option<HashSet<String>>,
    pub allow_any: Option<bool>,
    pub scopes: Option<HashSet<String>>,
    pub label: Option<String>,
    pub nonce: u64,
    pub timestamp: i64,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct SignedSpendRequest {
    pub to: String,
    pub amount: String,
    pub service_id: Option<String>,
    pub nonce: u64,
    pub timestamp: i64,
    pub signature: String,
}

/// Parses the default 24h window, or an explicit instant, or a
/// relative token: `Nd` (days) or the standard `Nh`/`Nm`/`Ns`.
pub fn resolve_expiry(
    expires_at: Option<DateTime<Utc>>,
    expires_in: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    if let Some(at) = expires_at {
        return Ok(at);
    }
    match expires_in {
        Some(token) => Ok(now + parse_relative_duration(token)?),
        None => Ok(now + Duration::hours(24)),
    }
}

fn parse_relative_duration(token: &str) -> Result<Duration> {
    let token = token.trim();
    if token.len() < 2 {
        return Err(SessionError::InvalidExpiry(token.to_string()));
    }
    let (digits, unit) = token.split_at(token.len() - 1);
    let n: i64 = digits
        .parse()
        .map_err(|_| SessionError::InvalidExpiry(token.to_string()))?;
    match unit {
        "d" => Ok(Duration::days(n)),
        "h" => Ok(Duration::hours(n)),
        "m" => Ok(Duration::minutes(n)),
        "s" => Ok(Duration::seconds(n)),
        _ => Err(SessionError::InvalidExpiry(token.to_string())),
    }
}
