//
// lib.rs
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Closed error taxonomy for the session-key authorization engine.
//!
//! Every variant carries a stable, machine-readable `code()` alongside the
//! `Display` message. Callers (the orchestrator, HTTP layers outside this
//! crate) branch on the code, never on the message text.
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session key {0} was not found")]
    KeyNotFound(String),
    #[error("session key {0} already exists")]
    KeyAlreadyExists(String),
    #[error("session key {0} is revoked")]
    KeyRevoked(String),
    #[error("session key {0} is expired")]
    KeyExpired(String),
    #[error("session key {0} is not yet valid")]
    KeyNotYetValid(String),
    #[error("amount {amount} exceeds per-transaction cap {cap}")]
    ExceedsPerTx { amount: String, cap: String },
    #[error("amount {amount} would exceed daily cap {cap}")]
    ExceedsDaily { amount: String, cap: String },
    #[error("amount {amount} would exceed lifetime cap {cap}")]
    ExceedsTotal { amount: String, cap: String },
    #[error("recipient {0} is not allowed by this key's permission")]
    RecipientNotAllowed(String),
    #[error("service type {0} is not allowed by this key's permission")]
    ServiceTypeNotAllowed(String),
    #[error("signature is malformed or does not recover: {0}")]
    InvalidSignature(String),
    #[error("recovered signer does not match the key's public key")]
    SignatureMismatch,
    #[error("nonce {given} was already used or is not greater than {last_seen}")]
    NonceReused { given: u64, last_seen: u64 },
    #[error("signed request timestamp {0} is too old")]
    SignatureExpired(i64),
    #[error("signed request timestamp {0} is too far in the future")]
    InvalidTimestamp(i64),
    #[error("public key {0} is not a well-formed address")]
    InvalidPublicKey(String),
    #[error("amount {0} is not a valid positive decimal")]
    InvalidAmount(String),
    #[error("spending limit {label} has an invalid value: {reason}")]
    InvalidLimit { label: String, reason: String },
    #[error("expiry is invalid: {0}")]
    InvalidExpiry(String),
    #[error("at least one recipient gate (recipients, service types, service agents, or allow_any) must be set")]
    NoRecipientGate,
    #[error("scope {0} is not a recognized capability")]
    InvalidScope(String),
    #[error("key does not carry the required scope {0}")]
    ScopeNotAllowed(String),
    #[error("delegated scope {0} is not a subset of the parent's scopes")]
    ChildScopeNotAllowed(String),
    #[error("child max_total {child} exceeds parent's remaining budget {remaining}")]
    ChildExceedsParent { child: String, remaining: String },
    #[error("child service type set does not intersect the parent's")]
    ChildServiceNotAllowed,
    #[error("delegation depth {depth} exceeds the maximum of {max}")]
    MaxDepthExceeded { depth: u32, max: u32 },
    #[error("parent key {0} is not active")]
    ParentNotActive(String),
    #[error("ancestor key {0} is not active or could not be loaded")]
    AncestorInvalid(String),
    #[error("a public key is required to register a session key")]
    MissingPublicKey,
    #[error("session key {0} was already rotated")]
    KeyAlreadyRotated(String),
    #[error("no remaining budget to rotate into")]
    NoBudget,
    #[error("owner {given} does not own session key {key_id} (owned by {actual})")]
    Forbidden {
        key_id: String,
        given: String,
        actual: String,
    },
    #[error("insufficient balance to hold {amount} for {agent}")]
    InsufficientBalance { agent: String, amount: String },
    #[error("on-chain transfer failed: {0}")]
    TransferFailed(String),
    #[error("transfer succeeded (tx {tx_hash}) but ledger confirmation failed; usage not recorded")]
    PartialFailure { tx_hash: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Stable tagged code, matching the taxonomy in the specification's
    /// error-handling section. Callers should branch on this, not on
    /// `Display`'s human-readable message.
    pub fn code(&self) -> &'static str {
        use SessionError::*;
        match self {
            KeyNotFound(_) => "key_not_found",
            KeyAlreadyExists(_) => "key_already_exists",
            KeyRevoked(_) => "key_revoked",
            KeyExpired(_) => "key_expired",
            KeyNotYetValid(_) => "key_not_yet_valid",
            ExceedsPerTx { .. } => "exceeds_per_tx",
            ExceedsDaily { .. } => "exceeds_daily",
            ExceedsTotal { .. } => "exceeds_total",
            RecipientNotAllowed(_) => "recipient_not_allowed",
            ServiceTypeNotAllowed(_) => "service_type_not_allowed",
            InvalidSignature(_) => "invalid_signature",
            SignatureMismatch => "signature_mismatch",
            NonceReused { .. } => "nonce_reused",
            SignatureExpired(_) => "signature_expired",
            InvalidTimestamp(_) => "invalid_timestamp",
            InvalidPublicKey(_) => "invalid_public_key",
            InvalidAmount(_) => "invalid_amount",
            InvalidLimit { .. } => "invalid_limit",
            InvalidExpiry(_) => "invalid_expiry",
            NoRecipientGate => "no_recipient_gate",
            InvalidScope(_) => "invalid_scope",
            ScopeNotAllowed(_) => "scope_not_allowed",
            ChildScopeNotAllowed(_) => "child_scope_not_allowed",
            ChildExceedsParent { .. } => "child_exceeds_parent",
            ChildServiceNotAllowed => "child_service_not_allowed",
            MaxDepthExceeded { .. } => "max_depth_exceeded",
            ParentNotActive(_) => "parent_not_active",
            AncestorInvalid(_) => "ancestor_invalid",
            MissingPublicKey => "missing_public_key",
            KeyAlreadyRotated(_) => "key_already_rotated",
            NoBudget => "no_budget",
            Forbidden { .. } => "forbidden",
            InsufficientBalance { .. } => "insufficient_balance",
            TransferFailed(_) => "transfer_failed",
            PartialFailure { .. } => "partial_failure",
            Internal(_) => "internal_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::KeyNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
