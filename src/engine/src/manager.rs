//! The authorization engine: creation, delegation, revocation,
//! rotation, and signed-spend validation/recording (§4.5).

use crate::config::EngineConfig;
use crate::request::{resolve_expiry, CreateKeyRequest, DelegationRequest, SignedSpendRequest};
use crate::service_resolver::ServiceResolver;
use crate::tree::{build_subtree, DelegationNode};
use chrono::{DateTime, Utc};
use session_amount::Amount;
use session_crypto as crypto;
use session_error::{Result, SessionError};
use session_lock::LockManager;
use session_model::{scope::parse_scope_set, DelegationEvent, DelegationLogEntry, Permission, Scope, SessionKey, Usage};
use session_store::{CancellationToken, DelegationAuditLogger, Store};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Manager {
    store: Arc<dyn Store>,
    locks: LockManager,
    audit: Option<Arc<dyn DelegationAuditLogger>>,
    resolver: Option<Arc<dyn ServiceResolver>>,
    config: EngineConfig,
}

impl Manager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Manager {
            store,
            locks: LockManager::new(),
            audit: None,
            resolver: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_audit_log(mut self, audit: Arc<dyn DelegationAuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_service_resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn audit_log(&self, entry: DelegationLogEntry) {
        if let Some(audit) = &self.audit {
            audit.append(entry).await;
        }
    }

    // ---- exposed read surface (§6.2 Manager) -----------------------

    pub async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<SessionKey> {
        self.store
            .get(id, cancel)
            .await?
            .ok_or_else(|| SessionError::KeyNotFound(id.to_string()))
    }

    pub async fn list(&self, owner_addr: &str, cancel: &CancellationToken) -> Result<Vec<SessionKey>> {
        let mut keys = self.store.get_by_owner(owner_addr, cancel).await?;
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    pub async fn count_active(&self, owner_addr: &str, cancel: &CancellationToken) -> Result<u64> {
        self.store.count_active(owner_addr, Utc::now(), cancel).await
    }

    pub async fn subtree(&self, root_id: &str, cancel: &CancellationToken) -> Result<Option<DelegationNode>> {
        build_subtree(
            self.store.as_ref(),
            root_id,
            self.config.tree_traversal_depth_guard,
            Utc::now(),
            cancel,
        )
        .await
    }

    pub async fn lock_key(&self, id: &str) -> session_lock::ChainGuard {
        self.locks.lock_key(id).await
    }

    pub async fn lock_chain(&self, id: &str, cancel: &CancellationToken) -> Result<session_lock::ChainGuard> {
        self.locks.lock_chain(id, self.store.as_ref(), cancel).await
    }

    /// Pure capability check (§4.5.9): does this key carry `scope`?
    pub async fn validate_scope(&self, id: &str, scope: Scope, cancel: &CancellationToken) -> Result<()> {
        let key = self.get(id, cancel).await?;
        if key.permission.has_scope(scope) {
            Ok(())
        } else {
            Err(SessionError::ScopeNotAllowed(scope.to_string()))
        }
    }

    // ---- 4.5.1 create -----------------------------------------------

    pub async fn create(
        &self,
        owner_addr: &str,
        request: CreateKeyRequest,
        cancel: &CancellationToken,
    ) -> Result<SessionKey> {
        if request.public_key.is_empty() {
            return Err(SessionError::MissingPublicKey);
        }
        let public_key = crypto::parse_address(&request.public_key)?;
        let owner_addr = crypto::parse_address(owner_addr)?;

        let now = Utc::now();
        let expires_at = resolve_expiry(request.expires_at, request.expires_in.as_deref(), now)?;
        if expires_at <= now {
            return Err(SessionError::InvalidExpiry(
                "expires_at must be in the future".to_string(),
            ));
        }

        let max_per_tx = parse_cap("max_per_tx", request.max_per_tx.as_deref())?;
        let max_per_day = parse_cap("max_per_day", request.max_per_day.as_deref())?;
        let max_total = parse_cap("max_total", request.max_total.as_deref())?;
        let scopes = parse_scope_set(request.scopes.iter().map(String::as_str))?;

        let permission = Permission {
            max_per_tx,
            max_per_day,
            max_total,
            expires_at,
            valid_after: request.valid_after,
            allowed_recipients: lowercase_set(&request.allowed_recipients),
            allowed_service_types: request.allowed_service_types.clone(),
            allowed_service_agents: lowercase_set(&request.allowed_service_agents),
            allow_any: request.allow_any,
            scopes,
            label: request.label.clone(),
        };
        permission.validate_standalone()?;

        let id = SessionKey::generate_id();
        let key = SessionKey {
            id: id.clone(),
            owner_addr: owner_addr.clone(),
            public_key,
            permission,
            usage: Usage::zero(now.date_naive()),
            created_at: now,
            revoked_at: None,
            parent_key_id: None,
            depth: 0,
            root_key_id: None,
            delegation_label: request.label,
            rotated_from_id: None,
            rotated_to_id: None,
            rotation_grace_end: None,
        };

        self.store.create(key.clone(), cancel).await?;
        info!(key_id = %id, owner = %owner_addr, "created session key");

        self.audit_log(DelegationLogEntry {
            id: 0,
            event: DelegationEvent::Create,
            parent_id: None,
            child_id: Some(id.clone()),
            root_id: id.clone(),
            owner_addr,
            depth: 0,
            amount: None,
            reason: None,
            ancestor_chain: vec![id.clone()],
            at: now,
        })
        .await;

        Ok(key)
    }

    // ---- 4.5.2 revoke (cascading) -------------------------------------

    pub async fn revoke(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lock_chain(id, cancel).await?;
        let now = Utc::now();
        self.revoke_one(id, now, cancel, DelegationEvent::Revoke, vec![id.to_string()])
            .await?;
        self.cascade_revoke_children(id, now, cancel, vec![id.to_string()])
            .await;
        Ok(())
    }

    async fn revoke_one(
        &self,
        id: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        event: DelegationEvent,
        ancestor_chain: Vec<String>,
    ) -> Result<()> {
        let mut key = self.get(id, cancel).await?;
        key.revoked_at = Some(now);
        let root_id = key.root_id().to_string();
        let owner_addr = key.owner_addr.clone();
        let depth = key.depth;
        self.store.update(key, cancel).await?;
        info!(key_id = %id, "revoked session key");
        self.audit_log(DelegationLogEntry {
            id: 0,
            event,
            parent_id: None,
            child_id: Some(id.to_string()),
            root_id,
            owner_addr,
            depth,
            amount: None,
            reason: None,
            ancestor_chain,
            at: now,
        })
        .await;
        Ok(())
    }

    /// Best-effort: a failure revoking one descendant does not stop the
    /// rest of the subtree from being walked.
    fn cascade_revoke_children<'a>(
        &'a self,
        parent_id: &'a str,
        now: DateTime<Utc>,
        cancel: &'a CancellationToken,
        ancestor_chain: Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let children = match self.store.get_by_parent(parent_id, cancel).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(parent_id = %parent_id, error = %e, "cascade revoke: failed to list children");
                    return;
                }
            };
            for child in children {
                let mut chain = ancestor_chain.clone();
                chain.push(child.id.clone());
                if let Err(e) = self
                    .revoke_one(&child.id, now, cancel, DelegationEvent::CascadeRevoke, chain.clone())
                    .await
                {
                    warn!(child_id = %child.id, error = %e, "cascade revoke: failed to revoke descendant");
                    continue;
                }
                self.cascade_revoke_children(&child.id, now, cancel, chain).await;
            }
        })
    }

    // ---- 4.5.3 create_delegated ---------------------------------------

    pub async fn create_delegated(
        &self,
        parent_id: &str,
        request: DelegationRequest,
        cancel: &CancellationToken,
    ) -> Result<SessionKey> {
        let _guard = self.locks.lock_key(parent_id).await;
        let now = Utc::now();

        // 1. parent exists and is active.
        let parent = self.get(parent_id, cancel).await?;
        if !parent.is_active(now) {
            return Err(SessionError::ParentNotActive(parent_id.to_string()));
        }

        // 2. if parent has an ancestor, the chain must be active (budget
        // not yet checked here).
        if let Some(grandparent_id) = &parent.parent_key_id {
            self.validate_ancestor_chain_from(grandparent_id, None, cancel).await?;
        }

        // 3. signature over the delegation message recovers to the parent.
        let child_public_key = crypto::parse_address(&request.child_public_key)?;
        let max_total_str = request
            .max_total
            .clone()
            .unwrap_or_else(|| Amount::ZERO_STR.to_string());
        let message = crypto::delegation_message(&child_public_key, &max_total_str, request.nonce, request.timestamp);
        crypto::verify(&message, &request.signature, &parent.public_key)?;

        // 4. nonce strictly greater than parent's last_nonce.
        if request.nonce <= parent.usage.last_nonce {
            return Err(SessionError::NonceReused {
                given: request.nonce,
                last_seen: parent.usage.last_nonce,
            });
        }

        // 5. timestamp freshness.
        check_timestamp(request.timestamp, now, &self.config)?;

        // 6. depth bound.
        let child_depth = parent.depth + 1;
        if child_depth > self.config.max_delegation_depth {
            return Err(SessionError::MaxDepthExceeded {
                depth: child_depth,
                max: self.config.max_delegation_depth,
            });
        }

        // 7. budget narrowing against parent's remaining, less siblings'
        // uncommitted allocations.
        let child_max_total = match &request.max_total {
            Some(raw) => Some(Amount::parse_positive(raw).map_err(|e| invalid_limit("max_total", e))?),
            None => None,
        };
        if let (Some(parent_cap), Some(child_cap)) = (&parent.permission.max_total, &child_max_total) {
            let parent_remaining = parent_cap
                .checked_sub(&parent.usage.total_spent)
                .unwrap_or_else(Amount::zero);
            let siblings = self.store.get_by_parent(parent_id, cancel).await?;
            let mut committed = Amount::zero();
            for sibling in &siblings {
                if !sibling.is_active(now) {
                    continue;
                }
                if let Some(sib_cap) = &sibling.permission.max_total {
                    let uncommitted = sib_cap.checked_sub(&sibling.usage.total_spent).unwrap_or_else(Amount::zero);
                    committed = committed.add(&uncommitted);
                }
            }
            let available = parent_remaining.checked_sub(&committed).unwrap_or_else(Amount::zero);
            if child_cap.cmp_amount(&available).is_gt() {
                return Err(SessionError::ChildExceedsParent {
                    child: child_cap.format(),
                    remaining: available.format(),
                });
            }
        } else if child_max_total.is_none() && parent.permission.max_total.is_some() {
            return Err(SessionError::InvalidLimit {
                label: "max_total".to_string(),
                reason: "parent has a lifetime cap; child must declare one".to_string(),
            });
        }

        let child_max_per_tx = narrow_cap("max_per_tx", request.max_per_tx.as_deref(), &parent.permission.max_per_tx)?;
        let child_max_per_day = narrow_cap("max_per_day", request.max_per_day.as_deref(), &parent.permission.max_per_day)?;

        // 8. recipient/service-type gating: inherit or narrow.
        let allowed_service_types = narrow_set(request.allowed_service_types, &parent.permission.allowed_service_types, "service type", SessionError::ChildServiceNotAllowed)?;
        let allowed_recipients = narrow_set(
            request.allowed_recipients.map(|s| lowercase_set(&s)),
            &parent.permission.allowed_recipients,
            "recipient",
            SessionError::RecipientNotAllowed("*".to_string()),
        )?;
        let allowed_service_agents = narrow_set(
            request.allowed_service_agents.map(|s| lowercase_set(&s)),
            &parent.permission.allowed_service_agents,
            "service agent",
            SessionError::RecipientNotAllowed("*".to_string()),
        )?;
        let allow_any = match request.allow_any {
            Some(true) if !parent.permission.allow_any => false,
            Some(v) => v && parent.permission.allow_any,
            None => parent.permission.allow_any
                && request.allowed_recipients.is_none()
                && request.allowed_service_types.is_none()
                && request.allowed_service_agents.is_none(),
        };

        // 9. scopes: inherit or subset.
        let parent_scopes = parent.permission.effective_scopes();
        let scopes = match request.scopes {
            Some(raw) => {
                let requested = parse_scope_set(raw.iter().map(String::as_str))?;
                for scope in &requested {
                    if !parent_scopes.contains(scope) {
                        return Err(SessionError::ChildScopeNotAllowed(scope.to_string()));
                    }
                }
                requested
            }
            None => parent_scopes.clone(),
        };

        // 10. expiry cannot exceed parent's.
        let expires_at = match request.expires_at {
            Some(at) => {
                if at > parent.permission.expires_at {
                    return Err(SessionError::InvalidExpiry(
                        "child expiry exceeds parent expiry".to_string(),
                    ));
                }
                at
            }
            None => parent.permission.expires_at,
        };

        let permission = Permission {
            max_per_tx: child_max_per_tx,
            max_per_day: child_max_per_day,
            max_total: child_max_total,
            expires_at,
            valid_after: request.valid_after,
            allowed_recipients,
            allowed_service_types,
            allowed_service_agents,
            allow_any,
            scopes,
            label: request.label.clone(),
        };
        permission.validate_standalone()?;

        // 11. root id.
        let root_key_id = Some(parent.root_id().to_string());

        let child_id = SessionKey::generate_id();
        let child = SessionKey {
            id: child_id.clone(),
            owner_addr: parent.owner_addr.clone(),
            public_key: child_public_key,
            permission,
            usage: Usage::zero(now.date_naive()),
            created_at: now,
            revoked_at: None,
            parent_key_id: Some(parent_id.to_string()),
            depth: child_depth,
            root_key_id,
            delegation_label: request.label,
            rotated_from_id: None,
            rotated_to_id: None,
            rotation_grace_end: None,
        };

        self.store.create(child.clone(), cancel).await?;

        let mut updated_parent = parent.clone();
        updated_parent.usage.last_nonce = request.nonce;
        self.store.update(updated_parent, cancel).await?;

        info!(parent_id = %parent_id, child_id = %child_id, "created delegated session key");
        self.audit_log(DelegationLogEntry {
            id: 0,
            event: DelegationEvent::Create,
            parent_id: Some(parent_id.to_string()),
            child_id: Some(child_id.clone()),
            root_id: child.root_id().to_string(),
            owner_addr: child.owner_addr.clone(),
            depth: child.depth,
            amount: child.permission.max_total.clone(),
            reason: None,
            ancestor_chain: self.ancestor_chain_of(&parent, cancel).await,
            at: now,
        })
        .await;

        Ok(child)
    }

    // ---- 4.5.4 validate_signed -----------------------------------------

    pub async fn validate_signed(
        &self,
        id: &str,
        req: &SignedSpendRequest,
        cancel: &CancellationToken,
    ) -> Result<SessionKey> {
        let now = Utc::now();
        let key = self.get(id, cancel).await?;

        let recipient = crypto::parse_address(&req.to)?;
        let message = crypto::spend_message(&recipient, &req.amount, req.nonce, req.timestamp);
        crypto::verify(&message, &req.signature, &key.public_key)?;

        if req.nonce <= key.usage.last_nonce {
            return Err(SessionError::NonceReused {
                given: req.nonce,
                last_seen: key.usage.last_nonce,
            });
        }

        check_timestamp(req.timestamp, now, &self.config)?;

        let amount = Amount::parse_positive(&req.amount).map_err(|_| SessionError::InvalidAmount(req.amount.clone()))?;

        if let Some(parent_id) = &key.parent_key_id {
            self.validate_ancestor_chain_from(parent_id, Some(&amount), cancel).await?;
        }

        if key.is_revoked() {
            return Err(SessionError::KeyRevoked(id.to_string()));
        }
        if key.is_not_yet_valid(now) {
            return Err(SessionError::KeyNotYetValid(id.to_string()));
        }
        if key.is_expired(now) {
            return Err(SessionError::KeyExpired(id.to_string()));
        }
        if key.is_rotated() && !key.is_active(now) {
            return Err(SessionError::KeyExpired(id.to_string()));
        }

        if let Some(cap) = &key.permission.max_per_tx {
            if amount.cmp_amount(cap).is_gt() {
                return Err(SessionError::ExceedsPerTx {
                    amount: amount.format(),
                    cap: cap.format(),
                });
            }
        }

        if let Some(cap) = &key.permission.max_per_day {
            let effective_today = key.usage.effective_spent_today(now.date_naive());
            let projected = effective_today.add(&amount);
            if projected.cmp_amount(cap).is_gt() {
                return Err(SessionError::ExceedsDaily {
                    amount: projected.format(),
                    cap: cap.format(),
                });
            }
        }

        if let Some(cap) = &key.permission.max_total {
            let projected = key.usage.total_spent.add(&amount);
            if projected.cmp_amount(cap).is_gt() {
                return Err(SessionError::ExceedsTotal {
                    amount: projected.format(),
                    cap: cap.format(),
                });
            }
        }

        self.check_recipient_gate(&key, &recipient, req.service_id.as_deref()).await?;

        debug!(key_id = %id, amount = %amount.format(), "validated signed spend");
        Ok(key)
    }

    async fn check_recipient_gate(&self, key: &SessionKey, recipient: &str, service_id: Option<&str>) -> Result<()> {
        let perm = &key.permission;
        if perm.allowed_recipients.contains(recipient) || perm.allowed_service_agents.contains(recipient) {
            return Ok(());
        }
        if !perm.allowed_service_types.is_empty() {
            if let Some(service_id) = service_id {
                if let Some(resolver) = &self.resolver {
                    if let Ok(service_type) = resolver.get_service_type(service_id).await {
                        if perm.allowed_service_types.contains(&service_type) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        if perm.allow_any {
            return Ok(());
        }
        Err(SessionError::RecipientNotAllowed(recipient.to_string()))
    }

    // ---- 4.5.5 / 4.5.6 record usage -------------------------------------

    pub async fn record_usage(&self, id: &str, amount: &Amount, nonce: u64, cancel: &CancellationToken) -> Result<()> {
        let now = Utc::now();
        let mut key = self.get(id, cancel).await?;
        key.usage.record(amount, nonce, now.date_naive(), now);
        self.store.update(key, cancel).await?;
        Ok(())
    }

    pub async fn record_usage_with_cascade(
        &self,
        id: &str,
        amount: &Amount,
        nonce: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.record_usage(id, amount, nonce, cancel).await?;

        let leaf = self.get(id, cancel).await?;
        let mut current_parent = leaf.parent_key_id.clone();
        while let Some(parent_id) = current_parent {
            let ancestor = match self.store.get(&parent_id, cancel).await {
                Ok(Some(a)) => a,
                Ok(None) | Err(_) => break,
            };
            let new_total = ancestor.usage.total_spent.add(amount);
            if let Some(cap) = &ancestor.permission.max_total {
                if new_total.cmp_amount(cap).is_gt() {
                    warn!(key_id = %parent_id, "cascade usage would exceed ancestor's lifetime cap");
                    self.audit_log(DelegationLogEntry {
                        id: 0,
                        event: DelegationEvent::BudgetExceeded,
                        parent_id: Some(parent_id.clone()),
                        child_id: Some(id.to_string()),
                        root_id: ancestor.root_id().to_string(),
                        owner_addr: ancestor.owner_addr.clone(),
                        depth: ancestor.depth,
                        amount: Some(amount.clone()),
                        reason: Some("ancestor budget exceeded during cascade".to_string()),
                        ancestor_chain: self.ancestor_chain_of(&ancestor, cancel).await,
                        at: Utc::now(),
                    })
                    .await;
                    return Err(SessionError::ExceedsTotal {
                        amount: new_total.format(),
                        cap: cap.format(),
                    });
                }
            }

            // Cascaded usage narrows total_spent/spent_today but does not
            // re-increment transaction_count on ancestors — a single spend
            // is one transaction, not N (see the policy note in DESIGN.md).
            let mut updated = ancestor.clone();
            let today = Utc::now().date_naive();
            if updated.usage.last_reset_day != today {
                updated.usage.spent_today = Amount::zero();
                updated.usage.last_reset_day = today;
            }
            updated.usage.spent_today = updated.usage.spent_today.add(amount);
            updated.usage.total_spent = new_total;
            updated.usage.last_used = Some(Utc::now());
            if self.store.update(updated, cancel).await.is_err() {
                break;
            }

            current_parent = ancestor.parent_key_id.clone();
        }

        Ok(())
    }

    // ---- 4.5.7 validate_ancestor_chain ----------------------------------

    pub async fn validate_ancestor_chain(&self, key: &SessionKey, amount: Option<&Amount>, cancel: &CancellationToken) -> Result<()> {
        match &key.parent_key_id {
            Some(parent_id) => self.validate_ancestor_chain_from(parent_id, amount, cancel).await,
            None => Ok(()),
        }
    }

    async fn validate_ancestor_chain_from(&self, start_id: &str, amount: Option<&Amount>, cancel: &CancellationToken) -> Result<()> {
        let now = Utc::now();
        let mut current = Some(start_id.to_string());
        let mut hops = 0u32;
        while let Some(id) = current {
            if hops >= self.config.tree_traversal_depth_guard {
                return Err(SessionError::Internal(format!(
                    "ancestor chain exceeded {} hops",
                    self.config.tree_traversal_depth_guard
                )));
            }
            let ancestor = self
                .store
                .get(&id, cancel)
                .await?
                .ok_or_else(|| SessionError::AncestorInvalid(id.clone()))?;
            if !ancestor.is_active(now) {
                return Err(SessionError::AncestorInvalid(id.clone()));
            }
            if let (Some(amt), Some(cap)) = (amount, &ancestor.permission.max_total) {
                let projected = ancestor.usage.total_spent.add(amt);
                if projected.cmp_amount(cap).is_gt() {
                    return Err(SessionError::ExceedsTotal {
                        amount: projected.format(),
                        cap: cap.format(),
                    });
                }
            }
            current = ancestor.parent_key_id.clone();
            hops += 1;
        }
        Ok(())
    }

    /// The full chain of ids from `key` up to its root, for audit-log
    /// entries. Bounded by `tree_traversal_depth_guard` the same way
    /// `validate_ancestor_chain_from` is, so a corrupted store can't
    /// hang this on a cycle.
    async fn ancestor_chain_of(&self, key: &SessionKey, cancel: &CancellationToken) -> Vec<String> {
        let mut chain = vec![key.id.clone()];
        let mut current = key.parent_key_id.clone();
        let mut hops = 0u32;
        while let Some(id) = current {
            if hops >= self.config.tree_traversal_depth_guard {
                break;
            }
            chain.push(id.clone());
            current = match self.store.get(&id, cancel).await {
                Ok(Some(ancestor)) => ancestor.parent_key_id,
                _ => None,
            };
            hops += 1;
        }
        chain
    }

    // ---- 4.5.8 rotate_key -------------------------------------------------

    pub async fn rotate_key(&self, old_id: &str, new_public_key: &str, cancel: &CancellationToken) -> Result<SessionKey> {
        let _guard = self.locks.lock_key(old_id).await;
        let now = Utc::now();

        let mut old = self.get(old_id, cancel).await?;
        if old.is_rotated() {
            return Err(SessionError::KeyAlreadyRotated(old_id.to_string()));
        }
        if !old.is_active(now) {
            return Err(SessionError::ParentNotActive(old_id.to_string()));
        }

        let remaining = match &old.permission.max_total {
            Some(cap) => {
                let remaining = cap.checked_sub(&old.usage.total_spent).unwrap_or_else(Amount::zero);
                if remaining.is_zero() {
                    return Err(SessionError::NoBudget);
                }
                Some(remaining)
            }
            None => None,
        };

        let new_public_key = crypto::parse_address(new_public_key)?;
        let new_id = SessionKey::generate_id();
        let mut new_permission = old.permission.clone();
        new_permission.max_total = remaining;

        let new_key = SessionKey {
            id: new_id.clone(),
            owner_addr: old.owner_addr.clone(),
            public_key: new_public_key,
            permission: new_permission,
            usage: Usage::zero(now.date_naive()),
            created_at: now,
            revoked_at: None,
            parent_key_id: old.parent_key_id.clone(),
            depth: old.depth,
            root_key_id: old.root_key_id.clone(),
            delegation_label: old.delegation_label.clone(),
            rotated_from_id: Some(old_id.to_string()),
            rotated_to_id: None,
            rotation_grace_end: None,
        };
        self.store.create(new_key.clone(), cancel).await?;

        old.rotated_to_id = Some(new_id.clone());
        old.rotation_grace_end = Some(now + self.config.rotation_grace_period);
        self.store.update(old.clone(), cancel).await?;

        self.store.re_parent_children(old_id, &new_id, cancel).await?;

        // If `old` was itself a tree root, every descendant still carries
        // `old_id` as its `root_key_id`; rebase the whole subtree onto
        // `new_id` so the tree's identity survives the rotation.
        if old.root_key_id.is_none() {
            self.rebase_root_id(&new_id, old_id, &new_id, cancel).await;
        }

        info!(old_id = %old_id, new_id = %new_id, "rotated session key");
        self.audit_log(DelegationLogEntry {
            id: 0,
            event: DelegationEvent::Rotate,
            parent_id: Some(old_id.to_string()),
            child_id: Some(new_id.clone()),
            root_id: new_key.root_id().to_string(),
            owner_addr: new_key.owner_addr.clone(),
            depth: new_key.depth,
            amount: new_key.permission.max_total.clone(),
            reason: None,
            ancestor_chain: self.ancestor_chain_of(&old, cancel).await,
            at: now,
        })
        .await;

        Ok(new_key)
    }

    /// Walks the subtree rooted at `parent_id` and rewrites every
    /// descendant's `root_key_id` from `old_root_id` to `new_root_id`.
    /// Used after rotating a root key, whose identity (and therefore the
    /// tree's root id) changes but whose descendants must still resolve
    /// to the same logical tree.
    fn rebase_root_id<'a>(
        &'a self,
        parent_id: &'a str,
        old_root_id: &'a str,
        new_root_id: &'a str,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let children = match self.store.get_by_parent(parent_id, cancel).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(parent_id = %parent_id, error = %e, "rotate: failed to list descendants while rebasing root id");
                    return;
                }
            };
            for child in children {
                let child_id = child.id.clone();
                if child.root_key_id.as_deref() == Some(old_root_id) {
                    let mut updated = child;
                    updated.root_key_id = Some(new_root_id.to_string());
                    if let Err(e) = self.store.update(updated, cancel).await {
                        warn!(child_id = %child_id, error = %e, "rotate: failed to rebase descendant root id");
                    }
                }
                self.rebase_root_id(&child_id, old_root_id, new_root_id, cancel).await;
            }
        })
    }
}

fn check_timestamp(timestamp: i64, now: DateTime<Utc>, config: &EngineConfig) -> Result<()> {
    use chrono::TimeZone;
    let request_time = match Utc.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(t) => t,
        _ => return Err(SessionError::InvalidTimestamp(timestamp)),
    };
    let age = now - request_time;
    if age > config.signature_max_age {
        return Err(SessionError::SignatureExpired(timestamp));
    }
    if request_time - now > config.signature_future_skew {
        return Err(SessionError::InvalidTimestamp(timestamp));
    }
    Ok(())
}

fn parse_cap(label: &str, raw: Option<&str>) -> Result<Option<Amount>> {
    match raw {
        None => Ok(None),
        Some(s) => Amount::parse_positive(s)
            .map(Some)
            .map_err(|e| invalid_limit(label, e)),
    }
}

fn invalid_limit(label: &str, e: session_amount::AmountError) -> SessionError {
    SessionError::InvalidLimit {
        label: label.to_string(),
        reason: e.to_string(),
    }
}

/// A child cap must not exceed its parent's counterpart when both are
/// set; an unset child cap inherits the parent's (possibly also unset).
fn narrow_cap(label: &str, raw: Option<&str>, parent_cap: &Option<Amount>) -> Result<Option<Amount>> {
    match raw {
        Some(s) => {
            let child = Amount::parse_positive(s).map_err(|e| invalid_limit(label, e))?;
            if let Some(parent) = parent_cap {
                if child.cmp_amount(parent).is_gt() {
                    return Err(SessionError::InvalidLimit {
                        label: label.to_string(),
                        reason: format!("{} exceeds parent's {}", child.format(), parent.format()),
                    });
                }
            }
            Ok(Some(child))
        }
        None => Ok(parent_cap.clone()),
    }
}

/// Narrows a gating set against the parent's: `None` inherits, `Some`
/// must be a subset (case already normalized by the caller); an empty
/// parent set with a non-empty request fails with `on_empty_parent`.
fn narrow_set(
    requested: Option<HashSet<String>>,
    parent_set: &HashSet<String>,
    _label: &str,
    on_empty_parent: SessionError,
) -> Result<HashSet<String>> {
    match requested {
        None => Ok(parent_set.clone()),
        Some(requested) => {
            if parent_set.is_empty() {
                if requested.is_empty() {
                    return Ok(requested);
                }
                return Err(on_empty_parent);
            }
            for item in &requested {
                if !parent_set.contains(item) {
                    return Err(on_empty_parent);
                }
            }
            Ok(requested)
        }
    }
}

fn lowercase_set(set: &HashSet<String>) -> HashSet<String> {
    set.iter().map(|s| s.to_ascii_lowercase()).collect()
}
