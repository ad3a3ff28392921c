//! The session key itself: identity, permission envelope, usage
//! counters, and delegation/rotation lineage.

use crate::permission::Permission;
use crate::usage::Usage;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const ID_PREFIX: &str = "sk_";
pub const ID_ENTROPY_BYTES: usize = 12; // 96 bits
pub const MAX_DEPTH: u32 = 5;
pub const ROTATION_GRACE: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKey {
    pub id: String,
    pub owner_addr: String,
    pub public_key: String,
    pub permission: Permission,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,

    pub parent_key_id: Option<String>,
    pub depth: u32,
    pub root_key_id: Option<String>,
    pub delegation_label: Option<String>,

    pub rotated_from_id: Option<String>,
    pub rotated_to_id: Option<String>,
    pub rotation_grace_end: Option<DateTime<Utc>>,
}

impl SessionKey {
    pub fn generate_id() -> String {
        let mut bytes = [0u8; ID_ENTROPY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{ID_PREFIX}{}", hex::encode(bytes))
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_rotated(&self) -> bool {
        self.rotated_to_id.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.parent_key_id.is_none()
    }

    /// The root of this key's delegation tree: itself if it is the root.
    pub fn root_id(&self) -> &str {
        self.root_key_id.as_deref().unwrap_or(&self.id)
    }

    fn in_rotation_grace(&self, now: DateTime<Utc>) -> bool {
        match self.rotation_grace_end {
            Some(end) => now < end,
            None => false,
        }
    }

    /// `active` per the lifecycle in §3.3: not revoked, within the
    /// validity window, and — if rotated — still inside the grace
    /// period (after which a rotated key is treated as expired).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.is_revoked() {
            return false;
        }
        if let Some(valid_after) = self.permission.valid_after {
            if now < valid_after {
                return false;
            }
        }
        if now >= self.permission.expires_at {
            return false;
        }
        if self.is_rotated() {
            return self.in_rotation_grace(now);
        }
        true
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && now >= self.permission.expires_at
    }

    pub fn is_not_yet_valid(&self, now: DateTime<Utc>) -> bool {
        self.permission.valid_after.map(|va| now < va).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::usage::Usage;
    use std::collections::HashSet;

    fn key_with(expires_at: DateTime<Utc>, valid_after: Option<DateTime<Utc>>) -> SessionKey {
        SessionKey {
            id: SessionKey::generate_id(),
            owner_addr: "0xowner".to_string(),
            public_key: "0xpub".to_string(),
            permission: Permission {
                max_per_tx: None,
                max_per_day: None,
                max_total: None,
                expires_at,
                valid_after,
                allowed_recipients: HashSet::new(),
                allowed_service_types: HashSet::new(),
                allowed_service_agents: HashSet::new(),
                allow_any: true,
                scopes: HashSet::new(),
                label: None,
            },
            usage: Usage::zero(Utc::now().date_naive()),
            created_at: Utc::now(),
            revoked_at: None,
            parent_key_id: None,
            depth: 0,
            root_key_id: None,
            delegation_label: None,
            rotated_from_id: None,
            rotated_to_id: None,
            rotation_grace_end: None,
        }
    }

    #[test]
    fn generated_ids_have_the_expected_shape() {
        let id = SessionKey::generate_id();
        assert!(id.starts_with(ID_PREFIX));
        assert_eq!(id.len(), ID_PREFIX.len() + ID_ENTROPY_BYTES * 2);
        assert!(id[ID_PREFIX.len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn active_requires_unexpired_and_valid_window() {
        let now = Utc::now();
        let key = key_with(now + chrono::Duration::hours(1), None);
        assert!(key.is_active(now));

        let expired = key_with(now - chrono::Duration::hours(1), None);
        assert!(!expired.is_active(now));
        assert!(expired.is_expired(now));

        let not_yet = key_with(now + chrono::Duration::hours(1), Some(now + chrono::Duration::minutes(5)));
        assert!(!not_yet.is_active(now));
        assert!(not_yet.is_not_yet_valid(now));
    }

    #[test]
    fn revoked_key_is_never_active() {
        let now = Utc::now();
        let mut key = key_with(now + chrono::Duration::hours(1), None);
        key.revoked_at = Some(now);
        assert!(!key.is_active(now));
    }

    #[test]
    fn rotated_key_is_active_only_during_grace() {
        let now = Utc::now();
        let mut key = key_with(now + chrono::Duration::hours(1), None);
        key.rotated_to_id = Some(SessionKey::generate_id());
        key.rotation_grace_end = Some(now + chrono::Duration::minutes(1));
        assert!(key.is_active(now));

        key.rotation_grace_end = Some(now - chrono::Duration::minutes(1));
        assert!(!key.is_active(now));
    }
}
