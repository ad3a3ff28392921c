//! A `tokio::sync::RwLock`-backed `Store` for tests and the demo CLI.
//! Every read and write clones the `SessionKey`, so callers can freely
//! mutate what they get back without reaching into the store's state.

use crate::cancellation::CancellationToken;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use session_error::{Result, SessionError};
use session_model::SessionKey;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    keys: RwLock<HashMap<String, SessionKey>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SessionError::Internal("operation cancelled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create(&self, key: SessionKey, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut guard = self.keys.write().await;
        if guard.contains_key(&key.id) {
            return Err(SessionError::KeyAlreadyExists(key.id.clone()));
        }
        guard.insert(key.id.clone(), key);
        Ok(())
    }

    async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<Option<SessionKey>> {
        Self::check_cancelled(cancel)?;
        let guard = self.keys.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn get_by_owner(
        &self,
        owner_addr: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SessionKey>> {
        Self::check_cancelled(cancel)?;
        let guard = self.keys.read().await;
        Ok(guard
            .values()
            .filter(|k| k.owner_addr.eq_ignore_ascii_case(owner_addr))
            .cloned()
            .collect())
    }

    async fn get_by_parent(
        &self,
        parent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SessionKey>> {
        Self::check_cancelled(cancel)?;
        let guard = self.keys.read().await;
        Ok(guard
            .values()
            .filter(|k| k.parent_key_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn update(&self, key: SessionKey, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut guard = self.keys.write().await;
        if !guard.contains_key(&key.id) {
            return Err(SessionError::KeyNotFound(key.id.clone()));
        }
        guard.insert(key.id.clone(), key);
        Ok(())
    }

    async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut guard = self.keys.write().await;
        guard.remove(id);
        Ok(())
    }

    async fn count_active(
        &self,
        owner_addr: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        Self::check_cancelled(cancel)?;
        let guard = self.keys.read().await;
        Ok(guard
            .values()
            .filter(|k| {
                k.owner_addr.eq_ignore_ascii_case(owner_addr)
                    && !k.is_revoked()
                    && k.permission.expires_at > now
            })
            .count() as u64)
    }

    async fn re_parent_children(
        &self,
        old_parent_id: &str,
        new_parent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Self::check_cancelled(cancel)?;
        let mut guard = self.keys.write().await;
        for key in guard.values_mut() {
            if key.parent_key_id.as_deref() == Some(old_parent_id) {
                key.parent_key_id = Some(new_parent_id.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_model::{Permission, Usage};
    use std::collections::HashSet;

    fn sample_key(id: &str, owner: &str) -> SessionKey {
        let now = Utc::now();
        SessionKey {
            id: id.to_string(),
            owner_addr: owner.to_string(),
            public_key: "0xpub".to_string(),
            permission: Permission {
                max_per_tx: None,
                max_per_day: None,
                max_total: None,
                expires_at: now + chrono::Duration::hours(1),
                valid_after: None,
                allowed_recipients: HashSet::new(),
                allowed_service_types: HashSet::new(),
                allowed_service_agents: HashSet::new(),
                allow_any: true,
                scopes: HashSet::new(),
                label: None,
            },
            usage: Usage::zero(now.date_naive()),
            created_at: now,
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

    #[tokio::test]
    async fn create_get_and_mutate_returned_copy_does_not_affect_store() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        store
            .create(sample_key("sk_a", "0xowner"), &cancel)
            .await
            .unwrap();

        let mut fetched = store.get("sk_a", &cancel).await.unwrap().unwrap();
        fetched.depth = 99;

        let refetched = store.get("sk_a", &cancel).await.unwrap().unwrap();
        assert_eq!(refetched.depth, 0);
    }

    #[tokio::test]
    async fn create_rejects_id_collision() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        store
            .create(sample_key("sk_a", "0xowner"), &cancel)
            .await
            .unwrap();

        let mut colliding = sample_key("sk_a", "0xother");
        colliding.depth = 3;
        let err = store.create(colliding, &cancel).await.unwrap_err();
        assert_eq!(err.code(), "key_already_exists");

        let stored = store.get("sk_a", &cancel).await.unwrap().unwrap();
        assert_eq!(stored.owner_addr, "0xowner");
        assert_eq!(stored.depth, 0);
    }

    #[tokio::test]
    async fn update_missing_key_errors() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let err = store
            .update(sample_key("sk_missing", "0xowner"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "key_not_found");
    }

    #[tokio::test]
    async fn count_active_excludes_revoked_and_expired() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        let now = Utc::now();

        store.create(sample_key("sk_live", "0xowner"), &cancel).await.unwrap();

        let mut revoked = sample_key("sk_revoked", "0xowner");
        revoked.revoked_at = Some(now);
        store.create(revoked, &cancel).await.unwrap();

        let mut expired = sample_key("sk_expired", "0xowner");
        expired.permission.expires_at = now - chrono::Duration::minutes(1);
        store.create(expired, &cancel).await.unwrap();

        assert_eq!(store.count_active("0xowner", now, &cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn re_parent_children_updates_all_matching() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();

        let mut child_a = sample_key("sk_child_a", "0xowner");
        child_a.parent_key_id = Some("sk_old".to_string());
        store.create(child_a, &cancel).await.unwrap();

        let mut child_b = sample_key("sk_child_b", "0xowner");
        child_b.parent_key_id = Some("sk_old".to_string());
        store.create(child_b, &cancel).await.unwrap();

        store
            .re_parent_children("sk_old", "sk_new", &cancel)
            .await
            .unwrap();

        let a = store.get("sk_child_a", &cancel).await.unwrap().unwrap();
        let b = store.get("sk_child_b", &cancel).await.unwrap().unwrap();
        assert_eq!(a.parent_key_id.as_deref(), Some("sk_new"));
        assert_eq!(b.parent_key_id.as_deref(), Some("sk_new"));
    }
}
