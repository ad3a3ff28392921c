//! Locking discipline for the session-key engine.
//!
//! Every mutation of a key's usage counters or lifecycle state happens
//! under a per-key `tokio::sync::Mutex`, keyed by a `DashMap` so
//! unrelated keys never contend. Operations that touch an ancestor
//! chain (delegated create, cascade revoke, cascade usage recording)
//! acquire the whole chain leaf-first and release it root-first, so
//! two operations walking the same chain in the same direction can
//! never deadlock against each other.

use dashmap::DashMap;
use session_error::{Result, SessionError};
use session_store::{CancellationToken, Store};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One hop further than the maximum delegation depth, so a chain walk
/// always terminates even if the store somehow contains a cycle.
const MAX_CHAIN_HOPS: u32 = session_model::MAX_DEPTH + 1;

#[derive(Default)]
pub struct LockManager {
    mutexes: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds acquired per-key guards in leaf-to-root acquisition order.
/// Dropping releases them in reverse (root-to-leaf), mirroring the
/// acquisition order's inverse.
pub struct ChainGuard {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            mutexes: DashMap::new(),
        }
    }

    fn mutex_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.mutexes
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the single mutex for `id`.
    pub async fn lock_key(&self, id: &str) -> ChainGuard {
        let mutex = self.mutex_for(id);
        let guard = mutex.lock_owned().await;
        ChainGuard {
            guards: vec![guard],
        }
    }

    /// Acquires `leaf_id`'s mutex, then walks `parent_key_id` up to the
    /// root, acquiring each ancestor's mutex in turn. Returns the
    /// guards in leaf-first order; `ChainGuard`'s `Drop` releases them
    /// root-first.
    pub async fn lock_chain(
        &self,
        leaf_id: &str,
        store: &dyn Store,
        cancel: &CancellationToken,
    ) -> Result<ChainGuard> {
        let mut guards = Vec::new();
        guards.push(self.mutex_for(leaf_id).lock_owned().await);

        let mut current = leaf_id.to_string();
        let mut hops = 0u32;
        loop {
            if hops >= MAX_CHAIN_HOPS {
                return Err(SessionError::Internal(format!(
                    "ancestor chain from {leaf_id} exceeded {MAX_CHAIN_HOPS} hops"
                )));
            }
            let key = match store.get(&current, cancel).await {
                Ok(Some(k)) => k,
                Ok(None) => {
                    return Err(SessionError::KeyNotFound(current));
                }
                Err(e) => return Err(e),
            };
            let parent_id = match key.parent_key_id {
                Some(p) => p,
                None => break,
            };
            guards.push(self.mutex_for(&parent_id).lock_owned().await);
            current = parent_id;
            hops += 1;
        }

        Ok(ChainGuard { guards })
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        while self.guards.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_store::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    fn leaf_key(id: &str, parent: Option<&str>) -> session_model::SessionKey {
        use session_model::{Permission, SessionKey, Usage};
        use std::collections::HashSet;
        let now = chrono::Utc::now();
        SessionKey {
            id: id.to_string(),
            owner_addr: "0xowner".to_string(),
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
            parent_key_id: parent.map(|p| p.to_string()),
            depth: if parent.is_some() { 1 } else { 0 },
            root_key_id: parent.map(|p| p.to_string()),
            delegation_label: None,
            rotated_from_id: None,
            rotated_to_id: None,
            rotation_grace_end: None,
        }
    }

    #[tokio::test]
    async fn lock_key_serializes_concurrent_access() {
        let manager = Arc::new(LockManager::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = manager.lock_key("sk_shared").await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(StdDuration::from_millis(1)).await;
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn lock_chain_walks_to_root_and_errors_on_missing_ancestor() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        store.create(leaf_key("sk_root", None), &cancel).await.unwrap();
        store
            .create(leaf_key("sk_child", Some("sk_root")), &cancel)
            .await
            .unwrap();

        let manager = LockManager::new();
        let guard = manager.lock_chain("sk_child", &store, &cancel).await.unwrap();
        assert_eq!(guard.guards.len(), 2);
        drop(guard);

        let manager = LockManager::new();
        let err = manager
            .lock_chain("sk_orphan", &store, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "key_not_found");
    }
}
