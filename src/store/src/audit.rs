//! In-memory delegation audit log. Supplements the store interface: the
//! engine appends an entry on every create/revoke/rotate so the
//! delegation tree's history can be replayed without re-deriving it
//! from point-in-time `SessionKey` state.

use async_trait::async_trait;
use session_model::DelegationLogEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[async_trait]
pub trait DelegationAuditLogger: Send + Sync {
    async fn append(&self, entry: DelegationLogEntry);
    async fn for_root(&self, root_id: &str) -> Vec<DelegationLogEntry>;
    async fn all(&self) -> Vec<DelegationLogEntry>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    next_id: AtomicU64,
    entries: RwLock<Vec<DelegationLogEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl DelegationAuditLogger for InMemoryAuditLog {
    /// The logger, not the caller, assigns the monotonically increasing
    /// id (§6.3) — whatever `entry.id` arrives with is overwritten.
    async fn append(&self, mut entry: DelegationLogEntry) {
        entry.id = self.next_id();
        self.entries.write().await.push(entry);
    }

    async fn for_root(&self, root_id: &str) -> Vec<DelegationLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.root_id == root_id)
            .cloned()
            .collect()
    }

    async fn all(&self) -> Vec<DelegationLogEntry> {
        self.entries.read().await.clone()
    }
}
