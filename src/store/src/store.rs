//! The storage seam: everything above this trait talks to session
//! keys only through here, so a persistent backend can be dropped in
//! without touching the engine or orchestrator.

use crate::cancellation::CancellationToken;
use async_trait::async_trait;
use session_error::Result;
use session_model::SessionKey;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create(&self, key: SessionKey, cancel: &CancellationToken) -> Result<()>;

    async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<Option<SessionKey>>;

    async fn get_by_owner(
        &self,
        owner_addr: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SessionKey>>;

    async fn get_by_parent(
        &self,
        parent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SessionKey>>;

    async fn update(&self, key: SessionKey, cancel: &CancellationToken) -> Result<()>;

    async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()>;

    /// Count of keys for `owner_addr` that are not revoked and have not
    /// yet reached `expires_at`, as of `now`.
    async fn count_active(
        &self,
        owner_addr: &str,
        now: chrono::DateTime<chrono::Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Re-point every direct child of `old_parent_id` at `new_parent_id`.
    /// Used by rotation (§4.5.8) to re-parent the rotated-from key's
    /// children onto the rotated-to key.
    async fn re_parent_children(
        &self,
        old_parent_id: &str,
        new_parent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
