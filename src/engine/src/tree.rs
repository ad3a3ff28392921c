//! Read-only delegation subtree construction (§4.7).

use chrono::{DateTime, Utc};
use session_amount::Amount;
use session_error::Result;
use session_model::SessionKey;
use session_store::{CancellationToken, Store};

#[derive(Debug, Clone)]
pub struct DelegationNode {
    pub id: String,
    pub public_key: String,
    pub label: Option<String>,
    pub depth: u32,
    pub max_total: Option<Amount>,
    pub total_spent: Amount,
    /// `None` when `max_total` is unset (unlimited).
    pub remaining: Option<Amount>,
    pub transaction_count: u64,
    pub active: bool,
    pub children: Vec<DelegationNode>,
}

impl DelegationNode {
    fn from_key(key: &SessionKey, now: DateTime<Utc>) -> Self {
        let remaining = key
            .permission
            .max_total
            .as_ref()
            .map(|cap| cap.checked_sub(&key.usage.total_spent).unwrap_or_else(Amount::zero));
        DelegationNode {
            id: key.id.clone(),
            public_key: key.public_key.clone(),
            label: key.delegation_label.clone(),
            depth: key.depth,
            max_total: key.permission.max_total.clone(),
            total_spent: key.usage.total_spent.clone(),
            remaining,
            transaction_count: key.usage.transaction_count,
            active: key.is_active(now),
            children: Vec::new(),
        }
    }
}

/// Builds the subtree rooted at `root_id`, fetching children
/// iteratively via `get_by_parent`. Bounded by
/// `tree_traversal_depth_guard` levels to defend against a corrupted
/// store producing a cycle.
pub async fn build_subtree(
    store: &dyn Store,
    root_id: &str,
    depth_guard: u32,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<Option<DelegationNode>> {
    let root_key = match store.get(root_id, cancel).await? {
        Some(k) => k,
        None => return Ok(None),
    };

    let mut root = DelegationNode::from_key(&root_key, now);
    attach_children(store, &mut root, 0, depth_guard, now, cancel).await?;
    Ok(Some(root))
}

fn attach_children<'a>(
    store: &'a dyn Store,
    node: &'a mut DelegationNode,
    level: u32,
    depth_guard: u32,
    now: DateTime<Utc>,
    cancel: &'a CancellationToken,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(attach_children_inner(store, node, level, depth_guard, now, cancel))
}

async fn attach_children_inner(
    store: &dyn Store,
    node: &mut DelegationNode,
    level: u32,
    depth_guard: u32,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<()> {
    if level >= depth_guard {
        return Ok(());
    }
    let children = store.get_by_parent(&node.id, cancel).await?;
    for child_key in children {
        let mut child_node = DelegationNode::from_key(&child_key, now);
        attach_children(store, &mut child_node, level + 1, depth_guard, now, cancel).await?;
        node.children.push(child_node);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_model::{Permission, Usage};
    use session_store::InMemoryStore;
    use std::collections::HashSet;

    fn key(id: &str, parent: Option<&str>, depth: u32, max_total: Option<&str>) -> SessionKey {
        let now = Utc::now();
        SessionKey {
            id: id.to_string(),
            owner_addr: "0xowner".to_string(),
            public_key: "0xpub".to_string(),
            permission: Permission {
                max_per_tx: None,
                max_per_day: None,
                max_total: max_total.map(|s| Amount::parse(s).unwrap()),
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
            depth,
            root_key_id: parent.map(|_| "sk_root".to_string()),
            delegation_label: None,
            rotated_from_id: None,
            rotated_to_id: None,
            rotation_grace_end: None,
        }
    }

    #[tokio::test]
    async fn builds_nested_subtree() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        store.create(key("sk_root", None, 0, Some("10.00")), &cancel).await.unwrap();
        store
            .create(key("sk_mid", Some("sk_root"), 1, Some("4.00")), &cancel)
            .await
            .unwrap();
        store
            .create(key("sk_leaf", Some("sk_mid"), 2, None), &cancel)
            .await
            .unwrap();

        let tree = build_subtree(&store, "sk_root", 7, Utc::now(), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].id, "sk_mid");
        assert_eq!(tree.children[0].children.len(), 1);
        assert_eq!(tree.children[0].children[0].id, "sk_leaf");
        assert_eq!(tree.remaining.unwrap().format(), "10");
    }

    #[tokio::test]
    async fn missing_root_returns_none() {
        let store = InMemoryStore::new();
        let cancel = CancellationToken::new();
        assert!(build_subtree(&store, "sk_missing", 7, Utc::now(), &cancel)
            .await
            .unwrap()
            .is_none());
    }
}
