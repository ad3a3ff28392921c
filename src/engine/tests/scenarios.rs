//! End-to-end scenarios exercising the engine the way a caller would:
//! generate a keypair, build a signed request, drive it through the
//! manager.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use secp256k1::Secp256k1;
use session_engine::{CreateKeyRequest, DelegationRequest, Manager, SignedSpendRequest};
use session_store::{CancellationToken, InMemoryStore};
use std::collections::HashSet;
use std::sync::Arc;

fn keypair(seed: u8) -> (secp256k1::SecretKey, String) {
    let secp = Secp256k1::new();
    let mut rng = StdRng::from_seed([seed; 32]);
    let (sk, pk) = secp.generate_keypair(&mut rng);
    (sk, session_crypto::address_from_public_key(&pk))
}

fn manager() -> Manager {
    Manager::new(Arc::new(InMemoryStore::new()))
}

fn spend_request(sk: &secp256k1::SecretKey, to: &str, amount: &str, nonce: u64, timestamp: i64) -> SignedSpendRequest {
    let msg = session_crypto::spend_message(to, amount, nonce, timestamp);
    let sig = session_crypto::sign_message(sk, &msg);
    SignedSpendRequest {
        to: to.to_string(),
        amount: amount.to_string(),
        service_id: None,
        nonce,
        timestamp,
        signature: hex::encode(sig),
    }
}

fn open_create_request(public_key: &str) -> CreateKeyRequest {
    CreateKeyRequest {
        public_key: public_key.to_string(),
        max_per_tx: Some("1.00".to_string()),
        max_per_day: Some("10.00".to_string()),
        max_total: None,
        expires_at: None,
        expires_in: Some("1h".to_string()),
        valid_after: None,
        allowed_recipients: HashSet::new(),
        allowed_service_types: HashSet::new(),
        allowed_service_agents: HashSet::new(),
        allow_any: true,
        scopes: HashSet::new(),
        label: None,
    }
}

// S1 — create, sign, spend.
#[tokio::test]
async fn s1_create_sign_spend() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (sk, addr) = keypair(1);

    let key = manager
        .create("0xowner00000000000000000000000000000000", open_create_request(&addr), &cancel)
        .await
        .unwrap();

    let now = Utc::now().timestamp();
    let req = spend_request(&sk, "0xrecipient000000000000000000000000000a", "0.50", 1, now);
    let validated = manager.validate_signed(&key.id, &req, &cancel).await.unwrap();
    let amount = session_amount::Amount::parse("0.50").unwrap();
    manager
        .record_usage(&validated.id, &amount, req.nonce, &cancel)
        .await
        .unwrap();

    let stored = manager.get(&key.id, &cancel).await.unwrap();
    assert_eq!(stored.usage.total_spent.format(), "0.500000");
    assert_eq!(stored.usage.spent_today.format(), "0.500000");
    assert_eq!(stored.usage.last_nonce, 1);
}

// S2 — nonce replay.
#[tokio::test]
async fn s2_nonce_replay_rejected() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (sk, addr) = keypair(2);
    let key = manager
        .create("0xowner00000000000000000000000000000000", open_create_request(&addr), &cancel)
        .await
        .unwrap();
    let now = Utc::now().timestamp();

    let req1 = spend_request(&sk, "0xrecipient000000000000000000000000000a", "0.50", 1, now);
    manager.validate_signed(&key.id, &req1, &cancel).await.unwrap();
    manager
        .record_usage(&key.id, &session_amount::Amount::parse("0.50").unwrap(), 1, &cancel)
        .await
        .unwrap();

    let replay = spend_request(&sk, "0xrecipient000000000000000000000000000a", "0.50", 1, now);
    let err = manager.validate_signed(&key.id, &replay, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "nonce_reused");

    let stale = spend_request(&sk, "0xrecipient000000000000000000000000000a", "0.50", 0, now);
    let err = manager.validate_signed(&key.id, &stale, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "nonce_reused");

    let req2 = spend_request(&sk, "0xrecipient000000000000000000000000000a", "0.50", 2, now);
    assert!(manager.validate_signed(&key.id, &req2, &cancel).await.is_ok());
}

// S3 — per-tx exceeded.
#[tokio::test]
async fn s3_exceeds_per_tx() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (sk, addr) = keypair(3);
    let key = manager
        .create("0xowner00000000000000000000000000000000", open_create_request(&addr), &cancel)
        .await
        .unwrap();
    let now = Utc::now().timestamp();
    let req = spend_request(&sk, "0xrecipient000000000000000000000000000a", "5.00", 1, now);
    let err = manager.validate_signed(&key.id, &req, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "exceeds_per_tx");
}

// S4 — stale / future timestamp.
#[tokio::test]
async fn s4_stale_and_future_timestamps() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (sk, addr) = keypair(4);
    let key = manager
        .create("0xowner00000000000000000000000000000000", open_create_request(&addr), &cancel)
        .await
        .unwrap();
    let now = Utc::now().timestamp();

    let stale = spend_request(&sk, "0xrecipient000000000000000000000000000a", "0.50", 1, now - 600);
    let err = manager.validate_signed(&key.id, &stale, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "signature_expired");

    let future = spend_request(&sk, "0xrecipient000000000000000000000000000a", "0.50", 1, now + 120);
    let err = manager.validate_signed(&key.id, &future, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "invalid_timestamp");
}

fn delegation_request(
    child_pub: &str,
    max_total: &str,
    parent_sk: &secp256k1::SecretKey,
    nonce: u64,
    timestamp: i64,
) -> DelegationRequest {
    let msg = session_crypto::delegation_message(child_pub, max_total, nonce, timestamp);
    let sig = session_crypto::sign_message(parent_sk, &msg);
    DelegationRequest {
        child_public_key: child_pub.to_string(),
        max_per_tx: None,
        max_per_day: None,
        max_total: Some(max_total.to_string()),
        expires_at: None,
        valid_after: None,
        allowed_recipients: None,
        allowed_service_types: None,
        allowed_service_agents: None,
        allow_any: None,
        scopes: None,
        label: None,
        nonce,
        timestamp,
        signature: hex::encode(sig),
    }
}

fn parent_create_request(public_key: &str, max_total: &str) -> CreateKeyRequest {
    let mut req = open_create_request(public_key);
    req.max_total = Some(max_total.to_string());
    req.max_per_tx = None;
    req.max_per_day = None;
    req
}

// S5 — delegation narrowing.
#[tokio::test]
async fn s5_delegation_narrowing() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (parent_sk, parent_addr) = keypair(5);
    let (_, child_a_addr) = keypair(6);
    let (_, child_b_addr) = keypair(7);
    let (_, child_b2_addr) = keypair(8);

    let parent = manager
        .create("0xowner00000000000000000000000000000000", parent_create_request(&parent_addr, "10.00"), &cancel)
        .await
        .unwrap();

    let now = Utc::now().timestamp();
    let req_a = delegation_request(&child_a_addr, "3.00", &parent_sk, 1, now);
    let child_a = manager.create_delegated(&parent.id, req_a, &cancel).await.unwrap();

    let req_b = delegation_request(&child_b_addr, "7.00", &parent_sk, 2, now);
    manager.create_delegated(&parent.id, req_b, &cancel).await.unwrap();

    let req_b2 = delegation_request(&child_b2_addr, "4.00", &parent_sk, 3, now);
    let err = manager.create_delegated(&parent.id, req_b2, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "child_exceeds_parent");

    manager
        .record_usage_with_cascade(&child_a.id, &session_amount::Amount::parse("3.00").unwrap(), 1, &cancel)
        .await
        .unwrap();

    let stored_a = manager.get(&child_a.id, &cancel).await.unwrap();
    assert_eq!(stored_a.usage.total_spent.format(), "3");
    let stored_parent = manager.get(&parent.id, &cancel).await.unwrap();
    assert_eq!(stored_parent.usage.total_spent.format(), "3");
}

// S6 — cascade revocation.
#[tokio::test]
async fn s6_cascade_revocation() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (root_sk, root_addr) = keypair(9);
    let (mid_sk, mid_addr) = keypair(10);
    let (_, leaf_addr) = keypair(11);

    let root = manager
        .create("0xowner00000000000000000000000000000000", parent_create_request(&root_addr, "10.00"), &cancel)
        .await
        .unwrap();
    let now = Utc::now().timestamp();
    let mid = manager
        .create_delegated(&root.id, delegation_request(&mid_addr, "5.00", &root_sk, 1, now), &cancel)
        .await
        .unwrap();
    let leaf = manager
        .create_delegated(&mid.id, delegation_request(&leaf_addr, "2.00", &mid_sk, 1, now), &cancel)
        .await
        .unwrap();

    manager.revoke(&root.id, &cancel).await.unwrap();

    for id in [&root.id, &mid.id, &leaf.id] {
        let key = manager.get(id, &cancel).await.unwrap();
        assert!(key.is_revoked());
        assert!(!key.is_active(Utc::now()));
    }
}

// S7 — concurrent siblings under parent cap.
#[tokio::test]
async fn s7_concurrent_siblings_under_parent_cap() {
    let manager = Arc::new(manager());
    let cancel = CancellationToken::new();
    let (parent_sk, parent_addr) = keypair(12);
    let (_, a_addr) = keypair(13);
    let (_, b_addr) = keypair(14);

    let parent = manager
        .create("0xowner00000000000000000000000000000000", parent_create_request(&parent_addr, "5.00"), &cancel)
        .await
        .unwrap();
    let now = Utc::now().timestamp();
    let child_a = manager
        .create_delegated(&parent.id, delegation_request(&a_addr, "3.00", &parent_sk, 1, now), &cancel)
        .await
        .unwrap();
    let child_b = manager
        .create_delegated(&parent.id, delegation_request(&b_addr, "2.00", &parent_sk, 2, now), &cancel)
        .await
        .unwrap();

    let cancel_a = CancellationToken::new();
    let cancel_b = CancellationToken::new();
    let manager_a = manager.clone();
    let manager_b = manager.clone();
    let id_a = child_a.id.clone();
    let id_b = child_b.id.clone();

    let (res_a, res_b) = tokio::join!(
        async move {
            let _guard = manager_a.lock_chain(&id_a, &cancel_a).await.unwrap();
            manager_a
                .record_usage_with_cascade(&id_a, &session_amount::Amount::parse("3.00").unwrap(), 1, &cancel_a)
                .await
        },
        async move {
            let _guard = manager_b.lock_chain(&id_b, &cancel_b).await.unwrap();
            manager_b
                .record_usage_with_cascade(&id_b, &session_amount::Amount::parse("2.00").unwrap(), 1, &cancel_b)
                .await
        }
    );
    res_a.unwrap();
    res_b.unwrap();

    let stored_parent = manager.get(&parent.id, &cancel).await.unwrap();
    assert_eq!(stored_parent.usage.total_spent.format(), "5");

    let err = manager
        .record_usage_with_cascade(&child_a.id, &session_amount::Amount::parse("0.01").unwrap(), 2, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "exceeds_total");
}

// S8 — rotation.
#[tokio::test]
async fn s8_rotation() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (_, addr) = keypair(15);
    let (_, new_addr) = keypair(16);

    let key = manager
        .create("0xowner00000000000000000000000000000000", parent_create_request(&addr, "100.00"), &cancel)
        .await
        .unwrap();
    manager
        .record_usage(&key.id, &session_amount::Amount::parse("30.00").unwrap(), 1, &cancel)
        .await
        .unwrap();

    let rotated = manager.rotate_key(&key.id, &new_addr, &cancel).await.unwrap();
    assert_eq!(rotated.permission.max_total.unwrap().format(), "70");

    let old = manager.get(&key.id, &cancel).await.unwrap();
    assert_eq!(old.rotated_to_id.as_deref(), Some(rotated.id.as_str()));
    assert!(old.is_active(Utc::now()));

    let err = manager.rotate_key(&key.id, &new_addr, &cancel).await.unwrap_err();
    assert_eq!(err.code(), "key_already_rotated");
}

// S9 — rotating a root rebases its descendants' root_key_id.
#[tokio::test]
async fn s9_rotating_root_rebases_descendant_root_id() {
    let manager = manager();
    let cancel = CancellationToken::new();
    let (root_sk, root_addr) = keypair(17);
    let (_, child_addr) = keypair(18);
    let (_, new_root_addr) = keypair(19);

    let root = manager
        .create("0xowner00000000000000000000000000000000", parent_create_request(&root_addr, "10.00"), &cancel)
        .await
        .unwrap();
    let now = Utc::now().timestamp();
    let child = manager
        .create_delegated(&root.id, delegation_request(&child_addr, "4.00", &root_sk, 1, now), &cancel)
        .await
        .unwrap();
    assert_eq!(child.root_key_id.as_deref(), Some(root.id.as_str()));

    let rotated = manager.rotate_key(&root.id, &new_root_addr, &cancel).await.unwrap();

    let stored_child = manager.get(&child.id, &cancel).await.unwrap();
    assert_eq!(stored_child.parent_key_id.as_deref(), Some(rotated.id.as_str()));
    assert_eq!(stored_child.root_key_id.as_deref(), Some(rotated.id.as_str()));
}
