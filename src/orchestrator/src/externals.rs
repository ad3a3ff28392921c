//! Collaborators the orchestrator consumes but does not own: the
//! two-phase ledger, the on-chain wallet, the transaction recorder,
//! and the fire-and-forget event emitter (§6.1). Each ships an
//! in-memory stub alongside the trait, the way the engine's `Store`
//! does.

use async_trait::async_trait;
use session_amount::Amount;
use session_error::{Result, SessionError};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub tx_hash: String,
}

/// Two-phase balance ledger: `hold` moves available → pending,
/// `confirm_hold` commits it, `release_hold` gives it back. `ref_id` is
/// the session-key id; implementations are expected to be idempotent
/// per `(ref_id, phase)`.
#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn hold(&self, agent: &str, amount: &Amount, ref_id: &str) -> Result<()>;
    async fn confirm_hold(&self, agent: &str, amount: &Amount, ref_id: &str) -> Result<()>;
    async fn release_hold(&self, agent: &str, amount: &Amount, ref_id: &str) -> Result<()>;
    async fn deposit(&self, agent: &str, amount: &Amount, ref_id: &str) -> Result<()>;
}

#[async_trait]
pub trait WalletService: Send + Sync {
    async fn transfer(&self, to: &str, amount: &Amount) -> Result<TransferReceipt>;
}

#[async_trait]
pub trait TransactionRecorder: Send + Sync {
    async fn record_transaction(
        &self,
        tx_hash: &str,
        from: &str,
        to: &str,
        amount: &Amount,
        service_id: Option<&str>,
    );
}

#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit_transaction(&self, tx_hash: &str, from: &str, to: &str, amount: &Amount);
    async fn emit_session_key_used(&self, key_id: &str, owner: &str, amount: &Amount);
}

/// In-memory two-phase ledger for tests and the demo binary. Balances
/// default to zero and must be funded explicitly via [`StubLedger::fund`]
/// before a `hold` can succeed, matching a real ledger's behavior on an
/// unfunded account.
#[derive(Default)]
pub struct StubLedger {
    available: Mutex<HashMap<String, Amount>>,
    pending: Mutex<HashMap<String, Amount>>,
}

impl StubLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fund(&self, agent: &str, amount: Amount) {
        let mut available = self.available.lock().await;
        let entry = available.entry(agent.to_string()).or_insert_with(Amount::zero);
        *entry = entry.add(&amount);
    }

    pub async fn available_balance(&self, agent: &str) -> Amount {
        self.available
            .lock()
            .await
            .get(agent)
            .cloned()
            .unwrap_or_else(Amount::zero)
    }
}

#[async_trait]
impl BalanceService for StubLedger {
    async fn hold(&self, agent: &str, amount: &Amount, ref_id: &str) -> Result<()> {
        let mut available = self.available.lock().await;
        let balance = available.get(agent).cloned().unwrap_or_else(Amount::zero);
        let remaining = balance.checked_sub(amount).ok_or_else(|| SessionError::InsufficientBalance {
            agent: agent.to_string(),
            amount: amount.format(),
        })?;
        available.insert(agent.to_string(), remaining);
        drop(available);
        let mut pending = self.pending.lock().await;
        let key = format!("{agent}:{ref_id}");
        let entry = pending.entry(key).or_insert_with(Amount::zero);
        *entry = entry.add(amount);
        Ok(())
    }

    async fn confirm_hold(&self, agent: &str, amount: &Amount, ref_id: &str) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let key = format!("{agent}:{ref_id}");
        if let Some(p) = pending.get_mut(&key) {
            *p = p.checked_sub(amount).unwrap_or_else(Amount::zero);
        }
        Ok(())
    }

    async fn release_hold(&self, agent: &str, amount: &Amount, ref_id: &str) -> Result<()> {
        let mut pending = self.pending.lock().await;
        let key = format!("{agent}:{ref_id}");
        if let Some(p) = pending.get_mut(&key) {
            *p = p.checked_sub(amount).unwrap_or_else(Amount::zero);
        }
        drop(pending);
        let mut available = self.available.lock().await;
        let entry = available.entry(agent.to_string()).or_insert_with(Amount::zero);
        *entry = entry.add(amount);
        Ok(())
    }

    async fn deposit(&self, agent: &str, amount: &Amount, _ref_id: &str) -> Result<()> {
        let mut available = self.available.lock().await;
        let entry = available.entry(agent.to_string()).or_insert_with(Amount::zero);
        *entry = entry.add(amount);
        Ok(())
    }
}

/// Synthesizes a deterministic-looking tx hash from a monotonically
/// increasing counter; never touches a real chain.
#[derive(Default)]
pub struct StubWallet {
    counter: Mutex<u64>,
}

impl StubWallet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletService for StubWallet {
    async fn transfer(&self, _to: &str, _amount: &Amount) -> Result<TransferReceipt> {
        let mut counter = self.counter.lock().await;
        *counter += 1;
        Ok(TransferReceipt {
            tx_hash: format!("0xdemo{:016x}", *counter),
        })
    }
}

#[derive(Default)]
pub struct NullTransactionRecorder;

#[async_trait]
impl TransactionRecorder for NullTransactionRecorder {
    async fn record_transaction(&self, _tx_hash: &str, _from: &str, _to: &str, _amount: &Amount, _service_id: Option<&str>) {}
}

#[derive(Default)]
pub struct NullEventEmitter;

#[async_trait]
impl EventEmitter for NullEventEmitter {
    async fn emit_transaction(&self, _tx_hash: &str, _from: &str, _to: &str, _amount: &Amount) {}
    async fn emit_session_key_used(&self, _key_id: &str, _owner: &str, _amount: &Amount) {}
}
