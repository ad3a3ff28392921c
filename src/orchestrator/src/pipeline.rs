//! The per-request spend pipeline (§4.6): acquire locks, validate,
//! place a ledger hold, transfer on-chain, confirm, record usage.

use crate::externals::{BalanceService, EventEmitter, TransactionRecorder, WalletService};
use session_amount::Amount;
use session_engine::{Manager, SignedSpendRequest};
use session_error::{Result, SessionError};
use session_store::CancellationToken;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SpendOutcome {
    pub tx_hash: String,
    pub amount: String,
}

pub struct Orchestrator {
    engine: Arc<Manager>,
    ledger: Arc<dyn BalanceService>,
    wallet: Arc<dyn WalletService>,
    recorder: Arc<dyn TransactionRecorder>,
    events: Arc<dyn EventEmitter>,
    demo_mode: bool,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<Manager>,
        ledger: Arc<dyn BalanceService>,
        wallet: Arc<dyn WalletService>,
        recorder: Arc<dyn TransactionRecorder>,
        events: Arc<dyn EventEmitter>,
    ) -> Self {
        Orchestrator {
            engine,
            ledger,
            wallet,
            recorder,
            events,
            demo_mode: false,
        }
    }

    pub fn with_demo_mode(mut self, demo_mode: bool) -> Self {
        self.demo_mode = demo_mode;
        self
    }

    /// Runs the full pipeline for one signed spend request. On
    /// success, the key's usage counters (cascaded if delegated) have
    /// been updated and the external transfer has landed.
    pub async fn spend(
        &self,
        owner: &str,
        key_id: &str,
        req: SignedSpendRequest,
        cancel: &CancellationToken,
    ) -> Result<SpendOutcome> {
        // 1. ownership check.
        let key = self.engine.get(key_id, cancel).await?;
        if !key.owner_addr.eq_ignore_ascii_case(owner) {
            return Err(SessionError::Forbidden {
                key_id: key_id.to_string(),
                given: owner.to_string(),
                actual: key.owner_addr.clone(),
            });
        }

        // 2. acquire the appropriate lockset for the whole critical section.
        let delegated = key.parent_key_id.is_some();
        let guard = if delegated {
            self.engine.lock_chain(key_id, cancel).await?
        } else {
            self.engine.lock_key(key_id).await
        };

        let result = self.spend_locked(key_id, &req, delegated, cancel).await;
        drop(guard);
        result
    }

    async fn spend_locked(
        &self,
        key_id: &str,
        req: &SignedSpendRequest,
        delegated: bool,
        cancel: &CancellationToken,
    ) -> Result<SpendOutcome> {
        // 3. validate.
        let key = self.engine.validate_signed(key_id, req, cancel).await?;
        let amount = Amount::parse_positive(&req.amount).map_err(|_| SessionError::InvalidAmount(req.amount.clone()))?;

        if cancel.is_cancelled() {
            return Err(SessionError::Internal("cancelled before ledger hold".to_string()));
        }

        // 4. ledger hold.
        self.ledger.hold(&key.owner_addr, &amount, key_id).await?;

        // 5. on-chain transfer; best-effort release on failure.
        let receipt = match self.wallet_transfer(&req.to, &amount).await {
            Ok(r) => r,
            Err(e) => {
                if let Err(release_err) = self.ledger.release_hold(&key.owner_addr, &amount, key_id).await {
                    warn!(key_id = %key_id, error = %release_err, "best-effort hold release failed after transfer failure");
                }
                return Err(e);
            }
        };

        // 6. confirm the hold; on failure, the on-chain transfer already
        // landed, so this is surfaced as a partial failure and usage is
        // intentionally NOT recorded.
        if let Err(_confirm_err) = self.ledger.confirm_hold(&key.owner_addr, &amount, key_id).await {
            warn!(key_id = %key_id, tx_hash = %receipt.tx_hash, "ledger confirm failed after successful transfer");
            return Err(SessionError::PartialFailure {
                tx_hash: receipt.tx_hash,
            });
        }

        if self.demo_mode {
            if let Err(e) = self.ledger.deposit(&req.to, &amount, key_id).await {
                warn!(key_id = %key_id, error = %e, "demo-mode recipient credit failed");
            }
        }

        // 7. record usage; a failure here is logged but does not change
        // the result the client sees (a retry would double-spend).
        let usage_result = if delegated {
            self.engine.record_usage_with_cascade(key_id, &amount, req.nonce, cancel).await
        } else {
            self.engine.record_usage(key_id, &amount, req.nonce, cancel).await
        };
        if let Err(e) = usage_result {
            warn!(key_id = %key_id, error = %e, "usage recording failed after successful transfer");
        }

        // 8. out-of-band events; best-effort.
        self.recorder
            .record_transaction(&receipt.tx_hash, &key.owner_addr, &req.to, &amount, req.service_id.as_deref())
            .await;
        self.events
            .emit_transaction(&receipt.tx_hash, &key.owner_addr, &req.to, &amount)
            .await;
        self.events.emit_session_key_used(key_id, &key.owner_addr, &amount).await;

        info!(key_id = %key_id, tx_hash = %receipt.tx_hash, amount = %amount.format(), "spend completed");
        Ok(SpendOutcome {
            tx_hash: receipt.tx_hash,
            amount: amount.format(),
        })
    }

    async fn wallet_transfer(&self, to: &str, amount: &Amount) -> Result<crate::externals::TransferReceipt> {
        if self.demo_mode {
            return Ok(crate::externals::TransferReceipt {
                tx_hash: format!("0xdemo-synth-{}", amount.format().replace('.', "")),
            });
        }
        self.wallet
            .transfer(to, amount)
            .await
            .map_err(|e| SessionError::TransferFailed(e.to_string()))
    }
}
