//! Spend orchestrator: the per-request pipeline that wraps the
//! authorization engine with the external ledger, wallet, recorder,
//! and event emitter.

pub mod externals;
pub mod pipeline;

pub use externals::{
    BalanceService, EventEmitter, NullEventEmitter, NullTransactionRecorder, StubLedger, StubWallet,
    TransactionRecorder, TransferReceipt, WalletService,
};
pub use pipeline::{Orchestrator, SpendOutcome};
