//! Storage seam for session keys: the `Store` trait, an in-memory
//! implementation, a hand-rolled cancellation token, and the
//! delegation audit log.

pub mod audit;
pub mod cancellation;
pub mod memory;
pub mod store;

pub use audit::{DelegationAuditLogger, InMemoryAuditLog};
pub use cancellation::CancellationToken;
pub use memory::InMemoryStore;
pub use store::Store;
