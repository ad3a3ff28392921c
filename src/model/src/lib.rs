//! Entity model for the session-key authorization engine: the
//! `SessionKey` itself, its `Permission` envelope, mutable `Usage`
//! counters, capability `Scope`s, and delegation audit entries.

pub mod audit;
pub mod permission;
pub mod scope;
pub mod session_key;
pub mod usage;

pub use audit::{DelegationEvent, DelegationLogEntry};
pub use permission::Permission;
pub use scope::Scope;
pub use session_key::{SessionKey, MAX_DEPTH, ROTATION_GRACE};
pub use usage::Usage;
