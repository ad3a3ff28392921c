//! The session-key authorization engine: creation, delegation,
//! revocation, rotation, and signed-spend validation/recording.

pub mod config;
pub mod manager;
pub mod request;
pub mod service_resolver;
pub mod tree;

pub use config::EngineConfig;
pub use manager::Manager;
pub use request::{resolve_expiry, CreateKeyRequest, DelegationRequest, SignedSpendRequest};
pub use service_resolver::{NullServiceResolver, ServiceResolver};
pub use tree::{build_subtree, DelegationNode};
