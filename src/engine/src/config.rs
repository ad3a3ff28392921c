//! Closed configuration set for the authorization engine (§6.4).

use chrono::Duration;
use session_model::MAX_DEPTH;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_delegation_depth: u32,
    pub signature_max_age: Duration,
    pub signature_future_skew: Duration,
    pub rotation_grace_period: Duration,
    pub tree_traversal_depth_guard: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_delegation_depth: MAX_DEPTH,
            signature_max_age: Duration::minutes(5),
            signature_future_skew: Duration::seconds(60),
            rotation_grace_period: Duration::minutes(5),
            tree_traversal_depth_guard: MAX_DEPTH + 2,
        }
    }
}
