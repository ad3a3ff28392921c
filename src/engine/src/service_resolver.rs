//! External lookup from a service id to its declared service type,
//! consulted during recipient gating when a key restricts spends by
//! service type rather than by bare address.

use async_trait::async_trait;
use session_error::Result;

#[async_trait]
pub trait ServiceResolver: Send + Sync {
    async fn get_service_type(&self, service_id: &str) -> Result<String>;
}

/// Resolver for deployments with no service-type gating configured;
/// any lookup fails closed rather than silently matching.
#[derive(Debug, Default)]
pub struct NullServiceResolver;

#[async_trait]
impl ServiceResolver for NullServiceResolver {
    async fn get_service_type(&self, service_id: &str) -> Result<String> {
        Err(session_error::SessionError::Internal(format!(
            "no service resolver configured to resolve '{service_id}'"
        )))
    }
}
