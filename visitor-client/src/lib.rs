//! Visitor Client - Identity Service Trait and HTTP Implementation
//!
//! The engine talks to the remote identity service only through the
//! [`IdentityService`] trait. Every operation resolves to either a complete
//! [`IdentityRecord`] or a [`ServiceError`] describing why it failed.

pub mod http;

pub use http::{parse_identity_response, HttpIdentityService};

use async_trait::async_trait;
use visitor_core::{AuthState, IdentityRecord, ServiceResult};

// ============================================================================
// SERVICE TRAIT
// ============================================================================

/// Remote issuer of visitor identities.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Request a brand new identity.
    async fn request_new(&self) -> ServiceResult<IdentityRecord>;

    /// Request a new identity and link `known_id` to it.
    async fn request_new_and_link(
        &self,
        known_id: &str,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> ServiceResult<IdentityRecord>;

    /// Refresh an identity the caller already holds.
    async fn refresh_existing(&self, current_id: &str) -> ServiceResult<IdentityRecord>;

    /// Link `known_id` at `data_provider_id` to the identity `current_id`.
    async fn link_known_identifier(
        &self,
        known_id: &str,
        current_id: &str,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> ServiceResult<IdentityRecord>;

    /// Service name for logs.
    fn name(&self) -> &str {
        "identity-service"
    }
}
