//! Visitor Test Utilities
//!
//! Shared test infrastructure for the visitor workspace:
//! - A scripted mock identity service
//! - Proptest generators for records and auth states
//! - Fixtures for common configurations and records

// Re-export the in-memory store from its source crate
pub use visitor_storage::{IdentityStore, MemoryIdentityStore};

// Re-export core types for convenience
pub use visitor_core::{
    AuthState, ErrorKind, IdentityRecord, ServiceError, ServiceResult, Timestamp, VisitorConfig,
};
pub use visitor_client::IdentityService;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK IDENTITY SERVICE
// ============================================================================

/// Scripted result of a single mock service call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed(IdentityRecord),
    Fail(ServiceError),
    /// Sleep, then resolve to the inner outcome.
    Delay(Duration, Box<MockOutcome>),
    /// Never complete.
    Hang,
}

impl MockOutcome {
    pub fn succeed(id: &str) -> Self {
        MockOutcome::Succeed(fixtures::service_record(id))
    }

    pub fn fail(kind: ErrorKind) -> Self {
        MockOutcome::Fail(fixtures::service_error(kind))
    }

    pub fn delayed(delay: Duration, outcome: MockOutcome) -> Self {
        MockOutcome::Delay(delay, Box::new(outcome))
    }
}

/// A recorded link call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCall {
    pub known_id: String,
    pub current_id: Option<String>,
    pub data_provider_id: i64,
    pub auth_state: Option<AuthState>,
}

/// Identity service whose calls consume a shared script of outcomes.
///
/// Each call, regardless of operation, takes the next scripted outcome.
/// Once the script is empty every call resolves to the fallback.
#[derive(Debug)]
pub struct MockIdentityService {
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    new_calls: AtomicUsize,
    new_and_link_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    link_calls: AtomicUsize,
    refreshed_ids: Mutex<Vec<String>>,
    links: Mutex<Vec<LinkCall>>,
}

impl MockIdentityService {
    /// Mock that always succeeds with a fresh `mock-ecid` record.
    pub fn new() -> Self {
        Self::with_fallback(MockOutcome::succeed("mock-ecid"))
    }

    pub fn with_fallback(fallback: MockOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            new_calls: AtomicUsize::new(0),
            new_and_link_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            link_calls: AtomicUsize::new(0),
            refreshed_ids: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Mock that never answers.
    pub fn hanging() -> Self {
        Self::with_fallback(MockOutcome::Hang)
    }

    /// Mock that always fails with `kind`.
    pub fn failing(kind: ErrorKind) -> Self {
        Self::with_fallback(MockOutcome::fail(kind))
    }

    /// Queue an outcome for the next unscripted call.
    pub fn then(self, outcome: MockOutcome) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }

    pub fn new_calls(&self) -> usize {
        self.new_calls.load(Ordering::SeqCst)
    }

    pub fn new_and_link_calls(&self) -> usize {
        self.new_and_link_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn link_calls(&self) -> usize {
        self.link_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.new_calls() + self.new_and_link_calls() + self.refresh_calls() + self.link_calls()
    }

    /// Ids passed to `refresh_existing`, in call order.
    pub fn refreshed_ids(&self) -> Vec<String> {
        self.refreshed_ids.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Link requests, in call order. `request_new_and_link` calls are
    /// recorded with no current id.
    pub fn links(&self) -> Vec<LinkCall> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn play(&self) -> ServiceResult<IdentityRecord> {
        let mut outcome = self.next_outcome();
        loop {
            match outcome {
                MockOutcome::Succeed(record) => return Ok(record),
                MockOutcome::Fail(error) => return Err(error),
                MockOutcome::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    outcome = *inner;
                }
                MockOutcome::Hang => return std::future::pending().await,
            }
        }
    }
}

impl Default for MockIdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityService for MockIdentityService {
    async fn request_new(&self) -> ServiceResult<IdentityRecord> {
        self.new_calls.fetch_add(1, Ordering::SeqCst);
        self.play().await
    }

    async fn request_new_and_link(
        &self,
        known_id: &str,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> ServiceResult<IdentityRecord> {
        self.new_and_link_calls.fetch_add(1, Ordering::SeqCst);
        self.links.lock().unwrap_or_else(PoisonError::into_inner).push(LinkCall {
            known_id: known_id.to_string(),
            current_id: None,
            data_provider_id,
            auth_state,
        });
        self.play().await
    }

    async fn refresh_existing(&self, current_id: &str) -> ServiceResult<IdentityRecord> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(current_id.to_string());
        self.play().await
    }

    async fn link_known_identifier(
        &self,
        known_id: &str,
        current_id: &str,
        data_provider_id: i64,
        auth_state: Option<AuthState>,
    ) -> ServiceResult<IdentityRecord> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        self.links.lock().unwrap_or_else(PoisonError::into_inner).push(LinkCall {
            known_id: known_id.to_string(),
            current_id: Some(current_id.to_string()),
            data_provider_id,
            auth_state,
        });
        self.play().await
    }

    fn name(&self) -> &str {
        "mock"
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for visitor types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    pub fn arb_auth_state() -> impl Strategy<Value = AuthState> {
        prop_oneof![
            Just(AuthState::Unknown),
            Just(AuthState::Authenticated),
            Just(AuthState::LoggedOut),
        ]
    }

    pub fn arb_visitor_id() -> impl Strategy<Value = String> {
        "[0-9]{10,38}"
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..4_102_444_800i64, 0u32..1_000_000_000u32).prop_map(|(secs, nanos)| {
            Utc.timestamp_opt(secs, nanos)
                .single()
                .unwrap_or_else(Utc::now)
        })
    }

    /// Any record that may be persisted.
    pub fn arb_identity_record() -> impl Strategy<Value = IdentityRecord> {
        (
            arb_visitor_id(),
            prop::option::of(0i64..100_000i64),
            prop::option::of(0i64..10_000_000i64),
            prop::option::of(0i32..20i32),
            ".{0,64}",
            arb_timestamp(),
        )
            .prop_map(|(id, data_provider_id, id_sync_ttl, region, blob, next_refresh_at)| {
                IdentityRecord {
                    id,
                    data_provider_id,
                    id_sync_ttl,
                    region,
                    blob,
                    next_refresh_at,
                }
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built configurations and records.

    use super::*;
    use chrono::Utc;

    pub const TEST_ORG_ID: &str = "ORG1@AdobeOrg";

    /// Config with short timeouts suited to tests.
    pub fn test_config() -> VisitorConfig {
        VisitorConfig::new(TEST_ORG_ID).with_request_timeout(Duration::from_millis(200))
    }

    /// A fresh record as the service would return it.
    pub fn service_record(id: &str) -> IdentityRecord {
        IdentityRecord::from_service(id, 600, 6, "blob")
    }

    /// A record whose refresh instant has already passed.
    pub fn stale_record(id: &str) -> IdentityRecord {
        service_record(id).with_next_refresh_at(Utc::now() - chrono::Duration::hours(1))
    }

    pub fn service_error(kind: ErrorKind) -> ServiceError {
        match kind {
            ErrorKind::NotConnected => ServiceError::NotConnected {
                reason: "mock offline".to_string(),
            },
            ErrorKind::InvalidResponse => ServiceError::InvalidResponse {
                reason: "mock malformed payload".to_string(),
            },
            ErrorKind::InvalidIdentityPayload => ServiceError::InvalidIdentityPayload {
                reason: "mock missing d_mid".to_string(),
            },
            ErrorKind::RequestFailed => ServiceError::RequestFailed {
                status: 503,
                message: "mock unavailable".to_string(),
            },
        }
    }
}
