//! Property-Based Tests for Known Identifier Linking
//!
//! For any known identifier, data provider and auth state, a link request
//! SHALL reach the service unchanged against the current identity, and the
//! linked record SHALL carry the data provider it was linked through.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use visitor_engine::{IdentityManager, LinkCallback};
use visitor_test_utils::fixtures::{service_record, test_config};
use visitor_test_utils::generators::{arb_auth_state, arb_visitor_id};
use visitor_test_utils::{LinkCall, MemoryIdentityStore, MockIdentityService};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_link_forwards_request_and_tags_record(
        current in arb_visitor_id(),
        known_id in "[a-z0-9@.]{1,24}",
        data_provider_id in 0i64..100_000i64,
        auth_state in prop::option::of(arb_auth_state()),
    ) {
        let service = Arc::new(MockIdentityService::new());
        let store = Arc::new(MemoryIdentityStore::with_record(service_record(&current)));
        let manager = IdentityManager::builder(test_config())
            .service(service.clone())
            .store(store)
            .build()
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        let callback: LinkCallback = Box::new(move |result| {
            let _ = tx.send(result.clone());
        });
        prop_assert!(manager.link_to_known_identifier(
            known_id.clone(),
            data_provider_id,
            auth_state,
            Some(callback),
        ));

        let linked = rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|e| TestCaseError::fail(e.to_string()))?
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(linked.data_provider_id, Some(data_provider_id));
        prop_assert_eq!(manager.current_record(), Some(linked));
        prop_assert_eq!(
            service.links(),
            vec![LinkCall {
                known_id,
                current_id: Some(current),
                data_provider_id,
                auth_state,
            }]
        );
    }
}
