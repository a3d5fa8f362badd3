//! Process-wide initialization. Kept in its own test binary so no other
//! test observes the global instance.

use std::sync::Arc;
use std::thread;

use visitor_engine::{ConsumerFacade, IdentityManager};
use visitor_test_utils::{MemoryIdentityStore, MockIdentityService, VisitorConfig};

fn initialize(org_id: &str) -> &'static IdentityManager {
    IdentityManager::initialize(
        VisitorConfig::new(org_id).with_max_retries(0),
        Arc::new(MockIdentityService::new()),
        Arc::new(MemoryIdentityStore::new()),
    )
    .expect("initialize should succeed")
}

#[test]
fn test_initialize_is_first_caller_wins() {
    assert!(IdentityManager::global().is_none());
    assert!(ConsumerFacade::global().is_none());

    let racers: Vec<_> = (0..8)
        .map(|i| thread::spawn(move || initialize(&format!("ORG{}", i)) as *const IdentityManager as usize))
        .collect();
    let addresses: Vec<usize> = racers.into_iter().map(|r| r.join().unwrap()).collect();
    assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));

    let winner = IdentityManager::global().expect("global should be set");
    let org_id = winner.org_id().to_string();
    assert!(org_id.starts_with("ORG"));

    let again = initialize("LATECOMER");
    assert!(std::ptr::eq(winner, again));
    assert_eq!(again.org_id(), org_id);
    assert!(ConsumerFacade::global().is_some());
}
