//! Fuzz test for identity service response parsing
//!
//! Run with: cargo +nightly fuzz run response_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use visitor_client::parse_identity_response;
use visitor_core::ErrorKind;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = std::str::from_utf8(data) {
        match parse_identity_response(body) {
            // A parsed record is always present
            Ok(record) => assert!(record.is_present(), "Parsed record must have an id"),
            // Parsing only ever reports payload problems
            Err(e) => assert!(matches!(
                e.kind(),
                ErrorKind::InvalidResponse | ErrorKind::InvalidIdentityPayload
            )),
        }
    }
});
