//! Fuzz test for TOML configuration loading
//!
//! Run with: cargo +nightly fuzz run config_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use visitor_core::VisitorConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(config) = VisitorConfig::from_toml(input) {
            // Derived values must not overflow for any accepted config
            let _ = config.consumer_wait();
            let _ = config.link_params();

            if config.validate().is_ok() {
                assert!(!config.org_id.trim().is_empty());
                assert!(config.request_timeout_ms > 0);
            }
        }
    }
});
