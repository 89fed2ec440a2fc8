//! Fuzz target: cloud-config merge.
//!
//! Merging must never panic, and merging a merged document again must
//! return it unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qvm_executor::merge_cloud_config;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(merged) = merge_cloud_config(input) {
        let again = merge_cloud_config(&merged).expect("merged output must merge again");
        assert_eq!(merged, again, "merge must be idempotent");
    }
});
