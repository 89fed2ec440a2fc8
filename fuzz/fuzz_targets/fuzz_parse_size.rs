//! Fuzz target: size string parsing.
//!
//! Arbitrary UTF-8 must either parse or return `InvalidSize`, never panic,
//! and the megabyte result must agree with the byte result.

#![no_main]

use libfuzzer_sys::fuzz_target;
use qvm_core::units::{bytes_to_mb, parse_bytes, parse_mb};

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    match (parse_bytes(input), parse_mb(input)) {
        (Ok(bytes), Ok(mb)) => assert_eq!(bytes_to_mb(bytes), mb),
        (Err(_), Err(_)) => {}
        (bytes, mb) => panic!("parse_bytes and parse_mb disagree on {input:?}: {bytes:?} vs {mb:?}"),
    }
});
