//! Fuzz target for RawFrame::decode
//!
//! Feeds arbitrary byte sequences to the frame envelope decoder to find:
//! - Parser crashes or panics
//! - Integer overflows in size calculations
//! - Buffer over-reads
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ottermq_proto::RawFrame;

fuzz_target!(|data: &[u8]| {
    // Unlimited and clamped frame-max both exercise the size check
    let _ = RawFrame::decode(data, 0);
    let _ = RawFrame::decode(data, 4096);
});
