//! Fuzz target for Method::decode
//!
//! Arbitrary method-frame payloads: class/method prefixes, argument lists,
//! bit groups and embedded field tables. Invalid input must come back as
//! an error, never a panic. Valid decodes must re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ottermq_proto::Method;

fuzz_target!(|data: &[u8]| {
    if let Ok(method) = Method::decode(data) {
        // Anything we accepted must render back onto the wire
        let _ = method.encode();
    }
});
