//! Fuzz target for ContentHeader::decode
//!
//! Arbitrary content-header payloads: property flag words, optional field
//! presence, embedded header tables. Must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ottermq_proto::ContentHeader;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = ContentHeader::decode(data) {
        let _ = header.encode();
    }
});
