//! Fuzz target for FieldTable::decode
//!
//! Arbitrary field-table envelopes, including nested tables and unknown
//! value tags. Accepted tables must round-trip through encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use ottermq_proto::{Decoder, Encoder, FieldTable};

fuzz_target!(|data: &[u8]| {
    let mut dec = Decoder::new(data);
    if let Ok(table) = FieldTable::decode(&mut dec) {
        let mut enc = Encoder::new();
        table.encode(&mut enc);
        let wire = enc.finish();

        let mut dec = Decoder::new(&wire);
        let again = FieldTable::decode(&mut dec).expect("re-decode of our own encoding");
        assert_eq!(again, table);
    }
});
