//! Primitive reader/writer pairs for AMQP wire data.
//!
//! All multi-byte integers are big-endian. Booleans inside method argument
//! lists are *bits*: consecutive bit fields share one octet, filled LSB
//! first, and any non-bit read or write closes the current group. The
//! [`Decoder`] and [`Encoder`] both track that cursor so callers can simply
//! interleave `read_bit`/`write_bit` with the other primitives in field
//! order.

use bytes::{Bytes, BytesMut};

use crate::errors::{ProtocolError, Result};

/// Cursor-based reader over a method or header payload.
///
/// Every read is bounds-checked up front; a short buffer yields
/// [`ProtocolError::DecodeOverflow`] without consuming anything.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Current bit group: (octet, bits consumed). Cleared by byte reads.
    bits: Option<(u8, u32)>,
}

impl<'a> Decoder<'a> {
    /// Wrap a payload slice.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, bits: None }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once the whole payload has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current read offset, for error reporting.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        self.bits = None;
        if self.remaining() < n {
            return Err(ProtocolError::DecodeOverflow {
                at: self.pos,
                needed: n - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read a single octet.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a short-uint (u16 BE).
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a long-uint (u32 BE).
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a long-long-uint (u64 BE).
    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read an i64 BE (long-long-int and timestamps).
    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Read an i32 BE (field-table `I` values).
    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a whole-octet boolean (field-table `t` values).
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read one bit from the current bit group, starting a new group (one
    /// fresh octet) if none is open.
    pub fn read_bit(&mut self) -> Result<bool> {
        let (octet, consumed) = match self.bits {
            Some((octet, consumed)) if consumed < 8 => (octet, consumed),
            _ => {
                // take() clears the group, so re-open it after the read
                let octet = self.take(1)?[0];
                (octet, 0)
            },
        };
        let value = (octet >> consumed) & 1 != 0;
        self.bits = Some((octet, consumed + 1));
        Ok(value)
    }

    /// Read a short string: 1-byte length then UTF-8 bytes.
    pub fn read_short_str(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::Utf8)
    }

    /// Read a long string: 4-byte length then raw bytes.
    pub fn read_long_str(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Buffer-building writer mirroring [`Decoder`].
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
    /// Open bit group: (index of the group octet, bits used).
    bits: Option<(usize, u32)>,
}

impl Encoder {
    /// Start with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a pre-sized buffer.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: BytesMut::with_capacity(cap), bits: None }
    }

    fn close_bits(&mut self) {
        self.bits = None;
    }

    /// Append a single octet.
    pub fn write_u8(&mut self, v: u8) {
        self.close_bits();
        self.buf.extend_from_slice(&[v]);
    }

    /// Append a short-uint (u16 BE).
    pub fn write_u16(&mut self, v: u16) {
        self.close_bits();
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a long-uint (u32 BE).
    pub fn write_u32(&mut self, v: u32) {
        self.close_bits();
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a long-long-uint (u64 BE).
    pub fn write_u64(&mut self, v: u64) {
        self.close_bits();
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append an i64 BE (long-long-int and timestamps).
    pub fn write_i64(&mut self, v: i64) {
        self.close_bits();
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append an i32 BE (field-table `I` values).
    pub fn write_i32(&mut self, v: i32) {
        self.close_bits();
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a whole-octet boolean (field-table `t` values).
    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    /// Append one bit, opening a fresh group octet if none is open.
    pub fn write_bit(&mut self, v: bool) {
        let (index, used) = match self.bits {
            Some((index, used)) if used < 8 => (index, used),
            _ => {
                self.buf.extend_from_slice(&[0]);
                (self.buf.len() - 1, 0)
            },
        };
        if v {
            self.buf[index] |= 1 << used;
        }
        self.bits = Some((index, used + 1));
    }

    /// Append a short string (1-byte length prefix).
    pub fn write_short_str(&mut self, s: &str) -> Result<()> {
        if s.len() > u8::MAX as usize {
            return Err(ProtocolError::ShortStringTooLong { len: s.len() });
        }
        self.close_bits();
        self.buf.extend_from_slice(&[s.len() as u8]);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    /// Append a long string (4-byte length prefix).
    pub fn write_long_str(&mut self, bytes: &[u8]) {
        self.close_bits();
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    /// Append raw bytes with no prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.close_bits();
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and hand back the accumulated bytes.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_round_trips() {
        let mut enc = Encoder::new();
        enc.write_u8(0xAB);
        enc.write_u16(0xBEEF);
        enc.write_u32(0xDEAD_BEEF);
        enc.write_u64(0x0123_4567_89AB_CDEF);
        enc.write_i64(-42);
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 0xAB);
        assert_eq!(dec.read_u16().unwrap(), 0xBEEF);
        assert_eq!(dec.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(dec.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(dec.read_i64().unwrap(), -42);
        assert!(dec.is_empty());
    }

    #[test]
    fn strings_round_trip() {
        let mut enc = Encoder::new();
        enc.write_short_str("direct").unwrap();
        enc.write_long_str(b"\x00guest\x00guest");
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_short_str().unwrap(), "direct");
        assert_eq!(dec.read_long_str().unwrap(), b"\x00guest\x00guest");
    }

    #[test]
    fn short_string_over_255_rejected() {
        let mut enc = Encoder::new();
        let long = "x".repeat(256);
        assert_eq!(
            enc.write_short_str(&long),
            Err(ProtocolError::ShortStringTooLong { len: 256 })
        );
    }

    #[test]
    fn bits_pack_lsb_first_into_one_octet() {
        let mut enc = Encoder::new();
        enc.write_bit(true);
        enc.write_bit(false);
        enc.write_bit(true);
        let bytes = enc.finish();
        assert_eq!(bytes.as_ref(), &[0b0000_0101]);

        let mut dec = Decoder::new(&bytes);
        assert!(dec.read_bit().unwrap());
        assert!(!dec.read_bit().unwrap());
        assert!(dec.read_bit().unwrap());
    }

    #[test]
    fn non_bit_write_breaks_the_group() {
        let mut enc = Encoder::new();
        enc.write_bit(true);
        enc.write_u8(7);
        enc.write_bit(true);
        let bytes = enc.finish();
        // bit, octet, new bit group
        assert_eq!(bytes.as_ref(), &[0b0000_0001, 7, 0b0000_0001]);

        let mut dec = Decoder::new(&bytes);
        assert!(dec.read_bit().unwrap());
        assert_eq!(dec.read_u8().unwrap(), 7);
        assert!(dec.read_bit().unwrap());
    }

    #[test]
    fn nine_bits_spill_into_a_second_octet() {
        let mut enc = Encoder::new();
        for _ in 0..8 {
            enc.write_bit(true);
        }
        enc.write_bit(true);
        let bytes = enc.finish();
        assert_eq!(bytes.as_ref(), &[0xFF, 0x01]);

        let mut dec = Decoder::new(&bytes);
        for _ in 0..9 {
            assert!(dec.read_bit().unwrap());
        }
    }

    #[test]
    fn overflow_reports_offset_and_deficit() {
        let mut dec = Decoder::new(&[0, 1]);
        let err = dec.read_u32().unwrap_err();
        assert_eq!(err, ProtocolError::DecodeOverflow { at: 0, needed: 2 });
    }

    #[test]
    fn invalid_utf8_short_string_rejected() {
        let mut dec = Decoder::new(&[2, 0xFF, 0xFE]);
        assert_eq!(dec.read_short_str(), Err(ProtocolError::Utf8));
    }
}
