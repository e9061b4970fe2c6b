//! AMQP field tables.
//!
//! A field table is a long-string envelope containing repeated
//! `[name: short-string][tag: octet][value]` entries. The supported tags are
//! the ones the broker actually exchanges: `S` (long-string), `I` (i32),
//! `F` (nested table), `t` (boolean), `l` (i64) and `T` (timestamp).
//! Entry order is preserved exactly as supplied by the caller; the decoder
//! imposes no ordering of its own.

use crate::{
    codec::{Decoder, Encoder},
    errors::{ProtocolError, Result},
};

/// A single field-table value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// `S`: long string (arbitrary bytes, used here as UTF-8 text)
    LongString(String),
    /// `I`: signed 32-bit integer
    Int(i32),
    /// `F`: nested field table
    Table(FieldTable),
    /// `t`: boolean octet
    Bool(bool),
    /// `l`: signed 64-bit integer
    Long(i64),
    /// `T`: POSIX timestamp, seconds since epoch
    Timestamp(i64),
}

impl FieldValue {
    /// Wire tag for this value.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::LongString(_) => b'S',
            Self::Int(_) => b'I',
            Self::Table(_) => b'F',
            Self::Bool(_) => b't',
            Self::Long(_) => b'l',
            Self::Timestamp(_) => b'T',
        }
    }

    fn encode(&self, enc: &mut Encoder) {
        enc.write_u8(self.tag());
        match self {
            Self::LongString(s) => enc.write_long_str(s.as_bytes()),
            Self::Int(v) => enc.write_i32(*v),
            Self::Table(t) => t.encode(enc),
            Self::Bool(v) => enc.write_bool(*v),
            Self::Long(v) => enc.write_i64(*v),
            Self::Timestamp(v) => enc.write_i64(*v),
        }
    }

    fn decode(tag: u8, dec: &mut Decoder<'_>) -> Result<Self> {
        match tag {
            b'S' => {
                let bytes = dec.read_long_str()?;
                let text = String::from_utf8(bytes).map_err(|_| ProtocolError::Utf8)?;
                Ok(Self::LongString(text))
            },
            b'I' => Ok(Self::Int(dec.read_i32()?)),
            b'F' => Ok(Self::Table(FieldTable::decode(dec)?)),
            b't' => Ok(Self::Bool(dec.read_bool()?)),
            b'l' => Ok(Self::Long(dec.read_i64()?)),
            b'T' => Ok(Self::Timestamp(dec.read_i64()?)),
            other => Err(ProtocolError::UnknownFieldType { tag: char::from(other) }),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::LongString(s.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

/// An order-preserving field table.
///
/// Backed by a vector of pairs rather than a map: insertion order is part of
/// the wire contract, and tables are small enough that linear lookup wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldTable(Vec<(String, FieldValue)>);

impl FieldTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any existing entry for `name` in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    /// Look up a value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for a table with no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encode as a long-string envelope.
    pub fn encode(&self, enc: &mut Encoder) {
        let mut inner = Encoder::new();
        for (name, value) in &self.0 {
            // Entry names come from typed structs and are always short
            let _ = inner.write_short_str(name);
            value.encode(&mut inner);
        }
        enc.write_long_str(&inner.finish());
    }

    /// Decode from a long-string envelope.
    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let envelope = dec.read_long_str()?;
        let mut inner = Decoder::new(&envelope);
        let mut entries = Vec::new();
        while !inner.is_empty() {
            let name = inner.read_short_str()?;
            let tag = inner.read_u8()?;
            let value = FieldValue::decode(tag, &mut inner)?;
            entries.push((name, value));
        }
        Ok(Self(entries))
    }
}

impl FromIterator<(String, FieldValue)> for FieldTable {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (name, value) in iter {
            table.insert(name, value);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(table: &FieldTable) -> FieldTable {
        let mut enc = Encoder::new();
        table.encode(&mut enc);
        let bytes = enc.finish();
        let mut dec = Decoder::new(&bytes);
        let parsed = FieldTable::decode(&mut dec).unwrap();
        assert!(dec.is_empty());
        parsed
    }

    #[test]
    fn empty_table_is_four_zero_bytes() {
        let mut enc = Encoder::new();
        FieldTable::new().encode(&mut enc);
        assert_eq!(enc.finish().as_ref(), &[0, 0, 0, 0]);
    }

    #[test]
    fn all_supported_tags_round_trip() {
        let mut nested = FieldTable::new();
        nested.insert("exchange_exchange_bindings", true);

        let mut table = FieldTable::new();
        table.insert("product", "ottermq");
        table.insert("threshold", 42_i32);
        table.insert("capabilities", FieldValue::Table(nested));
        table.insert("enabled", false);
        table.insert("uptime", FieldValue::Long(-3));
        table.insert("booted_at", FieldValue::Timestamp(1_700_000_000));

        assert_eq!(round_trip(&table), table);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut table = FieldTable::new();
        table.insert("zebra", 1_i32);
        table.insert("alpha", 2_i32);
        table.insert("mike", 3_i32);

        let parsed = round_trip(&table);
        let names: Vec<&str> = parsed.iter().map(|(k, _)| k).collect();
        assert_eq!(names, ["zebra", "alpha", "mike"]);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut table = FieldTable::new();
        table.insert("a", 1_i32);
        table.insert("b", 2_i32);
        table.insert("a", 9_i32);

        let names: Vec<&str> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(table.get("a"), Some(&FieldValue::Int(9)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        // name "x", tag 'V' (unsupported)
        let mut enc = Encoder::new();
        let mut inner = Encoder::new();
        inner.write_short_str("x").unwrap();
        inner.write_u8(b'V');
        enc.write_long_str(&inner.finish());
        let bytes = enc.finish();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            FieldTable::decode(&mut dec),
            Err(ProtocolError::UnknownFieldType { tag: 'V' })
        );
    }
}
