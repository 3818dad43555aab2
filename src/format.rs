//! The composite-key and value encoding shared by the [`Cache`](crate::cache::Cache),
//! the [`Wal`](crate::wal::Wal), and TSM files.

use std::cmp::Ordering;

/// Separator placed between a series key and a field name to form a composite key.
///
/// Four bytes, chosen (as in the system this core is modeled on) to be vanishingly unlikely
/// to occur inside a series key or field name.
pub const SEP: &[u8] = b"#!~#";

/// `seriesKey ‖ SEP ‖ fieldName`, the key every tier (Cache, WAL, TSM file) indexes by.
pub type CompositeKey = Vec<u8>;

/// Builds a composite key from a series key and a field name, reusing `buf`'s allocation.
pub fn make_composite_key(buf: &mut Vec<u8>, series_key: &[u8], field_name: &[u8]) {
    buf.clear();
    buf.reserve(series_key.len() + SEP.len() + field_name.len());
    buf.extend_from_slice(series_key);
    buf.extend_from_slice(SEP);
    buf.extend_from_slice(field_name);
}

/// Splits a composite key at the first occurrence of [`SEP`].
///
/// Returns `None` if `key` does not contain `SEP`; well-formed composite keys always do.
#[must_use]
pub fn series_and_field_from_composite_key(key: &[u8]) -> Option<(&[u8], &[u8])> {
    find_subslice(key, SEP).map(|idx| (&key[..idx], &key[idx + SEP.len()..]))
}

/// Strips the field-name suffix from a composite key, returning only the series key.
///
/// Used to compute a file's key range in terms of series rather than composite keys
/// (see `deleteSeriesRange` phase A in the design document).
#[must_use]
pub fn strip_field(key: &[u8]) -> &[u8] {
    series_and_field_from_composite_key(key).map_or(key, |(series, _)| series)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A single typed value stored at a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f64),
    Integer(i64),
    Unsigned(u64),
    String(Vec<u8>),
    Boolean(bool),
}

/// The on-disk block type code for a [`Value`] variant.
///
/// Codes `5..=7` are reserved/unknown and never produced by [`Value::block_type`], but may be
/// read back from a file written by a newer version of the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockType(pub u8);

impl Value {
    #[must_use]
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Float(_) => BlockType(0),
            Self::Integer(_) => BlockType(1),
            Self::Boolean(_) => BlockType(2),
            Self::String(_) => BlockType(3),
            Self::Unsigned(_) => BlockType(4),
        }
    }
}

/// The InfluxQL-ish data type a block type code decodes to, per spec.md §8's round-trip property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float,
    Integer,
    Boolean,
    String,
    Unsigned,
    Unknown,
}

#[must_use]
pub fn block_type_to_data_type(block_type: BlockType) -> DataType {
    match block_type.0 {
        0 => DataType::Float,
        1 => DataType::Integer,
        2 => DataType::Boolean,
        3 => DataType::String,
        4 => DataType::Unsigned,
        _ => DataType::Unknown,
    }
}

/// A timestamped value, as stored in the Cache, the WAL, and TSM files.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedValue {
    pub timestamp: i64,
    pub value: Value,
}

impl TimestampedValue {
    #[must_use]
    pub fn new(timestamp: i64, value: Value) -> Self {
        Self { timestamp, value }
    }
}

/// Orders purely by timestamp, matching the TSM invariant that each `(key, timestamp)` pair
/// appears at most once within a file; values sharing a timestamp are considered equal for
/// ordering purposes and the later write wins on dedup.
pub fn cmp_by_timestamp(a: &TimestampedValue, b: &TimestampedValue) -> Ordering {
    a.timestamp.cmp(&b.timestamp)
}

/// A field value as received off the wire: a type tag plus payload, before it has been checked
/// against the known [`Value`] variants. `Unknown` carries the unrecognized tag byte so
/// `WritePoints` can report which field failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFieldValue {
    Float(f64),
    Integer(i64),
    Unsigned(u64),
    Boolean(bool),
    String(Vec<u8>),
    Unknown(u8),
}

impl RawFieldValue {
    /// Converts to a [`Value`], or `None` if this is an [`RawFieldValue::Unknown`] tag.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Float(f) => Some(Value::Float(f)),
            Self::Integer(i) => Some(Value::Integer(i)),
            Self::Unsigned(u) => Some(Value::Unsigned(u)),
            Self::Boolean(b) => Some(Value::Boolean(b)),
            Self::String(s) => Some(Value::String(s)),
            Self::Unknown(_) => None,
        }
    }
}

/// One point of a `WritePoints` batch: a series key, a timestamp, and one or more field values.
#[derive(Debug, Clone)]
pub struct Point {
    pub series_key: Vec<u8>,
    pub timestamp: i64,
    pub fields: Vec<(Vec<u8>, RawFieldValue)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_key_round_trips() {
        let mut buf = Vec::new();
        make_composite_key(&mut buf, b"cpu,host=a", b"usage");
        let (series, field) = series_and_field_from_composite_key(&buf).unwrap();
        assert_eq!(series, b"cpu,host=a");
        assert_eq!(field, b"usage");
    }

    #[test]
    fn strip_field_removes_suffix() {
        let mut buf = Vec::new();
        make_composite_key(&mut buf, b"cpu,host=a", b"usage");
        assert_eq!(strip_field(&buf), b"cpu,host=a");
    }

    #[test]
    fn block_type_round_trip() {
        assert_eq!(block_type_to_data_type(Value::Float(0.0).block_type()), DataType::Float);
        assert_eq!(block_type_to_data_type(Value::Integer(0).block_type()), DataType::Integer);
        assert_eq!(block_type_to_data_type(Value::Boolean(true).block_type()), DataType::Boolean);
        assert_eq!(
            block_type_to_data_type(Value::String(Vec::new()).block_type()),
            DataType::String,
        );
        assert_eq!(block_type_to_data_type(Value::Unsigned(0).block_type()), DataType::Unsigned);
        assert_eq!(block_type_to_data_type(BlockType(5)), DataType::Unknown);
        assert_eq!(block_type_to_data_type(BlockType(7)), DataType::Unknown);
    }
}
