//! Core value model for DocPack
//!
//! A column compresses a stream of typed values. Values follow the wire
//! type tags of the document format so that literals embedded in a column
//! stay parseable by a standard element parser.

use crate::error::{DocPackError, Result};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag byte for every storable (and a few non-storable) value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    /// Stream / interleaved-region terminator. Never carried by a `Value`.
    Eoo = 0x00,
    /// 64-bit IEEE-754 float
    Double = 0x01,
    /// UTF-8 string
    String = 0x02,
    /// Nested document
    Document = 0x03,
    /// Array (document with index field names)
    Array = 0x04,
    /// Opaque bytes
    Binary = 0x05,
    /// Undefined
    Undefined = 0x06,
    /// 12-byte object id
    ObjectId = 0x07,
    /// Boolean
    Bool = 0x08,
    /// Milliseconds since the epoch
    Date = 0x09,
    /// Null
    Null = 0x0A,
    /// Regular expression
    RegEx = 0x0B,
    /// Namespace + object id pointer
    DbRef = 0x0C,
    /// Code string
    Code = 0x0D,
    /// Symbol
    Symbol = 0x0E,
    /// Code string with a scope document
    CodeWithScope = 0x0F,
    /// 32-bit signed integer
    Int32 = 0x10,
    /// Internal 64-bit timestamp
    Timestamp = 0x11,
    /// 64-bit signed integer
    Int64 = 0x12,
    /// 128-bit decimal
    Decimal128 = 0x13,
    /// Always-greatest sentinel, rejected on append
    MaxKey = 0x7F,
    /// Always-smallest sentinel, rejected on append
    MinKey = 0xFF,
}

impl ValueType {
    /// The wire tag byte for this type
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Types whose deltas are computed in the 128-bit domain
    pub(crate) fn uses_128bit(self) -> bool {
        matches!(
            self,
            ValueType::String | ValueType::Binary | ValueType::Decimal128
        )
    }

    /// Types encoded as a delta of deltas rather than a plain delta
    pub(crate) fn uses_delta_of_delta(self) -> bool {
        self == ValueType::Timestamp
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Eoo => "EOO",
            ValueType::Double => "Double",
            ValueType::String => "String",
            ValueType::Document => "Document",
            ValueType::Array => "Array",
            ValueType::Binary => "Binary",
            ValueType::Undefined => "Undefined",
            ValueType::ObjectId => "ObjectId",
            ValueType::Bool => "Bool",
            ValueType::Date => "Date",
            ValueType::Null => "Null",
            ValueType::RegEx => "RegEx",
            ValueType::DbRef => "DbRef",
            ValueType::Code => "Code",
            ValueType::Symbol => "Symbol",
            ValueType::CodeWithScope => "CodeWithScope",
            ValueType::Int32 => "Int32",
            ValueType::Timestamp => "Timestamp",
            ValueType::Int64 => "Int64",
            ValueType::Decimal128 => "Decimal128",
            ValueType::MaxKey => "MaxKey",
            ValueType::MinKey => "MinKey",
        };
        write!(f, "{}", name)
    }
}

/// 12-byte object id: 4-byte big-endian timestamp, 5-byte instance-unique
/// portion, 3-byte big-endian counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    /// Number of instance-unique bytes in the middle of an object id
    pub const INSTANCE_UNIQUE_LEN: usize = 5;

    /// Create an object id from its raw bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// The raw 12 bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// The 4 timestamp bytes (big endian)
    pub fn timestamp_bytes(&self) -> &[u8] {
        &self.0[0..4]
    }

    /// The 5 instance-unique bytes, constant for one generating process
    pub fn instance_unique(&self) -> &[u8] {
        &self.0[4..9]
    }

    /// The 3 counter bytes (big endian)
    pub fn counter_bytes(&self) -> &[u8] {
        &self.0[9..12]
    }
}

/// 128-bit decimal, stored as its two 64-bit halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal128 {
    /// Low 64 bits
    pub low: u64,
    /// High 64 bits
    pub high: u64,
}

impl Decimal128 {
    /// Create a decimal from its low and high halves
    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }
}

/// A document: fields in insertion order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    /// Create an empty document
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Append a field, keeping insertion order
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Builder-style insert
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Look up a field by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Check whether a field name is present
    pub fn contains_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    /// The fields in insertion order
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    /// Iterate over `(name, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize the document: `u32 LE total size + elements + 0x00`
    pub fn write_to(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32_le(0);
        for (name, value) in self.iter() {
            buf.put_u8(value.value_type().as_byte());
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            value.write_payload(buf);
        }
        buf.put_u8(0);
        let size = (buf.len() - start) as u32;
        buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
    }
}

/// A single typed value, one row of a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit IEEE-754 float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Nested document
    Document(Document),
    /// Array of values
    Array(Vec<Value>),
    /// Opaque bytes (subtype byte fixed to 0 on the wire)
    Binary(Vec<u8>),
    /// Undefined
    Undefined,
    /// 12-byte object id
    ObjectId(ObjectId),
    /// Boolean
    Bool(bool),
    /// Milliseconds since the epoch
    Date(i64),
    /// Null
    Null,
    /// Regular expression
    RegEx {
        /// Pattern source
        pattern: String,
        /// Option flags
        options: String,
    },
    /// Namespace + object id pointer
    DbRef {
        /// Target namespace
        namespace: String,
        /// Target object id
        id: ObjectId,
    },
    /// Code string
    Code(String),
    /// Symbol
    Symbol(String),
    /// Code string with a scope document
    CodeWithScope {
        /// Code source
        code: String,
        /// Captured scope
        scope: Document,
    },
    /// 32-bit signed integer
    Int32(i32),
    /// Internal 64-bit timestamp
    Timestamp(u64),
    /// 64-bit signed integer
    Int64(i64),
    /// 128-bit decimal
    Decimal128(Decimal128),
    /// Always-greatest sentinel, rejected on append
    MaxKey,
    /// Always-smallest sentinel, rejected on append
    MinKey,
}

impl Value {
    /// The type tag of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Document(_) => ValueType::Document,
            Value::Array(_) => ValueType::Array,
            Value::Binary(_) => ValueType::Binary,
            Value::Undefined => ValueType::Undefined,
            Value::ObjectId(_) => ValueType::ObjectId,
            Value::Bool(_) => ValueType::Bool,
            Value::Date(_) => ValueType::Date,
            Value::Null => ValueType::Null,
            Value::RegEx { .. } => ValueType::RegEx,
            Value::DbRef { .. } => ValueType::DbRef,
            Value::Code(_) => ValueType::Code,
            Value::Symbol(_) => ValueType::Symbol,
            Value::CodeWithScope { .. } => ValueType::CodeWithScope,
            Value::Int32(_) => ValueType::Int32,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Int64(_) => ValueType::Int64,
            Value::Decimal128(_) => ValueType::Decimal128,
            Value::MaxKey => ValueType::MaxKey,
            Value::MinKey => ValueType::MinKey,
        }
    }

    /// Byte-level equality: doubles compare by bit pattern, containers
    /// recurse
    pub fn binary_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Document(a), Value::Document(b)) => documents_binary_eq(a, b),
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.binary_eq(y))
            }
            (
                Value::CodeWithScope { code: ac, scope: asc },
                Value::CodeWithScope { code: bc, scope: bsc },
            ) => ac == bc && documents_binary_eq(asc, bsc),
            _ => self == other,
        }
    }

    /// Reject values that cannot be stored in a column, anywhere in the
    /// tree, before any builder state is touched
    pub fn check_storable(&self) -> Result<()> {
        match self {
            Value::MinKey | Value::MaxKey => Err(DocPackError::InvalidType(self.value_type())),
            Value::Document(doc) => documents_check_storable(doc),
            Value::CodeWithScope { scope, .. } => documents_check_storable(scope),
            Value::Array(items) => items.iter().try_for_each(Value::check_storable),
            _ => Ok(()),
        }
    }

    /// Serialize the payload (everything after the tag byte and field name)
    pub fn write_payload(&self, buf: &mut BytesMut) {
        match self {
            Value::Double(d) => buf.put_u64_le(d.to_bits()),
            Value::String(s) | Value::Code(s) | Value::Symbol(s) => write_string(s, buf),
            Value::Document(doc) => doc.write_to(buf),
            Value::Array(items) => write_array(items, buf),
            Value::Binary(data) => {
                buf.put_u32_le(data.len() as u32);
                buf.put_u8(0);
                buf.put_slice(data);
            }
            Value::Undefined | Value::Null | Value::MinKey | Value::MaxKey => {}
            Value::ObjectId(oid) => buf.put_slice(oid.as_bytes()),
            Value::Bool(b) => buf.put_u8(*b as u8),
            Value::Date(ms) => buf.put_i64_le(*ms),
            Value::RegEx { pattern, options } => {
                buf.put_slice(pattern.as_bytes());
                buf.put_u8(0);
                buf.put_slice(options.as_bytes());
                buf.put_u8(0);
            }
            Value::DbRef { namespace, id } => {
                write_string(namespace, buf);
                buf.put_slice(id.as_bytes());
            }
            Value::CodeWithScope { code, scope } => {
                let start = buf.len();
                buf.put_u32_le(0);
                write_string(code, buf);
                scope.write_to(buf);
                let size = (buf.len() - start) as u32;
                buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
            }
            Value::Int32(v) => buf.put_i32_le(*v),
            Value::Timestamp(v) => buf.put_u64_le(*v),
            Value::Int64(v) => buf.put_i64_le(*v),
            Value::Decimal128(d) => {
                buf.put_u64_le(d.low);
                buf.put_u64_le(d.high);
            }
        }
    }
}

fn documents_binary_eq(a: &Document, b: &Document) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((an, av), (bn, bv))| an == bn && av.binary_eq(bv))
}

fn documents_check_storable(doc: &Document) -> Result<()> {
    doc.iter().try_for_each(|(_, v)| v.check_storable())
}

/// `u32 LE (len + 1) + bytes + NUL`
fn write_string(s: &str, buf: &mut BytesMut) {
    buf.put_u32_le(s.len() as u32 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Arrays serialize as documents keyed by decimal indices
fn write_array(items: &[Value], buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u32_le(0);
    for (i, value) in items.iter().enumerate() {
        buf.put_u8(value.value_type().as_byte());
        buf.put_slice(i.to_string().as_bytes());
        buf.put_u8(0);
        value.write_payload(buf);
    }
    buf.put_u8(0);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<Decimal128> for Value {
    fn from(v: Decimal128) -> Self {
        Value::Decimal128(v)
    }
}
