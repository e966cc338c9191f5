// Copyright 2020 Joyent, Inc.

//! The dynamic value model carried by a [`Stream`](crate::stream::Stream).
//!
//! Integers are restricted to the IEEE-754 safe range
//! (`-(2^53 - 1)..=2^53 - 1`). An integer outside that range is kept as its
//! eight raw wire bytes so it can be written back unchanged, but it has no
//! numeric value.

use std::collections::HashMap;

/// Largest integer magnitude that survives a round trip through an f64.
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

const INT64_BIAS: u64 = 0x8000_0000_0000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum IntRepr<T> {
    Safe(T),
    Raw([u8; 8]),
}

/// A signed 64-bit integer as seen on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Int64(IntRepr<i64>);

impl Int64 {
    pub fn new(v: i64) -> Int64 {
        Int64::from_wire_bytes(Int64::bias(v))
    }

    /// Build from the 8-byte biased little-endian payload. Payloads that
    /// do not decode to a safe integer are retained verbatim.
    pub fn from_wire_bytes(bytes: [u8; 8]) -> Int64 {
        let v = (u64::from_le_bytes(bytes) ^ INT64_BIAS) as i64;
        if v.unsigned_abs() <= MAX_SAFE_INTEGER {
            Int64(IntRepr::Safe(v))
        } else {
            Int64(IntRepr::Raw(bytes))
        }
    }

    /// The numeric value, or `None` when this is not a safe integer.
    pub fn to_i64(&self) -> Option<i64> {
        match self.0 {
            IntRepr::Safe(v) => Some(v),
            IntRepr::Raw(_) => None,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.to_i64().is_some()
    }

    /// The 8-byte payload used by the widest encoding.
    pub fn wire_bytes(&self) -> [u8; 8] {
        match self.0 {
            IntRepr::Safe(v) => Int64::bias(v),
            IntRepr::Raw(bytes) => bytes,
        }
    }

    /// The full 64-bit integer the payload encodes, safe or not.
    pub fn raw_value(&self) -> i64 {
        (u64::from_le_bytes(self.wire_bytes()) ^ INT64_BIAS) as i64
    }

    fn bias(v: i64) -> [u8; 8] {
        ((v as u64) ^ INT64_BIAS).to_le_bytes()
    }
}

/// An unsigned 64-bit integer as seen on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Uint64(IntRepr<u64>);

impl Uint64 {
    pub fn new(v: u64) -> Uint64 {
        Uint64::from_wire_bytes(v.to_le_bytes())
    }

    pub fn from_wire_bytes(bytes: [u8; 8]) -> Uint64 {
        let v = u64::from_le_bytes(bytes);
        if v <= MAX_SAFE_INTEGER {
            Uint64(IntRepr::Safe(v))
        } else {
            Uint64(IntRepr::Raw(bytes))
        }
    }

    pub fn to_u64(&self) -> Option<u64> {
        match self.0 {
            IntRepr::Safe(v) => Some(v),
            IntRepr::Raw(_) => None,
        }
    }

    pub fn is_safe(&self) -> bool {
        self.to_u64().is_some()
    }

    pub fn wire_bytes(&self) -> [u8; 8] {
        match self.0 {
            IntRepr::Safe(v) => v.to_le_bytes(),
            IntRepr::Raw(bytes) => bytes,
        }
    }

    pub fn raw_value(&self) -> u64 {
        u64::from_le_bytes(self.wire_bytes())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Float64(f64),
    Int64(Int64),
    Uint64(Uint64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => v.to_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint64(v) => v.to_u64(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int64(Int64::new(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::Uint64(Uint64::new(v))
    }
}

impl From<Int64> for Value {
    fn from(v: Int64) -> Value {
        Value::Int64(v)
    }
}

impl From<Uint64> for Value {
    fn from(v: Uint64) -> Value {
        Value::Uint64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::Array(v)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(v: HashMap<String, Value>) -> Value {
        Value::Map(v)
    }
}
