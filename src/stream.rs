// Copyright 2020 Joyent, Inc.

//! The stream format: a byte buffer with a fixed 17-byte header followed by
//! a sequence of tagged values.
//!
//! Each value starts with one tag byte that names its type and, for small
//! values, carries the payload itself:
//!
//! * `0x01` null, `0x02`/`0x03` true/false
//! * `0x04` float64 zero, `0x05` float64 + 8 bytes IEEE-754 (little-endian)
//! * `0x0E..=0x35` int64 literal `tag - 21`; `0x06`/`0x07`/`0x08` int64 in
//!   2/4/8 biased little-endian bytes
//! * `0x36..=0x3F` uint64 literal `tag - 54`; `0x09`/`0x0A`/`0x0B` uint64
//!   in 2/4/8 little-endian bytes
//! * `0x80` empty string, `0x81..=0xBE` short string, `0xBF` long string;
//!   strings carry a trailing `0x00`
//! * `0xC0` empty bytes, `0xC1..=0xFE` short bytes, `0xFF` long bytes
//! * `0x40` empty array, `0x41..=0x5E` short array, `0x5F` long array
//! * `0x60` empty map, `0x61..=0x7E` short map, `0x7F` long map
//!
//! Containers record their total encoded length (tag included) so a reader
//! can verify that the elements it decoded cover exactly that many bytes.
//!
//! Reads return `None` on any failure and leave the read cursor where it
//! was. Writes that fail leave the write cursor where it was.

use std::collections::HashMap;
use std::str;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RpcError;
use crate::value::{Int64, Uint64, Value};

pub const HEADER_SIZE: usize = 17;
pub const STREAM_VERSION: u8 = 1;

const POS_VERSION: usize = 0;
const POS_CALLBACK_ID: usize = 1;
const POS_SEQUENCE: usize = 5;

const INITIAL_CAPACITY: usize = 1024;

/// Containers nested deeper than this are refused by the reader.
const MAX_READ_DEPTH: usize = 128;

const TAG_NULL: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_FALSE: u8 = 0x03;
const TAG_FLOAT64_ZERO: u8 = 0x04;
const TAG_FLOAT64: u8 = 0x05;
const TAG_INT64_2: u8 = 0x06;
const TAG_INT64_4: u8 = 0x07;
const TAG_INT64_8: u8 = 0x08;
const TAG_UINT64_2: u8 = 0x09;
const TAG_UINT64_4: u8 = 0x0A;
const TAG_UINT64_8: u8 = 0x0B;
const TAG_INT64_LITERAL_MIN: u8 = 0x0E;
const TAG_INT64_LITERAL_MAX: u8 = 0x35;
const INT64_LITERAL_ZERO: i64 = 21;
const TAG_UINT64_LITERAL_MIN: u8 = 0x36;
const TAG_UINT64_LITERAL_MAX: u8 = 0x3F;
const TAG_ARRAY_EMPTY: u8 = 0x40;
const TAG_ARRAY_LONG: u8 = 0x5F;
const TAG_MAP_EMPTY: u8 = 0x60;
const TAG_MAP_LONG: u8 = 0x7F;
const TAG_STRING_EMPTY: u8 = 0x80;
const TAG_STRING_LONG: u8 = 0xBF;
const TAG_BYTES_EMPTY: u8 = 0xC0;
const TAG_BYTES_LONG: u8 = 0xFF;

const SHORT_BLOB_MAX: usize = 62;
const SHORT_CONTAINER_MAX: usize = 30;

const INT16_BIAS: i64 = 32_768;
const INT32_BIAS: i64 = 2_147_483_648;

/// An RPC message buffer.
///
/// The write cursor is always the length of the underlying buffer; the
/// read cursor never passes it.
#[derive(Clone, Debug, PartialEq)]
pub struct Stream {
    buf: BytesMut,
    read_pos: usize,
}

impl Default for Stream {
    fn default() -> Self {
        Stream::new()
    }
}

impl Stream {
    pub fn new() -> Stream {
        let mut buf = BytesMut::with_capacity(INITIAL_CAPACITY);
        buf.put_u8(STREAM_VERSION);
        buf.put_slice(&[0; HEADER_SIZE - 1]);
        Stream {
            buf,
            read_pos: HEADER_SIZE,
        }
    }

    /// Wrap a received buffer. The buffer must hold at least a complete
    /// header with a supported version byte.
    pub fn from_bytes(data: &[u8]) -> Option<Stream> {
        Stream::from_buf(BytesMut::from(data))
    }

    pub fn from_buf(buf: BytesMut) -> Option<Stream> {
        if buf.len() < HEADER_SIZE || buf[POS_VERSION] != STREAM_VERSION {
            return None;
        }
        Some(Stream {
            buf,
            read_pos: HEADER_SIZE,
        })
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn set_read_pos(&mut self, pos: usize) -> bool {
        if pos >= HEADER_SIZE && pos <= self.write_pos() {
            self.read_pos = pos;
            true
        } else {
            false
        }
    }

    pub fn write_pos(&self) -> usize {
        self.buf.len()
    }

    /// Move the write cursor. Growing pads with zero bytes; shrinking
    /// discards the bytes past `pos`.
    pub fn set_write_pos(&mut self, pos: usize) -> bool {
        if pos < HEADER_SIZE {
            return false;
        }
        self.buf.resize(pos, 0);
        if self.read_pos > pos {
            self.read_pos = pos;
        }
        true
    }

    /// Drop the body and rewind both cursors. The header is kept.
    pub fn reset(&mut self) {
        self.buf.truncate(HEADER_SIZE);
        self.read_pos = HEADER_SIZE;
    }

    pub fn can_read(&self) -> bool {
        self.read_pos < self.write_pos()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn callback_id(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[POS_CALLBACK_ID..POS_SEQUENCE])
    }

    pub fn set_callback_id(&mut self, id: u32) {
        LittleEndian::write_u32(
            &mut self.buf[POS_CALLBACK_ID..POS_SEQUENCE],
            id,
        );
    }

    pub fn sequence(&self) -> u64 {
        LittleEndian::read_u64(&self.buf[POS_SEQUENCE..POS_SEQUENCE + 8])
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        LittleEndian::write_u64(
            &mut self.buf[POS_SEQUENCE..POS_SEQUENCE + 8],
            sequence,
        );
    }

    pub fn write_null(&mut self) {
        self.buf.put_u8(TAG_NULL);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(if v { TAG_TRUE } else { TAG_FALSE });
    }

    pub fn write_float64(&mut self, v: f64) -> Result<(), RpcError> {
        if v.is_nan() {
            Err(RpcError::protocol("float64 value is NaN"))
        } else if v == 0.0 {
            self.buf.put_u8(TAG_FLOAT64_ZERO);
            Ok(())
        } else {
            self.buf.put_u8(TAG_FLOAT64);
            self.buf.put_f64_le(v);
            Ok(())
        }
    }

    pub fn write_int64(&mut self, v: Int64) {
        match v.to_i64() {
            Some(n) if n > -8 && n < 33 => {
                self.buf.put_u8((n + INT64_LITERAL_ZERO) as u8);
            }
            Some(n) if n >= -INT16_BIAS && n < INT16_BIAS => {
                self.buf.put_u8(TAG_INT64_2);
                self.buf.put_u16_le((n + INT16_BIAS) as u16);
            }
            Some(n) if n >= -INT32_BIAS && n < INT32_BIAS => {
                self.buf.put_u8(TAG_INT64_4);
                self.buf.put_u32_le((n + INT32_BIAS) as u32);
            }
            _ => {
                self.buf.put_u8(TAG_INT64_8);
                self.buf.put_slice(&v.wire_bytes());
            }
        }
    }

    pub fn write_uint64(&mut self, v: Uint64) {
        match v.to_u64() {
            Some(n) if n < 10 => {
                self.buf.put_u8(TAG_UINT64_LITERAL_MIN + n as u8);
            }
            Some(n) if n < 0x1_0000 => {
                self.buf.put_u8(TAG_UINT64_2);
                self.buf.put_u16_le(n as u16);
            }
            Some(n) if n < 0x1_0000_0000 => {
                self.buf.put_u8(TAG_UINT64_4);
                self.buf.put_u32_le(n as u32);
            }
            _ => {
                self.buf.put_u8(TAG_UINT64_8);
                self.buf.put_slice(&v.wire_bytes());
            }
        }
    }

    pub fn write_string(&mut self, v: &str) -> Result<(), RpcError> {
        let len = v.len();
        if len == 0 {
            self.buf.put_u8(TAG_STRING_EMPTY);
        } else if len <= SHORT_BLOB_MAX {
            self.buf.put_u8(TAG_STRING_EMPTY + len as u8);
            self.buf.put_slice(v.as_bytes());
            self.buf.put_u8(0);
        } else {
            let len = wire_len(len, "string")?;
            self.buf.put_u8(TAG_STRING_LONG);
            self.buf.put_u32_le(len);
            self.buf.put_slice(v.as_bytes());
            self.buf.put_u8(0);
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> Result<(), RpcError> {
        let len = v.len();
        if len == 0 {
            self.buf.put_u8(TAG_BYTES_EMPTY);
        } else if len <= SHORT_BLOB_MAX {
            self.buf.put_u8(TAG_BYTES_EMPTY + len as u8);
            self.buf.put_slice(v);
        } else {
            let len = wire_len(len, "bytes")?;
            self.buf.put_u8(TAG_BYTES_LONG);
            self.buf.put_u32_le(len);
            self.buf.put_slice(v);
        }
        Ok(())
    }

    pub fn write_array(&mut self, v: &[Value]) -> Result<(), RpcError> {
        if v.is_empty() {
            self.buf.put_u8(TAG_ARRAY_EMPTY);
            return Ok(());
        }
        let start = self.write_pos();
        let result = self.write_array_body(v, start);
        if result.is_err() {
            self.buf.truncate(start);
        }
        result
    }

    pub fn write_map(
        &mut self,
        v: &HashMap<String, Value>,
    ) -> Result<(), RpcError> {
        if v.is_empty() {
            self.buf.put_u8(TAG_MAP_EMPTY);
            return Ok(());
        }
        let start = self.write_pos();
        let result = self.write_map_body(v, start);
        if result.is_err() {
            self.buf.truncate(start);
        }
        result
    }

    fn write_array_body(
        &mut self,
        v: &[Value],
        start: usize,
    ) -> Result<(), RpcError> {
        self.begin_container(TAG_ARRAY_EMPTY, v.len())?;
        for item in v {
            self.write_value(item)?;
        }
        self.finish_container(start)
    }

    fn write_map_body(
        &mut self,
        v: &HashMap<String, Value>,
        start: usize,
    ) -> Result<(), RpcError> {
        self.begin_container(TAG_MAP_EMPTY, v.len())?;
        for (key, item) in v {
            self.write_string(key)?;
            self.write_value(item)?;
        }
        self.finish_container(start)
    }

    pub fn write_value(&mut self, v: &Value) -> Result<(), RpcError> {
        match v {
            Value::Null => {
                self.write_null();
                Ok(())
            }
            Value::Bool(b) => {
                self.write_bool(*b);
                Ok(())
            }
            Value::Float64(f) => self.write_float64(*f),
            Value::Int64(i) => {
                self.write_int64(*i);
                Ok(())
            }
            Value::Uint64(u) => {
                self.write_uint64(*u);
                Ok(())
            }
            Value::String(s) => self.write_string(s),
            Value::Bytes(b) => self.write_bytes(b),
            Value::Array(a) => self.write_array(a),
            Value::Map(m) => self.write_map(m),
        }
    }

    /// Write the container tag and reserve room for its total length.
    /// `empty_tag` is the tag of the empty container of this kind.
    fn begin_container(
        &mut self,
        empty_tag: u8,
        count: usize,
    ) -> Result<(), RpcError> {
        if count > SHORT_CONTAINER_MAX {
            let count = wire_len(count, "container")?;
            self.buf.put_u8(empty_tag + 0x1F);
            self.buf.put_u32_le(0);
            self.buf.put_u32_le(count);
        } else {
            self.buf.put_u8(empty_tag + count as u8);
            self.buf.put_u32_le(0);
        }
        Ok(())
    }

    fn finish_container(&mut self, start: usize) -> Result<(), RpcError> {
        let total = wire_len(self.write_pos() - start, "container")?;
        LittleEndian::write_u32(&mut self.buf[start + 1..start + 5], total);
        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.read_pos).copied()
    }

    /// Consume `n` bytes, returning the offset of the first one.
    fn take(&mut self, n: usize) -> Option<usize> {
        let start = self.read_pos;
        let end = start.checked_add(n)?;
        if end <= self.write_pos() {
            self.read_pos = end;
            Some(start)
        } else {
            None
        }
    }

    fn take_u32(&mut self) -> Option<u32> {
        let at = self.take(4)?;
        Some(LittleEndian::read_u32(&self.buf[at..at + 4]))
    }

    fn restoring<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Stream) -> Option<T>,
    {
        let start = self.read_pos;
        let ret = f(self);
        if ret.is_none() {
            self.read_pos = start;
        }
        ret
    }

    pub fn read_null(&mut self) -> Option<()> {
        match self.peek()? {
            TAG_NULL => {
                self.read_pos += 1;
                Some(())
            }
            _ => None,
        }
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        let v = match self.peek()? {
            TAG_TRUE => true,
            TAG_FALSE => false,
            _ => return None,
        };
        self.read_pos += 1;
        Some(v)
    }

    pub fn read_float64(&mut self) -> Option<f64> {
        self.restoring(|s| match s.peek()? {
            TAG_FLOAT64_ZERO => {
                s.read_pos += 1;
                Some(0.0)
            }
            TAG_FLOAT64 => {
                let at = s.take(9)?;
                let v = LittleEndian::read_f64(&s.buf[at + 1..at + 9]);
                if v.is_nan() {
                    None
                } else {
                    Some(v)
                }
            }
            _ => None,
        })
    }

    pub fn read_int64(&mut self) -> Option<Int64> {
        self.restoring(|s| match s.peek()? {
            tag @ TAG_INT64_LITERAL_MIN..=TAG_INT64_LITERAL_MAX => {
                s.read_pos += 1;
                Some(Int64::new(i64::from(tag) - INT64_LITERAL_ZERO))
            }
            TAG_INT64_2 => {
                let at = s.take(3)?;
                let v = i64::from(LittleEndian::read_u16(&s.buf[at + 1..]));
                Some(Int64::new(v - INT16_BIAS))
            }
            TAG_INT64_4 => {
                let at = s.take(5)?;
                let v = i64::from(LittleEndian::read_u32(&s.buf[at + 1..]));
                Some(Int64::new(v - INT32_BIAS))
            }
            TAG_INT64_8 => {
                let at = s.take(9)?;
                Some(Int64::from_wire_bytes(eight_bytes(&s.buf[at + 1..])))
            }
            _ => None,
        })
    }

    pub fn read_uint64(&mut self) -> Option<Uint64> {
        self.restoring(|s| match s.peek()? {
            tag @ TAG_UINT64_LITERAL_MIN..=TAG_UINT64_LITERAL_MAX => {
                s.read_pos += 1;
                Some(Uint64::new(u64::from(tag - TAG_UINT64_LITERAL_MIN)))
            }
            TAG_UINT64_2 => {
                let at = s.take(3)?;
                let v = LittleEndian::read_u16(&s.buf[at + 1..]);
                Some(Uint64::new(u64::from(v)))
            }
            TAG_UINT64_4 => {
                let at = s.take(5)?;
                let v = LittleEndian::read_u32(&s.buf[at + 1..]);
                Some(Uint64::new(u64::from(v)))
            }
            TAG_UINT64_8 => {
                let at = s.take(9)?;
                Some(Uint64::from_wire_bytes(eight_bytes(&s.buf[at + 1..])))
            }
            _ => None,
        })
    }

    pub fn read_string(&mut self) -> Option<String> {
        self.restoring(|s| {
            let len = match s.peek()? {
                TAG_STRING_EMPTY => {
                    s.read_pos += 1;
                    return Some(String::new());
                }
                tag @ 0x81..=0xBE => {
                    s.read_pos += 1;
                    usize::from(tag - TAG_STRING_EMPTY)
                }
                TAG_STRING_LONG => {
                    s.read_pos += 1;
                    let len = s.take_u32()? as usize;
                    if len <= SHORT_BLOB_MAX {
                        return None;
                    }
                    len
                }
                _ => return None,
            };
            let at = s.take(len.checked_add(1)?)?;
            if s.buf[at + len] != 0 {
                return None;
            }
            str::from_utf8(&s.buf[at..at + len])
                .ok()
                .map(|v| v.to_string())
        })
    }

    pub fn read_bytes(&mut self) -> Option<Vec<u8>> {
        self.restoring(|s| {
            let len = match s.peek()? {
                TAG_BYTES_EMPTY => {
                    s.read_pos += 1;
                    return Some(Vec::new());
                }
                tag @ 0xC1..=0xFE => {
                    s.read_pos += 1;
                    usize::from(tag - TAG_BYTES_EMPTY)
                }
                TAG_BYTES_LONG => {
                    s.read_pos += 1;
                    let len = s.take_u32()? as usize;
                    if len <= SHORT_BLOB_MAX {
                        return None;
                    }
                    len
                }
                _ => return None,
            };
            let at = s.take(len)?;
            Some(s.buf[at..at + len].to_vec())
        })
    }

    pub fn read_array(&mut self) -> Option<Vec<Value>> {
        self.read_array_at(0)
    }

    pub fn read_map(&mut self) -> Option<HashMap<String, Value>> {
        self.read_map_at(0)
    }

    pub fn read_value(&mut self) -> Option<Value> {
        self.read_value_at(0)
    }

    fn read_value_at(&mut self, depth: usize) -> Option<Value> {
        match self.peek()? {
            TAG_NULL => self.read_null().map(|_| Value::Null),
            TAG_TRUE | TAG_FALSE => self.read_bool().map(Value::Bool),
            TAG_FLOAT64_ZERO | TAG_FLOAT64 => {
                self.read_float64().map(Value::Float64)
            }
            TAG_INT64_2..=TAG_INT64_8
            | TAG_INT64_LITERAL_MIN..=TAG_INT64_LITERAL_MAX => {
                self.read_int64().map(Value::Int64)
            }
            TAG_UINT64_2..=TAG_UINT64_8
            | TAG_UINT64_LITERAL_MIN..=TAG_UINT64_LITERAL_MAX => {
                self.read_uint64().map(Value::Uint64)
            }
            TAG_ARRAY_EMPTY..=TAG_ARRAY_LONG => {
                self.read_array_at(depth).map(Value::Array)
            }
            TAG_MAP_EMPTY..=TAG_MAP_LONG => {
                self.read_map_at(depth).map(Value::Map)
            }
            TAG_STRING_EMPTY..=TAG_STRING_LONG => {
                self.read_string().map(Value::String)
            }
            TAG_BYTES_EMPTY..=TAG_BYTES_LONG => {
                self.read_bytes().map(Value::Bytes)
            }
            _ => None,
        }
    }

    /// Read a container header. Returns the element count and the offset
    /// at which the container must end.
    fn read_container_header(
        &mut self,
        empty_tag: u8,
    ) -> Option<(usize, usize)> {
        let start = self.read_pos;
        let tag = self.peek()?;
        if tag < empty_tag || tag > empty_tag + 0x1F {
            return None;
        }
        self.read_pos += 1;
        if tag == empty_tag {
            return Some((0, start + 1));
        }
        let total = self.take_u32()? as usize;
        let count = if tag == empty_tag + 0x1F {
            self.take_u32()? as usize
        } else {
            usize::from(tag - empty_tag)
        };
        if count == 0 || total <= 4 {
            return None;
        }
        Some((count, start.checked_add(total)?))
    }

    fn read_array_at(&mut self, depth: usize) -> Option<Vec<Value>> {
        if depth >= MAX_READ_DEPTH {
            return None;
        }
        self.restoring(|s| {
            let (count, end) = s.read_container_header(TAG_ARRAY_EMPTY)?;
            if end > s.write_pos() {
                return None;
            }
            let mut ret = Vec::with_capacity(count.min(SHORT_CONTAINER_MAX));
            for _ in 0..count {
                ret.push(s.read_value_at(depth + 1)?);
            }
            if s.read_pos == end {
                Some(ret)
            } else {
                None
            }
        })
    }

    fn read_map_at(
        &mut self,
        depth: usize,
    ) -> Option<HashMap<String, Value>> {
        if depth >= MAX_READ_DEPTH {
            return None;
        }
        self.restoring(|s| {
            let (count, end) = s.read_container_header(TAG_MAP_EMPTY)?;
            if end > s.write_pos() {
                return None;
            }
            let mut ret =
                HashMap::with_capacity(count.min(SHORT_CONTAINER_MAX));
            for _ in 0..count {
                let key = s.read_string()?;
                let value = s.read_value_at(depth + 1)?;
                if ret.insert(key, value).is_some() {
                    return None;
                }
            }
            if s.read_pos == end {
                Some(ret)
            } else {
                None
            }
        })
    }
}

fn wire_len(len: usize, what: &str) -> Result<u32, RpcError> {
    if len > u32::max_value() as usize {
        Err(RpcError::protocol(format!("{} is too large to encode", what)))
    } else {
        Ok(len as u32)
    }
}

fn eight_bytes(src: &[u8]) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[..8]);
    bytes
}
