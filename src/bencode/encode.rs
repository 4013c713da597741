use super::value::Value;
use bytes::{BufMut, BytesMut};

/// Encodes a value in canonical form.
///
/// Dictionary keys come out sorted by raw bytes because [`Value::Dict`] is a
/// `BTreeMap` keyed by [`bytes::Bytes`], so insertion order never leaks into
/// the encoding.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_value(&mut buf, value);
    buf.to_vec()
}

fn put_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => put_bytes(buf, b),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                put_value(buf, item);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            for (key, val) in dict {
                put_bytes(buf, key);
                put_value(buf, val);
            }
            buf.put_u8(b'e');
        }
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}
