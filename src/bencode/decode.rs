use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 64;

/// Decodes exactly one value spanning the whole input.
///
/// Fails with [`BencodeError::TrailingData`] if bytes remain after the value.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes one value from the start of `data` and returns it together with
/// the number of bytes it occupied.
///
/// Used where the raw encoding of a nested value matters, such as hashing
/// the `info` dictionary of a torrent.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    /// Returns the bytes up to (not including) `delim` and steps past it.
    fn take_until(&mut self, delim: u8) -> Result<&'a [u8], BencodeError> {
        let rest: &'a [u8] = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == delim)
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => {
                self.pos += 1;
                self.integer().map(Value::Integer)
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = match self.peek()? {
                        b'0'..=b'9' => self.byte_string()?,
                        c => return Err(BencodeError::UnexpectedChar(c as char)),
                    };
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    fn integer(&mut self) -> Result<i64, BencodeError> {
        let digits = self.take_until(b'e')?;
        let text = std::str::from_utf8(digits)
            .map_err(|_| BencodeError::InvalidInteger("not ascii".into()))?;

        let unsigned = text.strip_prefix('-').unwrap_or(text);
        if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BencodeError::InvalidInteger(text.into()));
        }
        if text == "-0" || (unsigned.len() > 1 && unsigned.starts_with('0')) {
            return Err(BencodeError::InvalidInteger(format!("non-canonical {text}")));
        }

        text.parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let digits = self.take_until(b':')?;
        if digits.is_empty()
            || (digits.len() > 1 && digits[0] == b'0')
            || !digits.iter().all(u8::is_ascii_digit)
        {
            return Err(BencodeError::InvalidStringLength);
        }

        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }
}
