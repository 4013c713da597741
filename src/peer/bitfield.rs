use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("bitfield is {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },

    #[error("bitfield has bits set past the last piece")]
    SparePadding,
}

/// Packed set of piece indices.
///
/// Bits are numbered from the high bit of the first byte, the same layout the
/// wire `bitfield` message uses. Spare bits in the last byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn full(len: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; len.div_ceil(8)],
            len,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Parses the payload of a `bitfield` message.
    ///
    /// The payload must be exactly `ceil(len / 8)` bytes with zeroed padding.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self, BitfieldError> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitfieldError::WrongLength {
                expected,
                actual: bytes.len(),
            });
        }
        let bf = Self {
            bits: bytes.to_vec(),
            len,
        };
        if bf.spare_mask() & bf.bits.last().copied().unwrap_or(0) != 0 {
            return Err(BitfieldError::SparePadding);
        }
        Ok(bf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Sets bit `index`; out of range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(0x80 >> (index % 8));
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices of all set bits, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.has(i))
    }

    fn spare_mask(&self) -> u8 {
        match self.len % 8 {
            0 => 0,
            used => 0xFF >> used,
        }
    }

    fn clear_spare_bits(&mut self) {
        let mask = self.spare_mask();
        if let Some(last) = self.bits.last_mut() {
            *last &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order() {
        let mut bf = Bitfield::new(10);
        bf.set(0);
        bf.set(9);
        assert_eq!(bf.as_bytes(), &[0x80, 0x40]);
        assert!(bf.has(0));
        assert!(bf.has(9));
        assert!(!bf.has(10));
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_full_clears_padding() {
        let bf = Bitfield::full(10);
        assert_eq!(bf.as_bytes(), &[0xFF, 0xC0]);
        assert!(bf.is_complete());
    }

    #[test]
    fn test_from_bytes_is_strict() {
        assert_eq!(
            Bitfield::from_bytes(&[0xFF], 10),
            Err(BitfieldError::WrongLength {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            Bitfield::from_bytes(&[0xFF, 0xE0], 10),
            Err(BitfieldError::SparePadding)
        );
        let bf = Bitfield::from_bytes(&[0x01, 0x40], 10).unwrap();
        assert_eq!(bf.iter_set().collect::<Vec<_>>(), vec![7, 9]);
    }

    #[test]
    fn test_clear_and_is_empty() {
        let mut bf = Bitfield::new(3);
        assert!(bf.is_empty());
        bf.set(2);
        assert!(!bf.is_empty());
        bf.clear(2);
        assert!(bf.is_empty());
        bf.set(7);
        assert_eq!(bf.count(), 0);
    }
}
