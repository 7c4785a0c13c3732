//! Consensus serialization primitives shared by transactions, blocks and
//! wire messages.

use thiserror::Error;

use crate::hash::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("trailing bytes after decode")]
    TrailingBytes,
    #[error("varint value out of range")]
    Overflow,
    #[error("invalid field value")]
    InvalidValue,
}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        match value {
            0..=0xFC => self.write_u8(value as u8),
            0xFD..=0xFFFF => {
                self.write_u8(0xFD);
                self.write_u16_le(value as u16);
            }
            0x1_0000..=0xFFFF_FFFF => {
                self.write_u8(0xFE);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xFF);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let tag = self.read_u8()?;
        let value = match tag {
            0xFD => u64::from(self.read_u16_le()?),
            0xFE => u64::from(self.read_u32_le()?),
            0xFF => self.read_u64_le()?,
            byte => u64::from(byte),
        };
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::Overflow)?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidValue)
    }

    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries_round_trip() {
        for value in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            let bytes = encoder.into_inner();
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_varint().expect("varint"), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn short_input_is_eof() {
        let mut decoder = Decoder::new(&[0xFD, 0x01]);
        assert_eq!(decoder.read_varint(), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn var_str_rejects_invalid_utf8() {
        let mut encoder = Encoder::new();
        encoder.write_var_bytes(&[0xFF, 0xFE]);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_var_str(), Err(DecodeError::InvalidValue));
    }
}
