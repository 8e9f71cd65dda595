// Copyright 2026 the Stack Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Big-endian immediate reading for the instruction stream.

use core::fmt;

/// A decode error for instruction immediates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended unexpectedly.
    UnexpectedEof,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
        }
    }
}

impl core::error::Error for DecodeError {}

/// A simple byte reader with bounds checks.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Creates a reader over `bytes` positioned at `offset`.
    #[must_use]
    pub fn at(bytes: &'a [u8], offset: usize) -> Self {
        Self { bytes, offset }
    }

    /// Returns the current byte offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns `true` if no bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    /// Reads a `u8`.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .bytes
            .get(self.offset)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.offset += 1;
        Ok(b)
    }

    /// Reads an `i8`.
    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_be_bytes([self.read_u8()?]))
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Reads a big-endian `i16`.
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(i16::from_be_bytes([hi, lo]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian() {
        let mut r = Reader::new(&[0xFF, 0x12, 0x34, 0xFF, 0xFE]);
        assert_eq!(r.read_i8(), Ok(-1));
        assert_eq!(r.read_u16(), Ok(0x1234));
        assert_eq!(r.read_i16(), Ok(-2));
        assert!(r.is_empty());
        assert_eq!(r.read_u8(), Err(DecodeError::UnexpectedEof));
    }
}
