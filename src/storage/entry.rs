//! # Entry Encoding
//!
//! Byte-exact encode/decode of a single dictionary entry. An entry is the
//! atomic on-disk record: a length-prefixed key, zero padding up to the next
//! 8-byte boundary, then the `f64` value. The padding arithmetic guarantees
//! the value always occupies a whole, aligned 8-byte slot, which is what
//! makes in-place overwrites single aligned stores.

use std::mem::size_of;

use eyre::{ensure, Result};

use crate::error::StoreError;

/// One decoded entry borrowed from a byte slice, exclusive of the length
/// prefix handling done by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry<'a> {
    bytes: &'a [u8],
    key_len: usize,
}

impl<'a> RawEntry<'a> {
    /// Decode the entry starting at the head of `bytes`. The slice may
    /// extend past the entry; only `total_len` bytes belong to it.
    pub fn from_slice(bytes: &'a [u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= size_of::<u32>(),
            StoreError::out_of_bounds(size_of::<u32>(), bytes.len())
        );

        // CAST: no-op on 32-bit, widening on 64-bit.
        let key_len = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte slice")) as usize;
        let total = Self::total_len(key_len)?;

        ensure!(
            total <= bytes.len(),
            StoreError::out_of_bounds(total, bytes.len())
        );

        Ok(Self {
            bytes: &bytes[size_of::<u32>()..total],
            key_len,
        })
    }

    /// Encode `key` and `value` into the head of `buf`, returning the offset
    /// of the value slot relative to `buf`. `buf` must hold `total_len`
    /// bytes and start on an 8-byte boundary of the file.
    pub fn write(buf: &mut [u8], key: &[u8], value: f64) -> Result<usize> {
        let total = Self::total_len(key.len())?;
        ensure!(
            total <= buf.len(),
            StoreError::out_of_bounds(total, buf.len())
        );

        // CAST: total_len validated the key length fits in an i32.
        buf[..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
        buf[4..4 + key.len()].copy_from_slice(key);

        let value_offset = Self::value_offset(key.len())?;
        buf[4 + key.len()..value_offset].fill(0);
        buf[value_offset..total].copy_from_slice(&value.to_le_bytes());

        Ok(value_offset)
    }

    /// The key bytes, without length prefix or padding.
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        &self.bytes[..self.key_len]
    }

    /// The value stored in the final 8 bytes of the entry.
    #[inline]
    pub fn value(&self) -> f64 {
        let offset = self.key_len + Self::padding_len(self.key_len);
        // UNWRAP: from_slice confirmed the slice covers the value slot.
        f64::from_le_bytes(self.bytes[offset..offset + 8].try_into().unwrap())
    }

    /// Total bytes this entry occupies on disk.
    #[inline]
    pub fn entry_len(&self) -> usize {
        // UNWRAP: validated in from_slice.
        Self::total_len(self.key_len).unwrap()
    }

    /// Padding between key and value: 1..=8 zero bytes bringing the length
    /// prefix plus key up to an 8-byte boundary. Always at least one byte,
    /// so the value never shares a slot with the key tail.
    #[inline]
    pub fn padding_len(key_len: usize) -> usize {
        8 - (size_of::<u32>() + key_len) % 8
    }

    /// Offset of the value slot from the entry start: prefix + key + pad.
    #[inline]
    pub fn value_offset(key_len: usize) -> Result<usize> {
        Self::check_key_len(key_len)?;
        Ok(size_of::<u32>() + key_len + Self::padding_len(key_len))
    }

    /// Total on-disk length of an entry with the given key length.
    #[inline]
    pub fn total_len(key_len: usize) -> Result<usize> {
        Ok(Self::value_offset(key_len)? + size_of::<f64>())
    }

    #[inline]
    fn check_key_len(key_len: usize) -> Result<()> {
        ensure!(
            key_len as u64 <= i32::MAX as u64,
            StoreError::KeyLength { len: key_len }
        );
        Ok(())
    }
}
