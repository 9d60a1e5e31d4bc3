// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Offset-based integer readers for the variable-layout metadata payloads.
//!
//! Fixed-layout structures use `zerocopy` directly; the block-type handlers
//! deal in counted tables at computed offsets, where an `Option`-returning
//! accessor keeps every bound explicit at the call site.

pub(crate) fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn le_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn le_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    let mut value = [0u8; 8];
    value.copy_from_slice(bytes);
    Some(u64::from_le_bytes(value))
}

pub(crate) fn le_i64(data: &[u8], offset: usize) -> Option<i64> {
    le_u64(data, offset).map(|value| value as i64)
}

/// 16-byte big-endian identifier (UUIDs are stored big-endian on disk).
pub(crate) fn uuid_bytes(data: &[u8], offset: usize) -> Option<[u8; 16]> {
    let bytes = data.get(offset..offset.checked_add(16)?)?;
    let mut value = [0u8; 16];
    value.copy_from_slice(bytes);
    Some(value)
}
