// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Metadata block framing
//!
//! Every metadata block, plaintext or freshly XTS-decrypted, starts with
//! the same 64-byte header: a seeded checksum, a format version, a type code
//! and the transaction/object identifiers that link the block into the
//! volume-group object graph.

use zerocopy::*;

use crate::checksum;
use crate::Error;

/// Uniform size of a metadata block in bytes
pub const BLOCK_SIZE: usize = 8192;

/// Size of the shared block header in bytes
pub const HEADER_SIZE: usize = 64;

/// Blocks wiped by the logical volume family manager carry this marker in
/// place of a valid checksum.
const LVF_WIPED: [u8; 8] = *b"LVFwiped";

#[derive(FromBytes, IntoBytes, Immutable, Unaligned, Debug)]
#[repr(C, packed)]
struct MetadataBlockHeader {
    checksum: U32<LittleEndian>,
    initial_value: U32<LittleEndian>,
    version: U16<LittleEndian>,
    block_type: U16<LittleEndian>,
    serial_number: U32<LittleEndian>,
    transaction_identifier: U64<LittleEndian>,
    object_identifier: U64<LittleEndian>,
    block_number: U64<LittleEndian>,
    unknown1: U64<LittleEndian>,
    block_size: U32<LittleEndian>,
    unknown2: U32<LittleEndian>,
    unknown3: U64<LittleEndian>,
}

/// A framed metadata block borrowing its payload from the caller's buffer
#[derive(Debug)]
pub struct MetadataBlock<'a> {
    pub block_type: u16,
    pub serial_number: u32,
    pub transaction_identifier: u64,
    pub object_identifier: u64,
    pub block_number: u64,
    /// Wiped blocks frame successfully but their payload is never dispatched
    pub is_lvf_wiped: bool,
    /// Payload bytes, beginning right after the 64-byte header
    pub data: &'a [u8],
}

/// True when the block is the all-zero region terminator.
pub fn is_empty_block(data: &[u8]) -> bool {
    data.iter().all(|&byte| byte == 0)
}

impl<'a> MetadataBlock<'a> {
    /// Frames `data`, verifying the header version and the seeded checksum.
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidArgument("metadata block shorter than its header"));
        }
        let is_lvf_wiped = data[..8] == LVF_WIPED;

        let header = MetadataBlockHeader::read_from_bytes(&data[..HEADER_SIZE])
            .map_err(|_| Error::InvalidArgument("metadata block shorter than its header"))?;

        if header.version.get() != 1 {
            return Err(Error::UnsupportedVersion("metadata block version"));
        }
        let block_size = header.block_size.get() as usize;
        if block_size < HEADER_SIZE || block_size > data.len() {
            return Err(Error::OutOfBounds("metadata block size"));
        }

        if !is_lvf_wiped {
            let stored = header.checksum.get();
            let computed =
                checksum::fletcher(&data[8..block_size], header.initial_value.get());
            if stored != computed {
                return Err(Error::ChecksumMismatch { stored, computed });
            }
        }

        log::trace!(
            "metadata block type 0x{:04x} transaction {} object 0x{:016x}{}",
            header.block_type.get(),
            header.transaction_identifier.get(),
            header.object_identifier.get(),
            if is_lvf_wiped { " (wiped)" } else { "" },
        );

        Ok(MetadataBlock {
            block_type: header.block_type.get(),
            serial_number: header.serial_number.get(),
            transaction_identifier: header.transaction_identifier.get(),
            object_identifier: header.object_identifier.get(),
            block_number: header.block_number.get(),
            is_lvf_wiped,
            data: &data[HEADER_SIZE..block_size],
        })
    }
}

/// Serializes a block header and seals the checksum; fixture-building aid.
#[cfg(test)]
pub(crate) fn seal_block(
    block: &mut [u8],
    block_type: u16,
    transaction_identifier: u64,
    object_identifier: u64,
    block_number: u64,
) {
    let initial_value = 0xffff_ffffu32;
    block[4..8].copy_from_slice(&initial_value.to_le_bytes());
    block[8..10].copy_from_slice(&1u16.to_le_bytes());
    block[10..12].copy_from_slice(&block_type.to_le_bytes());
    block[12..16].copy_from_slice(&0x1000_0001u32.to_le_bytes());
    block[16..24].copy_from_slice(&transaction_identifier.to_le_bytes());
    block[24..32].copy_from_slice(&object_identifier.to_le_bytes());
    block[32..40].copy_from_slice(&block_number.to_le_bytes());
    let block_size = block.len() as u32;
    block[48..52].copy_from_slice(&block_size.to_le_bytes());
    let value = checksum::fletcher(&block[8..], initial_value);
    block[..4].copy_from_slice(&value.to_le_bytes());
}
