// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Core Storage physical volume header
//!
//! The first 512 bytes of a physical volume carry the `"CS"` signature, the
//! XTS key material for the encrypted metadata region and the block numbers
//! of the four redundant plaintext metadata regions.

use std::io::Read;

use uuid::Uuid;
use zerocopy::*;

use crate::checksum::{self, ChecksumAlgorithm};
use crate::Error;

/// Size of the on-disk volume header in bytes
pub const VOLUME_HEADER_SIZE: usize = 512;

/// Offset of the `"CS"` signature within the header
pub const SIGNATURE_OFFSET: usize = 88;

const SIGNATURE: [u8; 2] = *b"CS";

/// AES-128-XTS, the only encryption method Core Storage ships
const ENCRYPTION_METHOD_AES_128_XTS: u32 = 2;

/// Physical volume header as stored on disk
#[derive(FromBytes, IntoBytes, Immutable, Unaligned, Debug)]
#[repr(C, packed)]
pub struct VolumeHeader {
    checksum: U32<LittleEndian>,
    initial_value: U32<LittleEndian>,
    version: U16<LittleEndian>,
    block_type: U16<LittleEndian>,
    serial_number: U32<LittleEndian>,
    reserved1: [u8; 32],
    bytes_per_sector: U32<LittleEndian>,
    reserved2: [u8; 12],
    physical_volume_size: U64<LittleEndian>,
    reserved3: [u8; 16],
    signature: [u8; 2],
    checksum_algorithm: U32<LittleEndian>,
    reserved4: [u8; 2],
    metadata_block_size: U32<LittleEndian>,
    metadata_size: U32<LittleEndian>,
    metadata_block_numbers: [U64<LittleEndian>; 4],
    reserved5: [u8; 32],
    key_data_size: U32<LittleEndian>,
    encryption_method: U32<LittleEndian>,
    key_data: [u8; 128],
    physical_volume_identifier: [u8; 16],
    volume_group_identifier: [u8; 16],
    reserved6: [u8; 176],
}

/// Attempt to decode the volume header from the given read stream
pub fn from_reader<R: Read>(reader: &mut R) -> Result<VolumeHeader, Error> {
    let header = VolumeHeader::read_from_io(reader)?;
    header.validate()?;
    Ok(header)
}

impl VolumeHeader {
    /// Decode and validate a volume header from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let header =
            VolumeHeader::read_from_bytes(bytes.get(..VOLUME_HEADER_SIZE).ok_or(
                Error::InvalidArgument("volume header requires 512 bytes"),
            )?)
            .map_err(|_| Error::InvalidArgument("volume header requires 512 bytes"))?;
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.signature != SIGNATURE {
            return Err(Error::InvalidSignature);
        }
        if self.version.get() != 1 {
            return Err(Error::UnsupportedVersion("volume header version"));
        }
        ChecksumAlgorithm::try_from(self.checksum_algorithm.get())?;

        let stored = self.checksum.get();
        let computed = checksum::fletcher(&self.as_bytes()[8..], self.initial_value.get());
        if stored != computed {
            return Err(Error::ChecksumMismatch { stored, computed });
        }

        if self.bytes_per_sector.get() == 0 {
            return Err(Error::InvalidValue("bytes per sector"));
        }
        if self.metadata_block_size.get() == 0 || self.metadata_size.get() == 0 {
            return Err(Error::InvalidValue("metadata region geometry"));
        }
        if self.encryption_method.get() != ENCRYPTION_METHOD_AES_128_XTS {
            return Err(Error::UnsupportedValue("physical volume encryption method"));
        }
        let key_data_size = self.key_data_size.get() as usize;
        if key_data_size == 0 || key_data_size > self.key_data.len() {
            return Err(Error::InvalidValue("key data size"));
        }

        log::trace!(
            "valid core storage header: PV={} LVG={} size={} bytes",
            self.physical_volume_identifier_string(),
            self.volume_group_identifier_string(),
            self.physical_volume_size.get(),
        );
        Ok(())
    }

    pub fn serial_number(&self) -> u32 {
        self.serial_number.get()
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector.get()
    }

    /// Total size of the physical volume in bytes
    pub fn physical_volume_size(&self) -> u64 {
        self.physical_volume_size.get()
    }

    /// Size of each plaintext metadata region in bytes
    pub fn metadata_size(&self) -> u32 {
        self.metadata_size.get()
    }

    /// Unit size the metadata block numbers are expressed in
    pub fn metadata_block_size(&self) -> u32 {
        self.metadata_block_size.get()
    }

    /// Byte offsets of the four redundant plaintext metadata regions
    pub fn metadata_offsets(&self) -> [u64; 4] {
        let block_size = u64::from(self.metadata_block_size.get());
        self.metadata_block_numbers
            .map(|number| number.get() * block_size)
    }

    /// XTS key material protecting the encrypted metadata region
    pub fn key_data(&self) -> &[u8; 128] {
        &self.key_data
    }

    /// The 128-bit data/tweak key halves for the encrypted metadata region
    pub(crate) fn metadata_key_pair(&self) -> ([u8; 16], [u8; 16]) {
        let mut data_key = [0u8; 16];
        let mut tweak_key = [0u8; 16];
        data_key.copy_from_slice(&self.key_data[..16]);
        tweak_key.copy_from_slice(&self.key_data[16..32]);
        (data_key, tweak_key)
    }

    pub fn physical_volume_identifier(&self) -> &[u8; 16] {
        &self.physical_volume_identifier
    }

    pub fn volume_group_identifier(&self) -> &[u8; 16] {
        &self.volume_group_identifier
    }

    pub fn physical_volume_identifier_string(&self) -> String {
        Uuid::from_bytes(self.physical_volume_identifier)
            .hyphenated()
            .to_string()
    }

    pub fn volume_group_identifier_string(&self) -> String {
        Uuid::from_bytes(self.volume_group_identifier)
            .hyphenated()
            .to_string()
    }
}
