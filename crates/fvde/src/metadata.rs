// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Plaintext metadata
//!
//! A physical volume carries four redundant plaintext metadata regions.
//! Block 0 of each region is a type 0x0011 volume-group directory that
//! locates the two encrypted metadata regions and lists the physical
//! volumes of the group. The region whose block 0 carries the largest
//! transaction identifier is the committed one.

use std::io::{Read, Seek, SeekFrom};

use uuid::Uuid;

use crate::bytes::{le_u32, le_u64, uuid_bytes};
use crate::metadata_block::{self, MetadataBlock};
use crate::Error;

/// A physical volume as listed in the volume-group roster
#[derive(Debug, Clone)]
pub struct PhysicalVolumeDescriptor {
    /// Physical volume UUID (big-endian on disk)
    pub identifier: [u8; 16],
    /// Size of the physical volume in bytes
    pub size: u64,
}

impl PhysicalVolumeDescriptor {
    pub fn identifier_string(&self) -> String {
        Uuid::from_bytes(self.identifier).hyphenated().to_string()
    }
}

/// Parsed contents of a type 0x0011 volume-group directory block
#[derive(Debug, Clone, Default)]
pub(crate) struct VolumeGroupDirectory {
    pub metadata_size: u32,
    pub volume_group_number_of_blocks: u64,
    pub physical_volume_index: u32,
    pub bytes_per_sector: u32,
    pub block_size: u32,
    pub serial_number: u32,
    pub encrypted_metadata_size: u64,
    pub encrypted_metadata1_volume_index: u32,
    pub encrypted_metadata2_volume_index: u32,
    pub encrypted_metadata1_block_number: u64,
    pub encrypted_metadata2_block_number: u64,
    pub physical_volumes: Vec<PhysicalVolumeDescriptor>,
}

impl VolumeGroupDirectory {
    /// Decodes a 0x0011 payload (the bytes after the 64-byte block header).
    pub(crate) fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 192 {
            return Err(Error::OutOfBounds("volume group directory payload"));
        }
        let bounds = || Error::OutOfBounds("volume group directory payload");

        let mut directory = VolumeGroupDirectory {
            metadata_size: le_u32(data, 0).ok_or(bounds())?,
            volume_group_number_of_blocks: le_u64(data, 32).ok_or(bounds())?,
            physical_volume_index: le_u32(data, 40).ok_or(bounds())?,
            bytes_per_sector: le_u32(data, 44).ok_or(bounds())?,
            block_size: le_u32(data, 48).ok_or(bounds())?,
            serial_number: le_u32(data, 52).ok_or(bounds())?,
            encrypted_metadata_size: le_u64(data, 56).ok_or(bounds())?,
            encrypted_metadata1_volume_index: le_u32(data, 72).ok_or(bounds())?,
            encrypted_metadata2_volume_index: le_u32(data, 76).ok_or(bounds())?,
            encrypted_metadata1_block_number: le_u64(data, 80).ok_or(bounds())?,
            encrypted_metadata2_block_number: le_u64(data, 88).ok_or(bounds())?,
            physical_volumes: Vec::new(),
        };

        log::trace!(
            "volume group directory: region {} bytes, serial 0x{:08x}",
            directory.metadata_size,
            directory.serial_number
        );
        if directory.block_size as usize != metadata_block::BLOCK_SIZE {
            return Err(Error::UnsupportedValue("metadata block size"));
        }
        if directory.bytes_per_sector == 0 {
            return Err(Error::InvalidValue("bytes per sector"));
        }
        if directory.encrypted_metadata_size == 0
            || directory.encrypted_metadata_size % u64::from(directory.block_size) != 0
        {
            return Err(Error::InvalidValue("encrypted metadata size"));
        }

        // Directory entries: (object identifier, metadata block number,
        // reserved), consumed here only to advance past the table.
        let number_of_entries = le_u32(data, 184).ok_or(bounds())? as usize;
        let mut offset = 192usize;
        if number_of_entries > (data.len() - offset) / 24 {
            return Err(Error::OutOfBounds("volume group directory entries"));
        }
        for _ in 0..number_of_entries {
            let object_identifier = le_u64(data, offset).ok_or(bounds())?;
            let block_number = le_u64(data, offset + 8).ok_or(bounds())?;
            log::trace!(
                "directory entry: object 0x{object_identifier:016x} block {block_number}"
            );
            offset += 24;
        }

        // Physical volume roster follows the directory table; a payload
        // that ends with the table simply has no roster.
        if let Some(number_of_volumes) = le_u32(data, offset) {
            let number_of_volumes = number_of_volumes as usize;
            offset += 8;
            if number_of_volumes > data.len().saturating_sub(offset) / 24 {
                return Err(Error::OutOfBounds("physical volume roster"));
            }
            for _ in 0..number_of_volumes {
                let identifier = uuid_bytes(data, offset).ok_or(bounds())?;
                let size = le_u64(data, offset + 16).ok_or(bounds())?;
                directory.physical_volumes.push(PhysicalVolumeDescriptor { identifier, size });
                offset += 24;
            }
        }

        Ok(directory)
    }
}

/// The committed plaintext metadata of a physical volume
#[derive(Debug, Clone)]
pub struct Metadata {
    pub(crate) transaction_identifier: u64,
    pub(crate) serial_number: u32,
    pub(crate) bytes_per_sector: u32,
    pub(crate) block_size: u32,
    pub(crate) encrypted_metadata_size: u64,
    pub(crate) encrypted_metadata1_volume_index: u32,
    pub(crate) encrypted_metadata2_volume_index: u32,
    pub(crate) encrypted_metadata1_offset: u64,
    pub(crate) encrypted_metadata2_offset: u64,
    pub(crate) physical_volumes: Vec<PhysicalVolumeDescriptor>,
}

impl Metadata {
    /// Reads the four candidate regions and keeps the freshest one.
    ///
    /// Regions that fail to read, frame or decode are skipped; only when no
    /// candidate survives is the volume considered unusable.
    pub fn read_from<R: Read + Seek>(reader: &mut R, offsets: &[u64; 4]) -> Result<Self, Error> {
        let mut committed: Option<Metadata> = None;

        for (region_index, &offset) in offsets.iter().enumerate() {
            match Self::read_region(reader, offset) {
                Ok(candidate) => {
                    log::debug!(
                        "metadata region {region_index} at offset {offset}: transaction {}",
                        candidate.transaction_identifier
                    );
                    let fresher = committed
                        .as_ref()
                        .is_none_or(|current| {
                            candidate.transaction_identifier > current.transaction_identifier
                        });
                    if fresher {
                        committed = Some(candidate);
                    }
                }
                Err(error) => {
                    log::warn!("metadata region {region_index} at offset {offset} unusable: {error}");
                }
            }
        }

        committed.ok_or(Error::InvalidValue("no usable plaintext metadata region"))
    }

    fn read_region<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<Self, Error> {
        let mut block = vec![0u8; metadata_block::BLOCK_SIZE];
        reader.seek(SeekFrom::Start(offset))?;
        reader.read_exact(&mut block)?;

        let framed = MetadataBlock::parse(&block)?;
        if framed.block_type != 0x0011 {
            return Err(Error::InvalidValue("plaintext metadata block 0 type"));
        }
        let directory = VolumeGroupDirectory::parse(framed.data)?;

        let block_size = u64::from(directory.block_size);
        Ok(Metadata {
            transaction_identifier: framed.transaction_identifier,
            serial_number: directory.serial_number,
            bytes_per_sector: directory.bytes_per_sector,
            block_size: directory.block_size,
            encrypted_metadata_size: directory.encrypted_metadata_size,
            encrypted_metadata1_volume_index: directory.encrypted_metadata1_volume_index,
            encrypted_metadata2_volume_index: directory.encrypted_metadata2_volume_index,
            encrypted_metadata1_offset: directory.encrypted_metadata1_block_number * block_size,
            encrypted_metadata2_offset: directory.encrypted_metadata2_block_number * block_size,
            physical_volumes: directory.physical_volumes,
        })
    }

    pub fn transaction_identifier(&self) -> u64 {
        self.transaction_identifier
    }

    pub fn serial_number(&self) -> u32 {
        self.serial_number
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    pub fn encrypted_metadata_size(&self) -> u64 {
        self.encrypted_metadata_size
    }

    /// Physical volumes of the owning volume group
    pub fn physical_volumes(&self) -> &[PhysicalVolumeDescriptor] {
        &self.physical_volumes
    }
}
