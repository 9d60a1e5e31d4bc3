// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Encrypted metadata
//!
//! The second metadata region of a physical volume is AES-128-XTS encrypted
//! with the block index as the tweak. Its decrypted blocks describe the
//! volume-group object graph: logical-volume descriptors, their segment
//! maps, and a DEFLATE-compressed copy of the encryption context plist
//! spread over a chain of continuation blocks.
//!
//! A single [`EncryptedMetadata`] accumulates the decoded state across all
//! block-type handlers of one region. Handler failures are fatal for the
//! region; the caller may fall back to the secondary copy.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use uuid::Uuid;

use crate::bytes::{le_i64, le_u16, le_u32, le_u64, uuid_bytes};
use crate::crypto::{self, XtsContext};
use crate::encryption_context::from_dict_fragment;
use crate::metadata::VolumeGroupDirectory;
use crate::metadata_block::{self, MetadataBlock};
use crate::segment::{SegmentDescriptor, SegmentList};
use crate::Error;

/// A logical volume as assembled from the encrypted metadata
#[derive(Debug, Clone, Default)]
pub struct LogicalVolumeDescriptor {
    pub(crate) object_identifier: u64,
    pub(crate) object_identifier_0x0305: u64,
    pub(crate) object_identifier_0x0505: u64,
    pub(crate) identifier: [u8; 16],
    pub(crate) family_identifier: [u8; 16],
    pub(crate) name: Option<String>,
    pub(crate) size: u64,
    pub(crate) base_physical_block_number: u64,
    pub(crate) segment_descriptors: SegmentList,
}

impl LogicalVolumeDescriptor {
    pub fn object_identifier(&self) -> u64 {
        self.object_identifier
    }

    /// Logical volume UUID
    pub fn identifier(&self) -> &[u8; 16] {
        &self.identifier
    }

    pub fn identifier_string(&self) -> String {
        Uuid::from_bytes(self.identifier).hyphenated().to_string()
    }

    /// Logical volume family UUID, bound into the XTS tweak key
    pub fn family_identifier(&self) -> &[u8; 16] {
        &self.family_identifier
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Size of the logical volume in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segment_descriptors.iter()
    }

    pub(crate) fn base_physical_block_number(&self) -> u64 {
        self.base_physical_block_number
    }
}

/// Inline XML properties carried by a type 0x001a block
#[derive(Debug, Deserialize)]
struct LogicalVolumeProperties {
    #[serde(rename = "com.apple.corestorage.lv.familyUUID")]
    family_uuid: String,
    #[serde(rename = "com.apple.corestorage.lv.name")]
    name: String,
    #[serde(rename = "com.apple.corestorage.lv.size")]
    size: u64,
    #[serde(rename = "com.apple.corestorage.lv.uuid")]
    uuid: String,
}

/// Inline XML properties carried by a type 0x0012 block
#[derive(Debug, Deserialize)]
struct VolumeGroupProperties {
    #[serde(rename = "com.apple.corestorage.lvg.name")]
    name: Option<String>,
}

/// Reassembly of the DEFLATE-compressed encryption context plist across a
/// 0x0019 block and its chain of 0x0024 continuations.
#[derive(Debug, Default)]
enum PlistReassembly {
    #[default]
    Idle,
    Accumulating {
        /// Object identifier the next chunk must be stored under
        owner: u64,
        buffer: Vec<u8>,
        write_offset: usize,
        uncompressed_size: usize,
    },
}

/// Decoded state of one encrypted metadata region
#[derive(Debug, Default)]
pub struct EncryptedMetadata {
    logical_volume_descriptors: Vec<LogicalVolumeDescriptor>,
    /// Transaction-wide scratch segment map, not attached to a volume
    segment_descriptors_0x0304: SegmentList,
    reassembly: PlistReassembly,
    encryption_context_plist_data: Option<Vec<u8>>,
    volume_group_name: Option<String>,
    physical_volume_identifier: Option<[u8; 16]>,
    volume_group_identifier: Option<[u8; 16]>,
    volume_group_number_of_blocks: u64,
    physical_volume_index: u32,
    physical_volume_size: u64,
    cross_link_0x0105: Option<u64>,
}

impl EncryptedMetadata {
    /// Decrypts and parses the encrypted metadata region at `offset`.
    ///
    /// `serial_number` is the owning volume's serial; blocks written under a
    /// different serial are still dispatched but noted in the debug log.
    pub fn read_from<R: Read + Seek>(
        reader: &mut R,
        offset: u64,
        size: u64,
        data_key: &[u8; 16],
        tweak_key: &[u8; 16],
        serial_number: u32,
        abort: &AtomicBool,
    ) -> Result<Self, Error> {
        if size == 0 || size % metadata_block::BLOCK_SIZE as u64 != 0 {
            return Err(Error::InvalidArgument(
                "encrypted metadata size must be a positive multiple of the block size",
            ));
        }

        log::debug!("reading encrypted metadata at offset {offset} ({size} bytes)");

        let context = XtsContext::new(data_key, tweak_key);
        let mut state = EncryptedMetadata::default();
        let mut block = vec![0u8; metadata_block::BLOCK_SIZE];
        let mut terminated = false;

        reader.seek(SeekFrom::Start(offset))?;
        for block_number in 0..size / metadata_block::BLOCK_SIZE as u64 {
            if abort.load(Ordering::Relaxed) {
                return Err(Error::Aborted);
            }
            reader.read_exact(&mut block)?;

            if metadata_block::is_empty_block(&block) {
                if !terminated {
                    log::debug!("empty metadata block {block_number} terminates the scan");
                    terminated = true;
                    // Without trace logging there is nothing to learn from
                    // the tail, stop reading.
                    if !log::log_enabled!(log::Level::Trace) {
                        break;
                    }
                }
                continue;
            }
            if terminated {
                log::trace!("non-empty metadata block {block_number} after the terminator");
                continue;
            }

            context.decrypt_sectors(&mut block, metadata_block::BLOCK_SIZE, block_number)?;
            let framed = MetadataBlock::parse(&block)?;
            if framed.is_lvf_wiped {
                continue;
            }
            if framed.serial_number != serial_number {
                log::debug!(
                    "metadata block {block_number} carries serial 0x{:08x}, volume is 0x{serial_number:08x}",
                    framed.serial_number
                );
            }
            state.dispatch(&framed)?;
        }

        if matches!(state.reassembly, PlistReassembly::Accumulating { .. }) {
            log::warn!("encrypted metadata ended with an unterminated compressed plist chain");
            state.reassembly = PlistReassembly::Idle;
        }
        Ok(state)
    }

    /// Routes a framed block to its type handler. Unknown types are no-ops.
    pub(crate) fn dispatch(&mut self, block: &MetadataBlock<'_>) -> Result<(), Error> {
        match block.block_type {
            0x0010 => self.read_type_0x0010(block.data),
            0x0011 => self.read_type_0x0011(block.data),
            0x0012 => self.read_type_0x0012(block.data),
            0x0013 | 0x0014 => self.read_transaction_record(block.data),
            0x0016 => counted_table(block.data, 4, le_u32(block.data, 0), 12),
            0x0017 => counted_table(block.data, 8, le_u64_count(block.data, 0), 32),
            0x0018 => self.read_type_0x0018(block.data),
            0x0019 => self.read_type_0x0019(block.data),
            0x001a => self.read_type_0x001a(block.data),
            0x001c => self.read_type_0x001c(block.data),
            0x001d => self.read_type_0x001d(block.data),
            0x0021 => self.read_type_0x0021(block.data),
            0x0022 => counted_table(block.data, 16, le_u64_count(block.data, 8), 32),
            0x0024 => self.read_type_0x0024(block.object_identifier, block.data),
            0x0025 => counted_table(block.data, 16, le_u64_count(block.data, 8), 24),
            0x0105 => self.read_type_0x0105(block.data),
            0x0205 | 0x0605 => reserved_block(block.data),
            0x0304 => self.read_type_0x0304(block.data),
            0x0305 => self.read_type_0x0305(block.object_identifier, block.data),
            0x0404 | 0x0405 => counted_table(block.data, 8, le_u32(block.data, 0), 48),
            0x0505 => self.read_type_0x0505(block.object_identifier, block.data),
            other => {
                log::trace!("ignoring metadata block type 0x{other:04x}");
                Ok(())
            }
        }
    }

    /// 0x0010: physical volume descriptor, mirroring the volume header.
    fn read_type_0x0010(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 344 {
            return Err(Error::OutOfBounds("physical volume descriptor block"));
        }
        let bounds = || Error::OutOfBounds("physical volume descriptor block");

        // The payload embeds the volume header fields shifted by 8 bytes.
        let bytes_per_sector = le_u32(data, 56).ok_or_else(bounds)?;
        self.physical_volume_size = le_u64(data, 72).ok_or_else(bounds)?;
        let block_size = le_u32(data, 104).ok_or_else(bounds)?;
        let encryption_method = le_u32(data, 180).ok_or_else(bounds)?;
        for index in 0..4 {
            let number = le_u64(data, 112 + index * 8).ok_or_else(bounds)?;
            log::trace!("physical volume metadata block {index}: {number}");
        }
        self.physical_volume_identifier = Some(uuid_bytes(data, 312).ok_or_else(bounds)?);
        self.volume_group_identifier = Some(uuid_bytes(data, 328).ok_or_else(bounds)?);

        log::debug!(
            "physical volume: size={} bytes, sector={bytes_per_sector}, block={block_size}, method={encryption_method}",
            self.physical_volume_size,
        );
        Ok(())
    }

    /// 0x0011: volume group directory, shared layout with the plaintext copy.
    fn read_type_0x0011(&mut self, data: &[u8]) -> Result<(), Error> {
        let directory = VolumeGroupDirectory::parse(data)?;
        self.volume_group_number_of_blocks = directory.volume_group_number_of_blocks;
        self.physical_volume_index = directory.physical_volume_index;
        Ok(())
    }

    /// 0x0012: inline volume-group XML blob.
    fn read_type_0x0012(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 54 {
            return Err(Error::OutOfBounds("volume group XML block"));
        }
        let xml = &data[48..];
        if !xml.starts_with(b"<dict") {
            return Ok(());
        }
        let properties: VolumeGroupProperties = from_dict_fragment(xml)?;
        if let Some(name) = properties.name {
            log::debug!("volume group name: {name:?}");
            self.volume_group_name = Some(name);
        }
        Ok(())
    }

    /// 0x0013 / 0x0014: transaction records; the LVG identifier is cross
    /// checked, the identifier tables are only bounded.
    fn read_transaction_record(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 72 {
            return Err(Error::OutOfBounds("transaction record block"));
        }
        let bounds = || Error::OutOfBounds("transaction record block");

        let group_identifier = uuid_bytes(data, 8).ok_or_else(bounds)?;
        if let Some(known) = self.volume_group_identifier {
            if known != group_identifier {
                return Err(Error::UnsupportedValue(
                    "transaction record volume group identifier mismatch",
                ));
            }
        }

        let number_of_object_identifiers = le_u32(data, 56).ok_or_else(bounds)? as usize;
        let number_of_entries = le_u32(data, 60).ok_or_else(bounds)? as usize;

        let mut offset = 128usize;
        let after_identifiers = table_end(data.len(), offset, number_of_object_identifiers, 8)
            .ok_or_else(bounds)?;
        for _ in 0..number_of_object_identifiers {
            let object_identifier = le_u64(data, offset).ok_or_else(bounds)?;
            log::trace!("transaction object identifier 0x{object_identifier:016x}");
            offset += 8;
        }
        offset = after_identifiers;
        table_end(data.len(), offset, number_of_entries, 8).ok_or_else(bounds)?;
        Ok(())
    }

    /// 0x0018: object identifier cross-link for the 0x0105 roster.
    fn read_type_0x0018(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 16 {
            return Err(Error::OutOfBounds("cross-link block"));
        }
        let link = le_u64(data, 0).ok_or(Error::OutOfBounds("cross-link block"))?;
        self.cross_link_0x0105 = Some(link);
        log::trace!("0x0105 cross-link object 0x{link:016x}");
        Ok(())
    }

    /// 0x0019: first chunk of the (possibly compressed) context plist.
    fn read_type_0x0019(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 64 {
            return Err(Error::OutOfBounds("compressed plist block"));
        }
        let bounds = || Error::OutOfBounds("compressed plist block");

        // Restart any chain left over from an earlier transaction.
        self.reassembly = PlistReassembly::Idle;

        let next_object_identifier = le_u64(data, 32).ok_or_else(bounds)?;
        let compressed_size = le_u32(data, 40).ok_or_else(bounds)? as usize;
        let uncompressed_size = le_u32(data, 44).ok_or_else(bounds)? as usize;
        let xml_data_offset = le_u32(data, 48).ok_or_else(bounds)? as usize;
        let xml_data_size = le_u32(data, 52).ok_or_else(bounds)? as usize;
        let number_of_entries = le_u16(data, 62).ok_or_else(bounds)? as usize;

        // The stored offset counts from the block start, the payload starts
        // 64 bytes in, after the entry table at 80.
        let table_start = 80usize;
        if xml_data_offset < table_start + metadata_block::HEADER_SIZE {
            return Err(Error::OutOfBounds("plist data offset"));
        }
        let payload_position = xml_data_offset - metadata_block::HEADER_SIZE;
        if payload_position >= data.len() || xml_data_size > data.len() - payload_position {
            return Err(Error::OutOfBounds("plist data extent"));
        }
        table_end(data.len(), table_start, number_of_entries, 24).ok_or_else(bounds)?;

        let xml_data = &data[payload_position..payload_position + xml_data_size];

        if compressed_size == uncompressed_size {
            // Stored uncompressed and inline; install directly.
            if xml_data.starts_with(b"<dict") {
                log::debug!("inline encryption context plist ({xml_data_size} bytes)");
                self.encryption_context_plist_data = Some(xml_data.to_vec());
            }
            return Ok(());
        }

        if xml_data_size > compressed_size {
            return Err(Error::OutOfBounds("first plist chunk exceeds the compressed size"));
        }
        let mut buffer = vec![0u8; compressed_size];
        buffer[..xml_data_size].copy_from_slice(xml_data);
        log::debug!(
            "compressed encryption context plist: {compressed_size} -> {uncompressed_size} bytes, first chunk {xml_data_size}"
        );
        self.reassembly = PlistReassembly::Accumulating {
            owner: next_object_identifier,
            buffer,
            write_offset: xml_data_size,
            uncompressed_size,
        };
        Ok(())
    }

    /// 0x001a: logical volume name/identifier/size update.
    fn read_type_0x001a(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 72 {
            return Err(Error::OutOfBounds("logical volume update block"));
        }
        let bounds = || Error::OutOfBounds("logical volume update block");

        let object_identifier = le_u64(data, 0).ok_or_else(bounds)?;
        let object_identifier_0x0305 = le_u64(data, 8).ok_or_else(bounds)?;
        let object_identifier_0x0505 = le_u64(data, 40).ok_or_else(bounds)?;
        let compressed_size = le_u32(data, 56).ok_or_else(bounds)?;
        let uncompressed_size = le_u32(data, 60).ok_or_else(bounds)?;
        let xml_data_offset = le_u32(data, 64).ok_or_else(bounds)? as usize;
        let xml_data_size = le_u32(data, 68).ok_or_else(bounds)? as usize;

        if xml_data_offset < 72 + metadata_block::HEADER_SIZE {
            return Err(Error::OutOfBounds("plist data offset"));
        }
        let payload_position = xml_data_offset - metadata_block::HEADER_SIZE;
        if payload_position >= data.len() || xml_data_size > data.len() - payload_position {
            return Err(Error::OutOfBounds("plist data extent"));
        }

        let descriptor = self
            .logical_volume_descriptors
            .iter_mut()
            .find(|descriptor| descriptor.object_identifier == object_identifier)
            .ok_or(Error::ValueMissing("logical volume descriptor for update block"))?;

        // A non-zero cross-link disagreeing with an already-stored one means
        // the transaction is torn.
        if object_identifier_0x0305 != 0
            && descriptor.object_identifier_0x0305 != 0
            && descriptor.object_identifier_0x0305 != object_identifier_0x0305
        {
            return Err(Error::UnsupportedValue("torn 0x0305 cross-link"));
        }
        if object_identifier_0x0505 != 0
            && descriptor.object_identifier_0x0505 != 0
            && descriptor.object_identifier_0x0505 != object_identifier_0x0505
        {
            return Err(Error::UnsupportedValue("torn 0x0505 cross-link"));
        }

        if compressed_size != uncompressed_size {
            return Err(Error::UnsupportedValue("compressed logical volume plist"));
        }

        let xml_data = &data[payload_position..payload_position + xml_data_size];
        if !xml_data.starts_with(b"<dict") {
            log::debug!("logical volume update without inline XML, skipping");
            return Ok(());
        }
        let properties: LogicalVolumeProperties = from_dict_fragment(xml_data)?;

        descriptor.family_identifier = parse_uuid(&properties.family_uuid)?;
        descriptor.identifier = parse_uuid(&properties.uuid)?;
        descriptor.size = properties.size;
        log::debug!(
            "logical volume 0x{object_identifier:016x}: {:?}, {} bytes",
            properties.name,
            properties.size
        );
        descriptor.name = Some(properties.name);
        Ok(())
    }

    /// 0x001c: block allocation entries chaining 0x0022/0x0405 objects.
    fn read_type_0x001c(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 16 {
            return Err(Error::OutOfBounds("allocation entry block"));
        }
        let bounds = || Error::OutOfBounds("allocation entry block");
        let number_of_entries = le_u64(data, 8).ok_or_else(bounds)? as usize;
        let mut offset = 16usize;
        table_end(data.len(), offset, number_of_entries, 32).ok_or_else(bounds)?;
        for _ in 0..number_of_entries {
            let number_of_blocks = le_u32(data, offset).ok_or_else(bounds)?;
            let block_number = le_u64(data, offset + 8).ok_or_else(bounds)?;
            let object_identifier_0x0022 = le_u64(data, offset + 16).ok_or_else(bounds)?;
            let object_identifier_0x0405 = le_u64(data, offset + 24).ok_or_else(bounds)?;
            log::trace!(
                "allocation: {number_of_blocks} blocks at {block_number} (0x0022: 0x{object_identifier_0x0022:016x}, 0x0405: 0x{object_identifier_0x0405:016x})"
            );
            offset += 32;
        }
        Ok(())
    }

    /// 0x001d: physical extent entries.
    fn read_type_0x001d(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 24 {
            return Err(Error::OutOfBounds("physical extent block"));
        }
        let bounds = || Error::OutOfBounds("physical extent block");
        let number_of_entries = le_u64(data, 16).ok_or_else(bounds)? as usize;
        let mut offset = 24usize;
        table_end(data.len(), offset, number_of_entries, 16).ok_or_else(bounds)?;
        for _ in 0..number_of_entries {
            let number_of_blocks = le_u32(data, offset).ok_or_else(bounds)?;
            let packed = le_u64(data, offset + 8).ok_or_else(bounds)?;
            log::trace!(
                "physical extent: {number_of_blocks} blocks at {} on volume {}",
                packed & 0x0000_ffff_ffff_ffff,
                packed >> 48
            );
            offset += 16;
        }
        Ok(())
    }

    /// 0x0021: logical volume size summary.
    fn read_type_0x0021(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 6 {
            return Err(Error::OutOfBounds("size summary block"));
        }
        let bounds = || Error::OutOfBounds("size summary block");
        let number_of_entries = le_u16(data, 0).ok_or_else(bounds)?;
        let number_of_blocks = le_u32(data, 2).ok_or_else(bounds)?;
        log::trace!("size summary: {number_of_entries} entries, {number_of_blocks} blocks");
        Ok(())
    }

    /// 0x0024: compressed plist continuation chunk.
    fn read_type_0x0024(&mut self, object_identifier: u64, data: &[u8]) -> Result<(), Error> {
        if data.len() < 16 {
            return Err(Error::OutOfBounds("plist continuation block"));
        }
        let bounds = || Error::OutOfBounds("plist continuation block");
        let next_object_identifier = le_u64(data, 0).ok_or_else(bounds)?;
        let xml_data_size = le_u32(data, 8).ok_or_else(bounds)? as usize;

        // Taking the chain out keeps the state clean on every error path.
        let PlistReassembly::Accumulating {
            owner,
            mut buffer,
            mut write_offset,
            uncompressed_size,
        } = std::mem::take(&mut self.reassembly)
        else {
            // No chain in progress; a stale continuation is ignored.
            log::debug!("orphan plist continuation for object 0x{object_identifier:016x}");
            return Ok(());
        };

        if object_identifier != 0 && owner != 0 && owner != object_identifier {
            return Err(Error::UnsupportedValue("plist continuation chain mismatch"));
        }
        if xml_data_size > data.len() - 16 {
            return Err(Error::OutOfBounds("plist continuation extent"));
        }
        if xml_data_size > buffer.len() - write_offset {
            return Err(Error::OutOfBounds("plist continuation overflows the compressed buffer"));
        }

        buffer[write_offset..write_offset + xml_data_size]
            .copy_from_slice(&data[16..16 + xml_data_size]);
        write_offset += xml_data_size;

        if next_object_identifier != 0 {
            self.reassembly = PlistReassembly::Accumulating {
                owner: next_object_identifier,
                buffer,
                write_offset,
                uncompressed_size,
            };
            return Ok(());
        }

        // Chain complete: inflate and install when the result is a dict.
        let uncompressed = crypto::inflate(&buffer, uncompressed_size)?;
        if uncompressed.starts_with(b"<dict") {
            log::debug!("reassembled encryption context plist ({uncompressed_size} bytes)");
            self.encryption_context_plist_data = Some(uncompressed);
        } else {
            log::debug!("reassembled plist is not a dict, discarding");
        }
        Ok(())
    }

    /// 0x0105: roster of logical volume object identifiers.
    fn read_type_0x0105(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 8 {
            return Err(Error::OutOfBounds("logical volume roster block"));
        }
        let bounds = || Error::OutOfBounds("logical volume roster block");
        let number_of_entries = le_u32(data, 0).ok_or_else(bounds)? as usize;
        let mut offset = 8usize;
        table_end(data.len(), offset, number_of_entries, 16).ok_or_else(bounds)?;

        for entry_index in 0..number_of_entries {
            let object_identifier = le_u64(data, offset).ok_or_else(bounds)?;
            offset += 16;

            match self.logical_volume_descriptors.get(entry_index) {
                None => {
                    log::debug!(
                        "logical volume {entry_index}: object 0x{object_identifier:016x}"
                    );
                    self.logical_volume_descriptors.push(LogicalVolumeDescriptor {
                        object_identifier,
                        ..Default::default()
                    });
                }
                Some(existing) if existing.object_identifier != object_identifier => {
                    return Err(Error::UnsupportedValue(
                        "logical volume roster identifier mismatch",
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// 0x0304: transaction-scoped segment map.
    fn read_type_0x0304(&mut self, data: &[u8]) -> Result<(), Error> {
        // The previous transaction's map is discarded, never merged.
        let mut scratch = std::mem::take(&mut self.segment_descriptors_0x0304);
        scratch.clear();
        let result = parse_segment_entries(data, &mut scratch);
        self.segment_descriptors_0x0304 = scratch;
        result
    }

    /// 0x0305: segment map for the most recently rostered logical volume.
    fn read_type_0x0305(&mut self, object_identifier: u64, data: &[u8]) -> Result<(), Error> {
        let descriptor = self
            .logical_volume_descriptors
            .last_mut()
            .ok_or(Error::ValueMissing("logical volume descriptor for segment map"))?;
        descriptor.segment_descriptors.clear();
        let mut segments = std::mem::take(&mut descriptor.segment_descriptors);
        let result = parse_segment_entries(data, &mut segments);
        descriptor.segment_descriptors = segments;
        if result.is_ok() {
            descriptor.object_identifier_0x0305 = object_identifier;
        }
        result
    }

    /// 0x0505: base physical block for the most recently rostered volume.
    fn read_type_0x0505(&mut self, object_identifier: u64, data: &[u8]) -> Result<(), Error> {
        if data.len() < 8 {
            return Err(Error::OutOfBounds("base block record"));
        }
        let bounds = || Error::OutOfBounds("base block record");
        let descriptor = self
            .logical_volume_descriptors
            .last_mut()
            .ok_or(Error::ValueMissing("logical volume descriptor for base block"))?;

        let number_of_entries = le_u32(data, 0).ok_or_else(bounds)? as usize;
        table_end(data.len(), 8, number_of_entries, 16).ok_or_else(bounds)?;
        if number_of_entries != 1 {
            return Err(Error::UnsupportedValue("base block record entry count"));
        }
        let physical_block_number = le_u64(data, 16).ok_or_else(bounds)?;
        if physical_block_number >> 48 != 0 {
            return Err(Error::UnsupportedValue("base block physical volume index"));
        }

        descriptor.object_identifier_0x0505 = object_identifier;
        descriptor.base_physical_block_number = physical_block_number;
        Ok(())
    }

    pub fn logical_volume_descriptors(&self) -> &[LogicalVolumeDescriptor] {
        &self.logical_volume_descriptors
    }

    pub fn descriptor_by_object_identifier(
        &self,
        object_identifier: u64,
    ) -> Option<&LogicalVolumeDescriptor> {
        self.logical_volume_descriptors
            .iter()
            .find(|descriptor| descriptor.object_identifier == object_identifier)
    }

    pub fn volume_group_name(&self) -> Option<&str> {
        self.volume_group_name.as_deref()
    }

    pub fn physical_volume_identifier(&self) -> Option<&[u8; 16]> {
        self.physical_volume_identifier.as_ref()
    }

    pub fn volume_group_identifier(&self) -> Option<&[u8; 16]> {
        self.volume_group_identifier.as_ref()
    }

    pub fn physical_volume_size(&self) -> u64 {
        self.physical_volume_size
    }

    pub fn volume_group_number_of_blocks(&self) -> u64 {
        self.volume_group_number_of_blocks
    }

    pub fn physical_volume_index(&self) -> u32 {
        self.physical_volume_index
    }

    /// Cross-link installed by a type 0x0018 block, when one was seen
    pub fn roster_cross_link(&self) -> Option<u64> {
        self.cross_link_0x0105
    }

    pub(crate) fn encryption_context_plist_data(&self) -> Option<&[u8]> {
        self.encryption_context_plist_data.as_deref()
    }

    /// The transaction-scoped segment map carried by 0x0304 blocks
    pub fn transaction_segments(&self) -> &SegmentList {
        &self.segment_descriptors_0x0304
    }
}

/// 0x0205 / 0x0605: reserved block types, length-checked only.
fn reserved_block(data: &[u8]) -> Result<(), Error> {
    if data.len() < 54 {
        return Err(Error::OutOfBounds("reserved metadata block"));
    }
    Ok(())
}

/// Advances past a counted table, verifying it fits inside the payload.
/// An empty table occupies no space and always fits.
fn table_end(data_len: usize, offset: usize, count: usize, stride: usize) -> Option<usize> {
    if count == 0 {
        return Some(offset);
    }
    let table_size = count.checked_mul(stride)?;
    let end = offset.checked_add(table_size)?;
    (end <= data_len).then_some(end)
}

/// Generic handler for table-only block types: length and bound checks.
fn counted_table(
    data: &[u8],
    table_offset: usize,
    count: Option<u32>,
    stride: usize,
) -> Result<(), Error> {
    let count = count.ok_or(Error::OutOfBounds("counted table block"))? as usize;
    table_end(data.len(), table_offset, count, stride)
        .ok_or(Error::OutOfBounds("counted table block"))?;
    Ok(())
}

/// Reads a u64 entry count but reports it as u32 for `counted_table`.
fn le_u64_count(data: &[u8], offset: usize) -> Option<u32> {
    le_u64(data, offset).and_then(|count| u32::try_from(count).ok())
}

/// Shared decode for the 40-byte segment entries of 0x0304/0x0305.
fn parse_segment_entries(data: &[u8], list: &mut SegmentList) -> Result<(), Error> {
    if data.len() < 8 {
        return Err(Error::OutOfBounds("segment map block"));
    }
    let bounds = || Error::OutOfBounds("segment map block");
    let number_of_entries = le_u32(data, 0).ok_or_else(bounds)? as usize;
    let mut offset = 8usize;
    table_end(data.len(), offset, number_of_entries, 40).ok_or_else(bounds)?;

    for _ in 0..number_of_entries {
        let logical_block_number = le_i64(data, offset + 8).ok_or_else(bounds)?;
        let number_of_blocks = le_u32(data, offset + 16).ok_or_else(bounds)?;
        let packed = le_u64(data, offset + 32).ok_or_else(bounds)?;
        offset += 40;

        let descriptor = SegmentDescriptor {
            logical_block_number,
            physical_block_number: packed & 0x0000_ffff_ffff_ffff,
            physical_volume_index: (packed >> 48) as u16,
            number_of_blocks,
        };
        log::trace!(
            "segment: logical {} + {} -> physical {} on volume {}",
            descriptor.logical_block_number,
            descriptor.number_of_blocks,
            descriptor.physical_block_number,
            descriptor.physical_volume_index
        );
        list.insert(descriptor)?;
    }
    Ok(())
}

fn parse_uuid(value: &str) -> Result<[u8; 16], Error> {
    Uuid::parse_str(value)
        .map(|uuid| *uuid.as_bytes())
        .map_err(|_| Error::InvalidValue("malformed UUID string"))
}
