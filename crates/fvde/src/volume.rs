// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Core Storage volume orchestration
//!
//! [`Volume::open`] walks a physical volume image end to end: the 512-byte
//! header, the freshest of the four plaintext metadata regions, then the
//! primary encrypted metadata region (falling back to the secondary when
//! the primary does not parse). The result is an immutable set of
//! fully-populated logical volume descriptors; [`Volume::logical_volume`]
//! hands out read handles against them.

use std::io::{Read, Seek};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use crate::encrypted_metadata::{EncryptedMetadata, LogicalVolumeDescriptor};
use crate::encryption_context::EncryptionContextPlist;
use crate::io_pool::IoPool;
use crate::logical_volume::LogicalVolume;
use crate::metadata::Metadata;
use crate::volume_header::{self, VolumeHeader};
use crate::{Error, metadata_block};

/// An opened Core Storage physical volume and its volume group state
pub struct Volume<R> {
    header: VolumeHeader,
    metadata: Metadata,
    encrypted_metadata: EncryptedMetadata,
    encryption_context: Option<Arc<EncryptionContextPlist>>,
    pool: Arc<Mutex<IoPool<R>>>,
    abort: Arc<AtomicBool>,
}

impl<R: Read + Seek> Volume<R> {
    /// Opens a physical volume image and parses its metadata.
    pub fn open(mut reader: R) -> Result<Self, Error> {
        let abort = Arc::new(AtomicBool::new(false));

        let header = volume_header::from_reader(&mut reader)?;
        let metadata = Metadata::read_from(&mut reader, &header.metadata_offsets())?;
        let encrypted_metadata =
            Self::read_encrypted_metadata(&mut reader, &header, &metadata, &abort)?;

        let encryption_context = match encrypted_metadata.encryption_context_plist_data() {
            Some(data) => match EncryptionContextPlist::from_data(data) {
                Ok(plist) => Some(Arc::new(plist)),
                Err(error) => {
                    // Unlock by passphrase will be impossible, but a caller
                    // holding the volume master key can still read.
                    log::warn!("encryption context plist does not parse: {error}");
                    None
                }
            },
            None => None,
        };

        let mut pool = IoPool::new();
        pool.set_handle(0, reader);

        Ok(Self {
            header,
            metadata,
            encrypted_metadata,
            encryption_context,
            pool: Arc::new(Mutex::new(pool)),
            abort,
        })
    }

    /// Reads the primary encrypted metadata region, falling back to the
    /// secondary copy when the primary is unusable.
    fn read_encrypted_metadata(
        reader: &mut R,
        header: &VolumeHeader,
        metadata: &Metadata,
        abort: &AtomicBool,
    ) -> Result<EncryptedMetadata, Error> {
        let (data_key, tweak_key) = header.metadata_key_pair();
        let size = metadata.encrypted_metadata_size;

        // Only regions hosted on this physical volume can be read through
        // the single open handle; other pool members are best-effort.
        let mut candidates = Vec::new();
        if metadata.encrypted_metadata1_volume_index == 0 {
            candidates.push(metadata.encrypted_metadata1_offset);
        }
        if metadata.encrypted_metadata2_volume_index == 0
            && metadata.encrypted_metadata2_offset != metadata.encrypted_metadata1_offset
        {
            candidates.push(metadata.encrypted_metadata2_offset);
        }
        if candidates.is_empty() {
            return Err(Error::ValueMissing(
                "encrypted metadata region on the opened physical volume",
            ));
        }

        let mut last_error = Error::ValueMissing("encrypted metadata region");
        for (candidate_index, offset) in candidates.into_iter().enumerate() {
            match EncryptedMetadata::read_from(
                reader,
                offset,
                size,
                &data_key,
                &tweak_key,
                metadata.serial_number,
                abort,
            ) {
                Ok(state) => {
                    if candidate_index > 0 {
                        log::info!("primary encrypted metadata unusable, using the secondary copy");
                    }
                    return Ok(state);
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(error) => {
                    log::warn!(
                        "encrypted metadata region at offset {offset} failed: {error}"
                    );
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Loads and decrypts an out-of-band `EncryptedRoot.plist`, replacing
    /// any context recovered from the encrypted metadata.
    pub fn set_encrypted_root_plist<P: Read>(&mut self, reader: &mut P) -> Result<(), Error> {
        let plist = EncryptionContextPlist::from_encrypted_file(reader, self.header.key_data())?;
        self.encryption_context = Some(Arc::new(plist));
        Ok(())
    }

    /// Installs a reader for an additional physical volume of the group.
    pub fn add_physical_volume(&mut self, index: usize, reader: R) -> Result<(), Error> {
        if index == 0 {
            return Err(Error::InvalidArgument(
                "physical volume 0 is installed by open",
            ));
        }
        let mut pool = self
            .pool
            .lock()
            .map_err(|_| Error::InvalidValue("poisoned I/O pool lock"))?;
        pool.set_handle(index, reader);
        Ok(())
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn volume_group_name(&self) -> Option<&str> {
        self.encrypted_metadata.volume_group_name()
    }

    /// Raising the returned flag makes long scans fail with `Aborted`.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// The logical volumes described by the committed metadata
    pub fn logical_volume_descriptors(&self) -> &[LogicalVolumeDescriptor] {
        self.encrypted_metadata.logical_volume_descriptors()
    }

    /// Whether an encryption context is available for passphrase unlocks
    pub fn has_encryption_context(&self) -> bool {
        self.encryption_context.is_some()
    }

    /// Creates a read handle for logical volume `index`.
    ///
    /// The handle shares the physical volume I/O pool with this volume and
    /// starts out locked; supply key material and call
    /// [`LogicalVolume::unlock`].
    pub fn logical_volume(&self, index: usize) -> Result<LogicalVolume<R>, Error> {
        let descriptor = self
            .encrypted_metadata
            .logical_volume_descriptors()
            .get(index)
            .ok_or(Error::InvalidArgument("logical volume index"))?
            .clone();
        Ok(LogicalVolume::new(
            descriptor,
            Arc::clone(&self.pool),
            self.encryption_context.clone(),
        ))
    }

    /// The parsed state of the committed encrypted metadata region
    pub fn encrypted_metadata(&self) -> &EncryptedMetadata {
        &self.encrypted_metadata
    }

    /// Number of metadata blocks an encrypted-region scan traverses
    pub fn encrypted_metadata_block_count(&self) -> u64 {
        self.metadata.encrypted_metadata_size / metadata_block::BLOCK_SIZE as u64
    }
}
