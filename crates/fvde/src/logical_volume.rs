// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Logical volume reader
//!
//! A byte-addressable, transparently-decrypted view of one logical volume.
//! Reads translate the logical offset through the segment map, fetch the
//! covering 512-byte sector from the owning physical volume and decrypt it
//! with the absolute physical sector number as the XTS tweak. Logical
//! ranges no segment covers read back as zeroes.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::crypto::{self, XtsContext};
use crate::encrypted_metadata::LogicalVolumeDescriptor;
use crate::encryption_context::EncryptionContextPlist;
use crate::io_pool::IoPool;
use crate::keyring::Keyring;
use crate::Error;

/// Logical sector size; independent of the 8192-byte metadata block size
pub const BYTES_PER_SECTOR: usize = 512;

/// One unlocked (or still locked) logical volume handle
pub struct LogicalVolume<R> {
    descriptor: LogicalVolumeDescriptor,
    pool: Arc<Mutex<IoPool<R>>>,
    encryption_context: Option<Arc<EncryptionContextPlist>>,

    passphrase: Option<Zeroizing<Vec<u8>>>,
    recovery_passphrase: Option<Zeroizing<Vec<u8>>>,
    master_key: Option<Zeroizing<[u8; 16]>>,

    keyring: Option<Keyring>,
    cipher: Option<XtsContext>,

    /// Stream position for the `Read`/`Seek` impls
    offset: u64,
    /// Exactly one decrypted sector is cached; byte-granular readers hit it
    /// constantly, aligned readers never do.
    cached_sector: Option<u64>,
    cache: [u8; BYTES_PER_SECTOR],
}

impl<R: Read + Seek> LogicalVolume<R> {
    pub(crate) fn new(
        descriptor: LogicalVolumeDescriptor,
        pool: Arc<Mutex<IoPool<R>>>,
        encryption_context: Option<Arc<EncryptionContextPlist>>,
    ) -> Self {
        Self {
            descriptor,
            pool,
            encryption_context,
            passphrase: None,
            recovery_passphrase: None,
            master_key: None,
            keyring: None,
            cipher: None,
            offset: 0,
            cached_sector: None,
            cache: [0u8; BYTES_PER_SECTOR],
        }
    }

    /// Size of the logical volume in bytes
    pub fn size(&self) -> u64 {
        self.descriptor.size()
    }

    pub fn identifier(&self) -> &[u8; 16] {
        self.descriptor.identifier()
    }

    pub fn identifier_string(&self) -> String {
        self.descriptor.identifier_string()
    }

    pub fn name(&self) -> Option<&str> {
        self.descriptor.name()
    }

    pub fn is_locked(&self) -> bool {
        self.cipher.is_none()
    }

    /// Sets the volume master key directly, bypassing the unwrap chain.
    pub fn set_key(&mut self, volume_master_key: &[u8; 16]) {
        self.master_key = Some(Zeroizing::new(*volume_master_key));
    }

    /// Sets the user passphrase for the next unlock attempt.
    pub fn set_passphrase(&mut self, passphrase: &str) {
        self.passphrase = Some(Zeroizing::new(passphrase.as_bytes().to_vec()));
    }

    /// UTF-16 variant of [`Self::set_passphrase`].
    pub fn set_utf16_passphrase(&mut self, passphrase: &[u16]) -> Result<(), Error> {
        let decoded = String::from_utf16(passphrase)
            .map_err(|_| Error::InvalidArgument("passphrase is not valid UTF-16"))?;
        self.passphrase = Some(Zeroizing::new(decoded.into_bytes()));
        Ok(())
    }

    /// Sets the recovery passphrase for the next unlock attempt.
    pub fn set_recovery_passphrase(&mut self, passphrase: &str) {
        self.recovery_passphrase = Some(Zeroizing::new(passphrase.as_bytes().to_vec()));
    }

    /// UTF-16 variant of [`Self::set_recovery_passphrase`].
    pub fn set_utf16_recovery_passphrase(&mut self, passphrase: &[u16]) -> Result<(), Error> {
        let decoded = String::from_utf16(passphrase)
            .map_err(|_| Error::InvalidArgument("recovery passphrase is not valid UTF-16"))?;
        self.recovery_passphrase = Some(Zeroizing::new(decoded.into_bytes()));
        Ok(())
    }

    /// Attempts to unlock the volume with the supplied key material.
    ///
    /// Returns `Ok(false)` when no passphrase attempt satisfied a crypto
    /// user; descriptors stay intact so another attempt can follow without
    /// reparsing the metadata.
    pub fn unlock(&mut self) -> Result<bool, Error> {
        if self.cipher.is_some() {
            return Ok(true);
        }

        let volume_master_key = match &self.master_key {
            Some(key) => Some(Zeroizing::new(**key)),
            None => self.unwrap_master_key()?,
        };
        let Some(volume_master_key) = volume_master_key else {
            log::debug!("logical volume {} stays locked", self.identifier_string());
            return Ok(false);
        };

        let tweak_key =
            crypto::volume_tweak_key(&volume_master_key, self.descriptor.family_identifier());
        let keyring = Keyring::new(*volume_master_key, *tweak_key);
        let (data_key, tweak_half) = keyring.xts_key_pair();
        self.cipher = Some(XtsContext::new(data_key, &tweak_half));
        self.keyring = Some(keyring);
        self.cached_sector = None;

        log::debug!("logical volume {} unlocked", self.identifier_string());
        Ok(true)
    }

    /// Like [`Self::unlock`], but an unmatched passphrase is an error
    /// rather than a `false` return.
    pub fn unlock_required(&mut self) -> Result<(), Error> {
        if self.unlock()? {
            Ok(())
        } else {
            Err(Error::PasswordIncorrect)
        }
    }

    fn unwrap_master_key(&self) -> Result<Option<Zeroizing<[u8; 16]>>, Error> {
        let Some(context) = &self.encryption_context else {
            return Err(Error::ValueMissing("encryption context plist"));
        };
        if let Some(passphrase) = &self.passphrase {
            if let Some(key) = context.find_volume_master_key(passphrase)? {
                return Ok(Some(key));
            }
        }
        if let Some(passphrase) = &self.recovery_passphrase {
            if let Some(key) = context.find_volume_master_key(passphrase)? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Reads up to `buffer.len()` bytes at the absolute `offset`.
    ///
    /// The returned length is `min(len, max(0, size - offset))`: reads are
    /// truncated at the end of the volume, reads at or past it return 0.
    pub fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize, Error> {
        if self.is_locked() {
            return Err(Error::ValueMissing("volume keys, the volume is locked"));
        }
        let size = self.size();
        if offset >= size || buffer.is_empty() {
            return Ok(0);
        }
        let count = usize::try_from((size - offset).min(buffer.len() as u64))
            .unwrap_or(buffer.len());

        let mut position = offset;
        let mut produced = 0usize;
        while produced < count {
            let sector = position / BYTES_PER_SECTOR as u64;
            let intra = (position % BYTES_PER_SECTOR as u64) as usize;
            self.load_sector(sector)?;

            let available = (BYTES_PER_SECTOR - intra).min(count - produced);
            buffer[produced..produced + available]
                .copy_from_slice(&self.cache[intra..intra + available]);
            produced += available;
            position += available as u64;
        }
        Ok(count)
    }

    /// Fills the cache with the decrypted content of logical `sector`.
    fn load_sector(&mut self, sector: u64) -> Result<(), Error> {
        if self.cached_sector == Some(sector) {
            return Ok(());
        }

        match self.descriptor.segment_lookup(sector) {
            None => {
                // Hole: unmapped logical space reads back as zeroes without
                // touching the physical volumes.
                self.cache.fill(0);
            }
            Some((physical_volume_index, physical_block)) => {
                let cipher = self
                    .cipher
                    .as_ref()
                    .ok_or(Error::ValueMissing("volume keys, the volume is locked"))?;

                let mut pool = self
                    .pool
                    .lock()
                    .map_err(|_| Error::InvalidValue("poisoned I/O pool lock"))?;
                pool.read_exact_at(
                    usize::from(physical_volume_index),
                    physical_block * BYTES_PER_SECTOR as u64,
                    &mut self.cache,
                )?;
                drop(pool);

                let tweak = self.descriptor.base_physical_block_number() + physical_block;
                cipher.decrypt_sectors(&mut self.cache, BYTES_PER_SECTOR, tweak)?;
            }
        }
        self.cached_sector = Some(sector);
        Ok(())
    }

    /// Current stream position of the `Read`/`Seek` view
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl<R: Read + Seek> Read for LogicalVolume<R> {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let count = self
            .read_at(self.offset, buffer)
            .map_err(io::Error::other)?;
        self.offset += count as u64;
        Ok(count)
    }
}

impl<R: Read + Seek> Seek for LogicalVolume<R> {
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the volume",
            ));
        };
        self.offset = target;
        Ok(target)
    }
}

impl LogicalVolumeDescriptor {
    /// Maps a logical sector to `(physical_volume_index, physical_block)`.
    fn segment_lookup(&self, sector: u64) -> Option<(u16, u64)> {
        let segment = self.segment_descriptors.find(sector)?;
        let delta = sector - segment.logical_block_number as u64;
        Some((
            segment.physical_volume_index,
            segment.physical_block_number + delta,
        ))
    }
}
