// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Read-only access to Apple Core Storage / FileVault 2 (FVDE) volumes
//!
//! Given a raw physical-volume image and either a passphrase, a recovery
//! passphrase, a known volume master key, or an out-of-band
//! `EncryptedRoot.plist`, this crate walks the Core Storage metadata,
//! unwraps the volume encryption keys and exposes each logical volume as a
//! byte-addressable stream whose reads are transparently decrypted.
//!
//! ```no_run
//! use std::fs::File;
//!
//! let image = File::open("/tmp/corestorage.raw")?;
//! let volume = fvde::Volume::open(image)?;
//!
//! let mut lv = volume.logical_volume(0)?;
//! lv.set_passphrase("equal-rites");
//! if lv.unlock()? {
//!     let mut first = [0u8; 512];
//!     lv.read_at(0, &mut first)?;
//! }
//! # Ok::<(), fvde::Error>(())
//! ```

use std::io;

use thiserror::Error;

pub(crate) mod bytes;
pub mod checksum;
pub mod crypto;
pub mod encrypted_metadata;
pub mod encryption_context;
mod io_pool;
pub mod keyring;
pub mod logical_volume;
pub mod metadata;
pub mod metadata_block;
pub mod segment;
pub mod volume;
pub mod volume_header;

pub use encrypted_metadata::LogicalVolumeDescriptor;
pub use io_pool::IoPool;
pub use logical_volume::LogicalVolume;
pub use volume::Volume;

/// Errors that can occur while reading a Core Storage volume
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-side misuse (bad length, bad index)
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A length or offset violates an on-disk invariant
    #[error("value out of bounds: {0}")]
    OutOfBounds(&'static str),

    /// Future block, header or checksum-algorithm versions
    #[error("unsupported version: {0}")]
    UnsupportedVersion(&'static str),

    /// Valid format but a constraint this implementation does not handle
    #[error("unsupported value: {0}")]
    UnsupportedValue(&'static str),

    /// The Core Storage signature is missing
    #[error("invalid core storage signature")]
    InvalidSignature,

    /// A field carries a value no well-formed volume produces
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// Stored and computed block checksums disagree
    #[error("checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// An AES, key-wrap, PBKDF2 or DEFLATE primitive failed
    #[error("crypto failure: {0}")]
    CryptoFailure(&'static str),

    /// A cross-reference points at an absent object
    #[error("missing value: {0}")]
    ValueMissing(&'static str),

    /// No passphrase-wrapped KEK unwrapped to a valid integrity value
    #[error("passphrase incorrect")]
    PasswordIncorrect,

    /// The per-volume abort flag was raised
    #[error("operation aborted")]
    Aborted,

    /// An underlying read failed or came back short
    #[error("io: {0}")]
    Io(#[from] io::Error),
}
