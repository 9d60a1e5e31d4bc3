// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cryptographic primitives used by the Core Storage readers
//!
//! Everything in this module operates on already-loaded key material; key
//! discovery and the unwrap chain live in [`crate::encryption_context`].
//!
//! | Operation | Used for |
//! |-----------|----------|
//! | AES-128-XTS | encrypted metadata region, EncryptedRoot.plist, logical volume sectors |
//! | AES key unwrap (RFC 3394) | passphrase KEK and volume-master-key recovery |
//! | PBKDF2-HMAC-SHA256 | passphrase key derivation |
//! | SHA-256 | logical-volume tweak-key derivation |
//! | zlib/DEFLATE | compressed metadata plist reassembly |

use std::io::Read;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use flate2::read::ZlibDecoder;
use hmac::Hmac;
use sha2::{Digest, Sha256};
use xts_mode::{get_tweak_default, Xts128};
use zeroize::{Zeroize, Zeroizing};

use crate::Error;

/// RFC 3394 default initialization vector; a successful unwrap recovers it
/// as the leading 8 bytes of the plaintext.
pub const KEY_WRAP_IV: [u8; 8] = [0xa6; 8];

/// AES-128-XTS context in the sector-tweak convention: the tweak for sector
/// `n` is the little-endian 16-byte representation of `n` encrypted under
/// the tweak key.
pub struct XtsContext {
    cipher: Xts128<Aes128>,
}

impl XtsContext {
    pub fn new(key: &[u8; 16], tweak_key: &[u8; 16]) -> Self {
        let cipher = Xts128::new(
            Aes128::new(GenericArray::from_slice(key)),
            Aes128::new(GenericArray::from_slice(tweak_key)),
        );
        Self { cipher }
    }

    /// Decrypts `data` in place as consecutive sectors of `sector_size`
    /// bytes, the first carrying sector number `first_sector`.
    pub fn decrypt_sectors(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), Error> {
        check_sector_bounds(data.len(), sector_size)?;
        self.cipher
            .decrypt_area(data, sector_size, u128::from(first_sector), get_tweak_default);
        Ok(())
    }

    /// Encrypts `data` in place; the inverse of [`Self::decrypt_sectors`].
    pub fn encrypt_sectors(
        &self,
        data: &mut [u8],
        sector_size: usize,
        first_sector: u64,
    ) -> Result<(), Error> {
        check_sector_bounds(data.len(), sector_size)?;
        self.cipher
            .encrypt_area(data, sector_size, u128::from(first_sector), get_tweak_default);
        Ok(())
    }
}

fn check_sector_bounds(data_len: usize, sector_size: usize) -> Result<(), Error> {
    if sector_size == 0 || sector_size % 16 != 0 {
        return Err(Error::CryptoFailure("XTS sector size must be a multiple of 16"));
    }
    if data_len % sector_size != 0 {
        return Err(Error::CryptoFailure("XTS data length must be a multiple of the sector size"));
    }
    Ok(())
}

/// AES key unwrap per RFC 3394 with a 128-bit KEK.
///
/// Returns the full plaintext including the recovered initialization value
/// at the front; the caller decides whether a [`KEY_WRAP_IV`] mismatch is an
/// error or merely "wrong passphrase, try the next user".
pub fn aes_key_unwrap(kek: &[u8; 16], wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(Error::CryptoFailure("key unwrap input must be 8-byte aligned, at least 24 bytes"));
    }
    let cipher = Aes128::new(GenericArray::from_slice(kek));
    let n = wrapped.len() / 8 - 1;

    let mut a = read_be_u64(&wrapped[..8]);
    let mut registers: Zeroizing<Vec<u64>> = Zeroizing::new(
        wrapped[8..].chunks_exact(8).map(read_be_u64).collect(),
    );

    let mut block = [0u8; 16];
    for j in (0..6u64).rev() {
        for i in (1..=n).rev() {
            let t = (n as u64) * j + i as u64;
            block[..8].copy_from_slice(&(a ^ t).to_be_bytes());
            block[8..].copy_from_slice(&registers[i - 1].to_be_bytes());
            cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
            a = read_be_u64(&block[..8]);
            registers[i - 1] = read_be_u64(&block[8..]);
        }
    }
    block.zeroize();

    let mut plaintext = Zeroizing::new(Vec::with_capacity(wrapped.len()));
    plaintext.extend_from_slice(&a.to_be_bytes());
    for register in registers.iter() {
        plaintext.extend_from_slice(&register.to_be_bytes());
    }
    Ok(plaintext)
}

/// AES key wrap per RFC 3394 with a 128-bit KEK; the inverse of
/// [`aes_key_unwrap`]. Core Storage is strictly read-only, so outside of
/// authoring test fixtures nothing in this crate calls it.
pub fn aes_key_wrap(kek: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    if plaintext.len() < 16 || plaintext.len() % 8 != 0 {
        return Err(Error::CryptoFailure("key wrap input must be 8-byte aligned, at least 16 bytes"));
    }
    let cipher = Aes128::new(GenericArray::from_slice(kek));
    let n = plaintext.len() / 8;

    let mut a = u64::from_be_bytes(KEY_WRAP_IV);
    let mut registers: Vec<u64> = plaintext.chunks_exact(8).map(read_be_u64).collect();

    let mut block = [0u8; 16];
    for j in 0..6u64 {
        for i in 1..=n {
            block[..8].copy_from_slice(&a.to_be_bytes());
            block[8..].copy_from_slice(&registers[i - 1].to_be_bytes());
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
            let t = (n as u64) * j + i as u64;
            a = read_be_u64(&block[..8]) ^ t;
            registers[i - 1] = read_be_u64(&block[8..]);
        }
    }
    block.zeroize();

    let mut ciphertext = Vec::with_capacity(plaintext.len() + 8);
    ciphertext.extend_from_slice(&a.to_be_bytes());
    for register in &registers {
        ciphertext.extend_from_slice(&register.to_be_bytes());
    }
    Ok(ciphertext)
}

fn read_be_u64(bytes: &[u8]) -> u64 {
    let mut value = [0u8; 8];
    value.copy_from_slice(bytes);
    u64::from_be_bytes(value)
}

/// Derives the 16-byte passphrase key with PBKDF2-HMAC-SHA256.
pub fn passphrase_key(
    passphrase: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; 16]>, Error> {
    let mut key = Zeroizing::new([0u8; 16]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase, salt, iterations, &mut key[..])
        .map_err(|_| Error::CryptoFailure("PBKDF2 derivation failed"))?;
    Ok(key)
}

/// Derives the logical-volume tweak key: SHA-256 over the volume master key
/// followed by the logical-volume family identifier. The XTS tweak half is
/// the first 16 bytes of the digest.
pub fn volume_tweak_key(
    volume_master_key: &[u8; 16],
    family_identifier: &[u8; 16],
) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(volume_master_key);
    hasher.update(family_identifier);
    Zeroizing::new(hasher.finalize().into())
}

/// Inflates zlib-wrapped DEFLATE data, insisting on the declared output size.
pub fn inflate(compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, Error> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut uncompressed = Vec::with_capacity(uncompressed_size);
    decoder
        .read_to_end(&mut uncompressed)
        .map_err(|_| Error::CryptoFailure("DEFLATE stream is corrupt"))?;
    if uncompressed.len() != uncompressed_size {
        return Err(Error::CryptoFailure("DEFLATE output size does not match the declared size"));
    }
    Ok(uncompressed)
}
