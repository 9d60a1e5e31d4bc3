// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Unwrapped key material for one logical volume, zeroed on drop.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// The keys recovered by the unwrap chain.
///
/// The volume master key doubles as the AES-XTS data key; the tweak key is
/// derived from it and the logical-volume family identifier, of which only
/// the first 16 bytes enter the cipher.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct Keyring {
    volume_master_key: [u8; 16],
    volume_tweak_key: [u8; 32],
}

impl Keyring {
    pub fn new(volume_master_key: [u8; 16], volume_tweak_key: [u8; 32]) -> Self {
        Self {
            volume_master_key,
            volume_tweak_key,
        }
    }

    pub fn volume_master_key(&self) -> &[u8; 16] {
        &self.volume_master_key
    }

    pub fn volume_tweak_key(&self) -> &[u8; 32] {
        &self.volume_tweak_key
    }

    /// The 128-bit halves fed to AES-XTS for sector decryption.
    pub(crate) fn xts_key_pair(&self) -> (&[u8; 16], [u8; 16]) {
        let mut tweak_half = [0u8; 16];
        tweak_half.copy_from_slice(&self.volume_tweak_key[..16]);
        (&self.volume_master_key, tweak_half)
    }
}

impl std::fmt::Debug for Keyring {
    // Key material never reaches log output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Keyring { .. }")
    }
}
