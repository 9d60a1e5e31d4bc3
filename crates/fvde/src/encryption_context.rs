// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Encryption context plist and the key unwrap chain
//!
//! The wrapping records for a volume family live in an XML property list,
//! either reassembled out of the encrypted metadata or supplied as an
//! out-of-band `EncryptedRoot.plist` file (itself AES-XTS encrypted under
//! the physical volume's key data). Each `CryptoUsers` entry wraps the
//! key-encrypting key under a passphrase-derived key; `WrappedVolumeKeys`
//! holds the volume master key wrapped under that KEK.

use std::io::Read;

use serde::de::DeserializeOwned;
use zeroize::Zeroizing;

use crate::bytes::le_u32;
use crate::crypto::{self, XtsContext, KEY_WRAP_IV};
use crate::Error;

/// Dictionary key the context may be nested under in EncryptedRoot.plist
const CONTEXT_KEY: &str = "com.apple.corestorage.lvf.encryption.context";

/// Fixed size of a PassphraseWrappedKEKStruct blob
const PASSPHRASE_WRAPPED_KEK_SIZE: usize = 284;

/// Fixed size of a KEKWrappedVolumeKeyStruct blob
const KEK_WRAPPED_VOLUME_KEY_SIZE: usize = 256;

/// Wraps a bare `<dict>` fragment (the NUL-terminated, envelope-free form
/// the metadata blocks store) into a parseable plist document.
fn plist_document(xml: &[u8]) -> Vec<u8> {
    let end = xml.iter().position(|&byte| byte == 0).unwrap_or(xml.len());
    let xml = &xml[..end];

    let mut document = Vec::with_capacity(xml.len() + 48);
    if xml.starts_with(b"<?xml") || xml.starts_with(b"<plist") {
        document.extend_from_slice(xml);
    } else {
        document.extend_from_slice(b"<plist version=\"1.0\">");
        document.extend_from_slice(xml);
        document.extend_from_slice(b"</plist>");
    }
    document
}

/// Deserializes a dict fragment into a typed structure.
pub(crate) fn from_dict_fragment<T: DeserializeOwned>(xml: &[u8]) -> Result<T, Error> {
    plist::from_bytes(&plist_document(xml))
        .map_err(|_| Error::InvalidValue("malformed XML property list"))
}

/// Parsed encryption context of one logical volume family
#[derive(Debug)]
pub struct EncryptionContextPlist {
    conversion_info: Option<plist::Value>,
    /// PassphraseWrappedKEKStruct blob per crypto user
    crypto_users: Vec<Option<Vec<u8>>>,
    /// KEKWrappedVolumeKeyStruct blob per wrapped-volume-key entry
    wrapped_volume_keys: Vec<Option<Vec<u8>>>,
}

/// Extracts one named data blob from each dictionary of an array property.
fn data_entries(dictionary: &plist::Dictionary, array_key: &str, blob_key: &str) -> Vec<Option<Vec<u8>>> {
    dictionary
        .get(array_key)
        .and_then(plist::Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    entry
                        .as_dictionary()
                        .and_then(|entry| entry.get(blob_key))
                        .and_then(plist::Value::as_data)
                        .map(<[u8]>::to_vec)
                })
                .collect()
        })
        .unwrap_or_default()
}

impl EncryptionContextPlist {
    /// Parses plaintext XML, descending into the nested context dictionary
    /// when present.
    pub fn from_data(xml: &[u8]) -> Result<Self, Error> {
        let root = plist::Value::from_reader_xml(&plist_document(xml)[..])
            .map_err(|_| Error::InvalidValue("malformed XML property list"))?;

        let context = root
            .as_dictionary()
            .and_then(|dictionary| dictionary.get(CONTEXT_KEY))
            .unwrap_or(&root)
            .as_dictionary()
            .ok_or(Error::InvalidValue("encryption context is not a dictionary"))?;

        let plist = Self {
            conversion_info: context.get("ConversionInfo").cloned(),
            crypto_users: data_entries(context, "CryptoUsers", "PassphraseWrappedKEKStruct"),
            wrapped_volume_keys: data_entries(
                context,
                "WrappedVolumeKeys",
                "KEKWrappedVolumeKeyStruct",
            ),
        };
        log::debug!(
            "encryption context: {} crypto users, {} wrapped volume keys",
            plist.crypto_users.len(),
            plist.wrapped_volume_keys.len()
        );
        Ok(plist)
    }

    /// Reads and decrypts an out-of-band `EncryptedRoot.plist` file.
    ///
    /// The whole file is one XTS block at sector 0, keyed with the 128-bit
    /// half of the physical volume's key data and an all-zero tweak key.
    pub fn from_encrypted_file<R: Read>(reader: &mut R, key_data: &[u8; 128]) -> Result<Self, Error> {
        let mut ciphertext = Vec::new();
        reader.read_to_end(&mut ciphertext)?;
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(Error::InvalidValue("encrypted plist size"));
        }

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_data[..16]);
        let context = XtsContext::new(&key, &[0u8; 16]);
        let mut plaintext = Zeroizing::new(ciphertext);
        let length = plaintext.len();
        context.decrypt_sectors(&mut plaintext, length, 0)?;

        if !plaintext.starts_with(b"<?xml") {
            return Err(Error::InvalidValue("decrypted plist is not XML"));
        }
        log::debug!("decrypted EncryptedRoot.plist ({length} bytes)");
        Self::from_data(&plaintext)
    }

    pub fn number_of_crypto_users(&self) -> usize {
        self.crypto_users.len()
    }

    /// Conversion state dictionary, retained for inspection
    pub fn conversion_info(&self) -> Option<&plist::Value> {
        self.conversion_info.as_ref()
    }

    /// The passphrase-wrapped KEK blob of crypto user `index`.
    fn passphrase_wrapped_kek(&self, index: usize) -> Option<&[u8]> {
        self.crypto_users.get(index)?.as_deref()
    }

    /// The KEK-wrapped volume master key blob (`WrappedVolumeKeys[1]`).
    fn kek_wrapped_volume_key(&self) -> Result<&[u8], Error> {
        self.wrapped_volume_keys
            .get(1)
            .and_then(|entry| entry.as_deref())
            .ok_or(Error::ValueMissing("KEK wrapped volume key"))
    }

    /// Runs the passphrase to KEK to volume-master-key unwrap chain.
    ///
    /// Every crypto user is tried in order; an unwrap whose integrity value
    /// does not recover just means this user's salt does not belong to the
    /// passphrase. Returns `Ok(None)` when no user matches.
    pub(crate) fn find_volume_master_key(
        &self,
        passphrase: &[u8],
    ) -> Result<Option<Zeroizing<[u8; 16]>>, Error> {
        let mut kek: Option<Zeroizing<[u8; 16]>> = None;

        for index in 0..self.crypto_users.len() {
            let Some(wrapped_kek) = self.passphrase_wrapped_kek(index) else {
                continue;
            };
            if wrapped_kek.len() != PASSPHRASE_WRAPPED_KEK_SIZE {
                return Err(Error::OutOfBounds("passphrase wrapped KEK size"));
            }

            let salt_type = le_u32(wrapped_kek, 0)
                .ok_or(Error::OutOfBounds("passphrase wrapped KEK"))?;
            let salt_size = le_u32(wrapped_kek, 4)
                .ok_or(Error::OutOfBounds("passphrase wrapped KEK"))?;
            if salt_type != 3 || salt_size != 16 {
                return Err(Error::UnsupportedValue("passphrase salt record"));
            }
            let salt = &wrapped_kek[8..24];

            let kek_type = le_u32(wrapped_kek, 24)
                .ok_or(Error::OutOfBounds("passphrase wrapped KEK"))?;
            let kek_size = le_u32(wrapped_kek, 28)
                .ok_or(Error::OutOfBounds("passphrase wrapped KEK"))?;
            if kek_type != 16 || kek_size != 24 {
                return Err(Error::UnsupportedValue("wrapped KEK record"));
            }
            let iterations = le_u32(wrapped_kek, 168)
                .ok_or(Error::OutOfBounds("passphrase wrapped KEK"))?;

            let passphrase_key = crypto::passphrase_key(passphrase, salt, iterations)?;
            let unwrapped = crypto::aes_key_unwrap(&passphrase_key, &wrapped_kek[32..56])?;

            if unwrapped[..8] == KEY_WRAP_IV {
                log::debug!("passphrase matched crypto user {index}");
                let mut recovered = Zeroizing::new([0u8; 16]);
                recovered.copy_from_slice(&unwrapped[8..24]);
                kek = Some(recovered);
                break;
            }
            log::trace!("crypto user {index} did not match");
        }

        let Some(kek) = kek else {
            return Ok(None);
        };

        let kek_wrapped_volume_key = self.kek_wrapped_volume_key()?;
        if kek_wrapped_volume_key.len() != KEK_WRAPPED_VOLUME_KEY_SIZE {
            return Err(Error::OutOfBounds("KEK wrapped volume key size"));
        }

        let unwrapped = crypto::aes_key_unwrap(&kek, &kek_wrapped_volume_key[8..32])?;
        if unwrapped[..8] != KEY_WRAP_IV {
            return Err(Error::CryptoFailure("volume master key integrity value"));
        }

        let mut volume_master_key = Zeroizing::new([0u8; 16]);
        volume_master_key.copy_from_slice(&unwrapped[8..24]);
        Ok(Some(volume_master_key))
    }
}
