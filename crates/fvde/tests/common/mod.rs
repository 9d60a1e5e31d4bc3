// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Synthetic Core Storage image builders for the end-to-end tests.
//!
//! Everything here authors the on-disk structures the library reads:
//! sealed metadata blocks, plaintext and encrypted metadata regions, the
//! encryption context plist with its wrapped keys, and encrypted logical
//! volume payload sectors.

use std::io::Write;

use fvde::checksum;
use fvde::crypto::{aes_key_wrap, passphrase_key, volume_tweak_key, XtsContext};
use fvde::metadata_block::{BLOCK_SIZE, HEADER_SIZE};

pub const PASSPHRASE: &str = "equal-rites";
pub const RECOVERY_PASSPHRASE: &str = "AAAA-BBBB-CCCC-DDDD-EEEE-FFFF";
pub const VOLUME_MASTER_KEY: [u8; 16] = [0x42u8; 16];
pub const KEK: [u8; 16] = [0x13u8; 16];
pub const KEY_DATA_BYTE: u8 = 0x7f;
pub const LV_FAMILY_UUID: &str = "6ae6d6ad-45a7-4e2c-832a-f00ddf7804e7";
pub const LV_UUID: &str = "7fab36c0-1f95-4b31-a7a6-8904e7d6e352";
pub const LV_NAME: &str = "Macintosh HD";

/// 8 mapped sectors starting at physical sector 400, then a one-sector hole
/// at the tail of the logical space.
pub const LV_SIZE: u64 = 9 * 512;
pub const LV_MAPPED_SECTORS: u64 = 8;
pub const LV_PHYSICAL_SECTOR: u64 = 400;

/// Writes the 64-byte block header and seals the Fletcher checksum.
pub fn seal_block(
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
    let block_len = block.len() as u32;
    block[48..52].copy_from_slice(&block_len.to_le_bytes());
    let value = checksum::fletcher(&block[8..], initial_value);
    block[..4].copy_from_slice(&value.to_le_bytes());
}

/// Builds a sealed 8192-byte block around `payload`.
pub fn sealed_block(
    block_type: u16,
    object_identifier: u64,
    block_number: u64,
    payload: &[u8],
) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    seal_block(&mut block, block_type, 1000, object_identifier, block_number);
    block
}

pub fn key_data() -> [u8; 128] {
    let mut key_data = [0u8; 128];
    key_data[..32].fill(KEY_DATA_BYTE);
    key_data
}

/// The 512-byte physical volume header.
pub fn build_header(metadata_block_numbers: [u64; 4]) -> Vec<u8> {
    let mut bytes = vec![0u8; 512];
    bytes[4..8].copy_from_slice(&0xffff_ffffu32.to_le_bytes());
    bytes[8..10].copy_from_slice(&1u16.to_le_bytes());
    bytes[10..12].copy_from_slice(&0x0010u16.to_le_bytes());
    bytes[12..16].copy_from_slice(&0x1000_0001u32.to_le_bytes());
    bytes[48..52].copy_from_slice(&512u32.to_le_bytes());
    bytes[64..72].copy_from_slice(&(1u64 << 24).to_le_bytes());
    bytes[88..90].copy_from_slice(b"CS");
    bytes[90..94].copy_from_slice(&1u32.to_le_bytes());
    bytes[96..100].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    bytes[100..104].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    for (index, number) in metadata_block_numbers.iter().enumerate() {
        let offset = 104 + index * 8;
        bytes[offset..offset + 8].copy_from_slice(&number.to_le_bytes());
    }
    bytes[168..172].copy_from_slice(&16u32.to_le_bytes());
    bytes[172..176].copy_from_slice(&2u32.to_le_bytes());
    bytes[176..304].copy_from_slice(&key_data());
    bytes[304..320].copy_from_slice(&[0x22u8; 16]);
    bytes[320..336].copy_from_slice(&[0x33u8; 16]);
    let value = checksum::fletcher(&bytes[8..], 0xffff_ffff);
    bytes[..4].copy_from_slice(&value.to_le_bytes());
    bytes
}

/// A type 0x0011 volume group directory payload.
pub fn build_directory_payload(
    encrypted_metadata_size: u64,
    encrypted_block_numbers: (u64, u64),
) -> Vec<u8> {
    let mut payload = vec![0u8; 224];
    payload[0..4].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    payload[32..40].copy_from_slice(&0x10000u64.to_le_bytes());
    payload[44..48].copy_from_slice(&512u32.to_le_bytes());
    payload[48..52].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    payload[52..56].copy_from_slice(&0x1000_0001u32.to_le_bytes());
    payload[56..64].copy_from_slice(&encrypted_metadata_size.to_le_bytes());
    payload[80..88].copy_from_slice(&encrypted_block_numbers.0.to_le_bytes());
    payload[88..96].copy_from_slice(&encrypted_block_numbers.1.to_le_bytes());
    // No directory entries; one physical volume in the roster.
    payload[192..196].copy_from_slice(&1u32.to_le_bytes());
    payload[200..216].copy_from_slice(&[0x22u8; 16]);
    payload[216..224].copy_from_slice(&(1u64 << 24).to_le_bytes());
    payload
}

/// A type 0x0010 physical volume descriptor payload (header mirror at +8).
pub fn build_pv_descriptor_payload() -> Vec<u8> {
    let mut payload = vec![0u8; 344];
    payload[16..18].copy_from_slice(&1u16.to_le_bytes());
    payload[18..20].copy_from_slice(&0x0010u16.to_le_bytes());
    payload[56..60].copy_from_slice(&512u32.to_le_bytes());
    payload[72..80].copy_from_slice(&(1u64 << 24).to_le_bytes());
    payload[96..98].copy_from_slice(b"CS");
    payload[98..102].copy_from_slice(&1u32.to_le_bytes());
    payload[104..108].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    payload[108..112].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    payload[176..180].copy_from_slice(&16u32.to_le_bytes());
    payload[180..184].copy_from_slice(&2u32.to_le_bytes());
    payload[184..312].copy_from_slice(&key_data());
    payload[312..328].copy_from_slice(&[0x22u8; 16]);
    payload[328..344].copy_from_slice(&[0x33u8; 16]);
    payload
}

/// A type 0x0105 logical volume roster payload.
pub fn build_roster_payload(object_identifiers: &[u64]) -> Vec<u8> {
    let mut payload = vec![0u8; 8 + object_identifiers.len() * 16];
    payload[0..4].copy_from_slice(&(object_identifiers.len() as u32).to_le_bytes());
    for (index, identifier) in object_identifiers.iter().enumerate() {
        let offset = 8 + index * 16;
        payload[offset..offset + 8].copy_from_slice(&identifier.to_le_bytes());
    }
    payload
}

/// A type 0x001a logical volume update payload with inline XML.
pub fn build_lv_update_payload(object_identifier: u64) -> Vec<u8> {
    let xml = format!(
        "<dict>\
         <key>com.apple.corestorage.lv.familyUUID</key><string>{LV_FAMILY_UUID}</string>\
         <key>com.apple.corestorage.lv.name</key><string>{LV_NAME}</string>\
         <key>com.apple.corestorage.lv.size</key><integer>{LV_SIZE}</integer>\
         <key>com.apple.corestorage.lv.uuid</key><string>{LV_UUID}</string>\
         </dict>"
    );
    let xml = xml.as_bytes();

    let xml_offset = 72usize;
    let mut payload = vec![0u8; xml_offset + xml.len()];
    payload[0..8].copy_from_slice(&object_identifier.to_le_bytes());
    payload[56..60].copy_from_slice(&(xml.len() as u32).to_le_bytes());
    payload[60..64].copy_from_slice(&(xml.len() as u32).to_le_bytes());
    payload[64..68].copy_from_slice(&((xml_offset + HEADER_SIZE) as u32).to_le_bytes());
    payload[68..72].copy_from_slice(&(xml.len() as u32).to_le_bytes());
    payload[xml_offset..].copy_from_slice(xml);
    payload
}

/// A type 0x0304/0x0305 segment map payload.
pub fn build_segment_map_payload(entries: &[(i64, u32, u16, u64)]) -> Vec<u8> {
    let mut payload = vec![0u8; 8 + entries.len() * 40];
    payload[0..4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    for (index, (logical, blocks, volume, physical)) in entries.iter().enumerate() {
        let offset = 8 + index * 40;
        payload[offset + 8..offset + 16].copy_from_slice(&logical.to_le_bytes());
        payload[offset + 16..offset + 20].copy_from_slice(&blocks.to_le_bytes());
        let packed = (u64::from(*volume) << 48) | physical;
        payload[offset + 32..offset + 40].copy_from_slice(&packed.to_le_bytes());
    }
    payload
}

/// A type 0x0505 base block payload.
pub fn build_base_block_payload(base_physical_block: u64) -> Vec<u8> {
    let mut payload = vec![0u8; 24];
    payload[0..4].copy_from_slice(&1u32.to_le_bytes());
    payload[16..24].copy_from_slice(&base_physical_block.to_le_bytes());
    payload
}

/// A type 0x0019 first-chunk payload.
pub fn build_plist_head_payload(
    next_object_identifier: u64,
    compressed_size: usize,
    uncompressed_size: usize,
    chunk: &[u8],
) -> Vec<u8> {
    let xml_offset = 80usize;
    let mut payload = vec![0u8; xml_offset + chunk.len()];
    payload[32..40].copy_from_slice(&next_object_identifier.to_le_bytes());
    payload[40..44].copy_from_slice(&(compressed_size as u32).to_le_bytes());
    payload[44..48].copy_from_slice(&(uncompressed_size as u32).to_le_bytes());
    payload[48..52].copy_from_slice(&((xml_offset + HEADER_SIZE) as u32).to_le_bytes());
    payload[52..56].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
    payload[xml_offset..].copy_from_slice(chunk);
    payload
}

/// A type 0x0024 continuation payload.
pub fn build_plist_chunk_payload(next_object_identifier: u64, chunk: &[u8]) -> Vec<u8> {
    let mut payload = vec![0u8; 16 + chunk.len()];
    payload[0..8].copy_from_slice(&next_object_identifier.to_le_bytes());
    payload[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
    payload[16..].copy_from_slice(chunk);
    payload
}

/// A 284-byte PassphraseWrappedKEKStruct.
pub fn build_passphrase_wrapped_kek(passphrase: &str, salt: [u8; 16], kek: &[u8; 16]) -> Vec<u8> {
    let iterations = 1000u32;
    let mut blob = vec![0u8; 284];
    blob[0..4].copy_from_slice(&3u32.to_le_bytes());
    blob[4..8].copy_from_slice(&16u32.to_le_bytes());
    blob[8..24].copy_from_slice(&salt);
    blob[24..28].copy_from_slice(&16u32.to_le_bytes());
    blob[28..32].copy_from_slice(&24u32.to_le_bytes());
    let derived = passphrase_key(passphrase.as_bytes(), &salt, iterations).unwrap();
    let wrapped = aes_key_wrap(&derived, kek).unwrap();
    blob[32..56].copy_from_slice(&wrapped);
    blob[168..172].copy_from_slice(&iterations.to_le_bytes());
    blob
}

/// A 256-byte KEKWrappedVolumeKeyStruct.
pub fn build_kek_wrapped_volume_key(kek: &[u8; 16], volume_master_key: &[u8; 16]) -> Vec<u8> {
    let mut blob = vec![0u8; 256];
    let wrapped = aes_key_wrap(kek, volume_master_key).unwrap();
    blob[8..32].copy_from_slice(&wrapped);
    blob
}

/// Serializes the encryption context as the bare `<dict>` fragment the
/// metadata stores (no XML declaration, no plist document element).
pub fn build_context_fragment(passphrase_wrapped_keks: &[Vec<u8>]) -> Vec<u8> {
    let document = build_context_document(passphrase_wrapped_keks, false);
    let start = document
        .windows(5)
        .position(|window| window == b"<dict")
        .expect("serialized plist contains a dict");
    let end = document
        .windows(7)
        .rposition(|window| window == b"</dict>")
        .expect("serialized plist contains a dict close");
    document[start..end + 7].to_vec()
}

/// Serializes a full XML plist document, optionally nesting the context
/// under its EncryptedRoot.plist dictionary key.
pub fn build_context_document(passphrase_wrapped_keks: &[Vec<u8>], nested: bool) -> Vec<u8> {
    let mut context = plist::Dictionary::new();
    context.insert(
        "ConversionInfo".into(),
        plist::Value::Dictionary(plist::Dictionary::new()),
    );
    context.insert(
        "CryptoUsers".into(),
        plist::Value::Array(
            passphrase_wrapped_keks
                .iter()
                .map(|blob| {
                    let mut user = plist::Dictionary::new();
                    user.insert(
                        "PassphraseWrappedKEKStruct".into(),
                        plist::Value::Data(blob.clone()),
                    );
                    plist::Value::Dictionary(user)
                })
                .collect(),
        ),
    );
    context.insert(
        "WrappedVolumeKeys".into(),
        plist::Value::Array(vec![
            plist::Value::Dictionary(plist::Dictionary::new()),
            plist::Value::Dictionary({
                let mut entry = plist::Dictionary::new();
                entry.insert(
                    "KEKWrappedVolumeKeyStruct".into(),
                    plist::Value::Data(build_kek_wrapped_volume_key(&KEK, &VOLUME_MASTER_KEY)),
                );
                entry
            }),
        ]),
    );

    let root = if nested {
        let mut outer = plist::Dictionary::new();
        outer.insert(
            "com.apple.corestorage.lvf.encryption.context".into(),
            plist::Value::Dictionary(context),
        );
        plist::Value::Dictionary(outer)
    } else {
        plist::Value::Dictionary(context)
    };

    let mut xml = Vec::new();
    plist::to_writer_xml(&mut xml, &root).unwrap();
    xml
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// The deterministic plaintext of the test logical volume.
pub fn logical_volume_plaintext() -> Vec<u8> {
    let mut plaintext = vec![0u8; LV_MAPPED_SECTORS as usize * 512];
    for (index, byte) in plaintext.iter_mut().enumerate() {
        *byte = (index * 31 % 251) as u8;
    }
    plaintext
}

/// Options for [`build_image`].
pub struct ImageOptions {
    /// CryptoUser blobs embedded in the metadata plist
    pub crypto_users: Vec<Vec<u8>>,
    /// Store the context plist compressed across a 0x0019/0x0024 chain
    pub compressed_plist: bool,
    /// Transaction identifiers of the two populated plaintext regions
    pub plaintext_transactions: (u64, u64),
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            crypto_users: vec![build_passphrase_wrapped_kek(PASSPHRASE, [0x01; 16], &KEK)],
            compressed_plist: false,
            plaintext_transactions: (1000, 1000),
        }
    }
}

/// Assembles a complete single-physical-volume Core Storage image.
///
/// Layout (in 8192-byte metadata blocks): header in block 0, plaintext
/// regions at blocks 1 and 2, the encrypted metadata region at block 4
/// spanning 10 blocks, and the logical volume payload at 512-byte sector
/// 400 onward.
pub fn build_image(options: &ImageOptions) -> Vec<u8> {
    let region_blocks = 10u64;
    let mut image = vec![0u8; 64 * BLOCK_SIZE];

    image[..512].copy_from_slice(&build_header([1, 2, 1, 2]));

    // Plaintext metadata regions.
    let directory = build_directory_payload(region_blocks * BLOCK_SIZE as u64, (4, 4));
    for (region_index, transaction) in [
        options.plaintext_transactions.0,
        options.plaintext_transactions.1,
    ]
    .into_iter()
    .enumerate()
    {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[HEADER_SIZE..HEADER_SIZE + directory.len()].copy_from_slice(&directory);
        seal_block(&mut block, 0x0011, transaction, 0, 0);
        let offset = (1 + region_index) * BLOCK_SIZE;
        image[offset..offset + BLOCK_SIZE].copy_from_slice(&block);
    }

    // Encrypted metadata region at block 4.
    let object_identifier = 0x500u64;
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    blocks.push(sealed_block(0x0010, 1, 0, &build_pv_descriptor_payload()));
    blocks.push(sealed_block(
        0x0105,
        2,
        1,
        &build_roster_payload(&[object_identifier]),
    ));
    blocks.push(sealed_block(
        0x001a,
        object_identifier,
        2,
        &build_lv_update_payload(object_identifier),
    ));
    blocks.push(sealed_block(
        0x0305,
        0x3050,
        3,
        &build_segment_map_payload(&[(
            0,
            LV_MAPPED_SECTORS as u32,
            0,
            LV_PHYSICAL_SECTOR,
        )]),
    ));
    blocks.push(sealed_block(0x0505, 0x5050, 4, &build_base_block_payload(0)));

    let fragment = build_context_fragment(&options.crypto_users);
    if options.compressed_plist {
        let compressed = deflate(&fragment);
        let split = compressed.len() / 3;
        blocks.push(sealed_block(
            0x0019,
            0x1900,
            5,
            &build_plist_head_payload(0x2400, compressed.len(), fragment.len(), &compressed[..split]),
        ));
        let second = split + (compressed.len() - split) / 2;
        blocks.push(sealed_block(
            0x0024,
            0x2400,
            6,
            &build_plist_chunk_payload(0x2401, &compressed[split..second]),
        ));
        blocks.push(sealed_block(
            0x0024,
            0x2401,
            7,
            &build_plist_chunk_payload(0, &compressed[second..]),
        ));
    } else {
        blocks.push(sealed_block(
            0x0019,
            0x1900,
            5,
            &build_plist_head_payload(0, fragment.len(), fragment.len(), &fragment),
        ));
    }

    let context = XtsContext::new(&[KEY_DATA_BYTE; 16], &[KEY_DATA_BYTE; 16]);
    let region_base = 4 * BLOCK_SIZE;
    for (index, block) in blocks.iter().enumerate() {
        let mut encrypted = block.clone();
        context
            .encrypt_sectors(&mut encrypted, BLOCK_SIZE, index as u64)
            .unwrap();
        let offset = region_base + index * BLOCK_SIZE;
        image[offset..offset + BLOCK_SIZE].copy_from_slice(&encrypted);
    }
    // The remaining blocks of the region stay zero: the terminator.

    // Logical volume payload, encrypted with the derived XTS pair and the
    // absolute physical sector number as tweak.
    let family = *uuid::Uuid::parse_str(LV_FAMILY_UUID).unwrap().as_bytes();
    let tweak_key = volume_tweak_key(&VOLUME_MASTER_KEY, &family);
    let mut tweak_half = [0u8; 16];
    tweak_half.copy_from_slice(&tweak_key[..16]);
    let cipher = XtsContext::new(&VOLUME_MASTER_KEY, &tweak_half);

    let mut payload = logical_volume_plaintext();
    cipher
        .encrypt_sectors(&mut payload, 512, LV_PHYSICAL_SECTOR)
        .unwrap();
    let offset = LV_PHYSICAL_SECTOR as usize * 512;
    image[offset..offset + payload.len()].copy_from_slice(&payload);

    image
}
