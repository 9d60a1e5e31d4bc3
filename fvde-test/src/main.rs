// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::env;
use std::fs::File;
use std::io::{Read, Seek};

use log::{debug, info};

use fvde::Volume;

/// Prints the volume group layout and, when key material is available,
/// the first bytes of every unlockable logical volume.
fn inspect_volume<R>(
    volume: &Volume<R>,
    passphrase: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>>
where
    R: Read + Seek,
{
    let header = volume.header();
    info!(
        "physical volume {} ({} bytes)",
        header.physical_volume_identifier_string(),
        header.physical_volume_size()
    );
    info!("volume group {}", header.volume_group_identifier_string());
    if let Some(name) = volume.volume_group_name() {
        info!("volume group name: {name}");
    }

    for (index, descriptor) in volume.logical_volume_descriptors().iter().enumerate() {
        info!(
            "logical volume {index}: {} {:?} ({} bytes, {} segments)",
            descriptor.identifier_string(),
            descriptor.name().unwrap_or("<unnamed>"),
            descriptor.size(),
            descriptor.segments().count(),
        );

        if !volume.has_encryption_context() {
            info!("logical volume {index}: no encryption context, staying locked");
            continue;
        }

        let mut handle = volume.logical_volume(index)?;
        if let Some(passphrase) = passphrase {
            handle.set_passphrase(passphrase);
        }
        if !handle.unlock()? {
            info!("logical volume {index} stays locked (no matching passphrase)");
            continue;
        }

        let mut first_sector = [0u8; 512];
        let count = handle.read_at(0, &mut first_sector)?;
        debug!(
            "logical volume {index}: first {count} bytes: {:02x?}...",
            &first_sector[..16.min(count)]
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let mut arguments = env::args().skip(1);
    let Some(image_path) = arguments.next() else {
        eprintln!("usage: fvde-test <image> [passphrase] [EncryptedRoot.plist]");
        std::process::exit(1);
    };
    let passphrase = arguments.next();
    let plist_path = arguments.next();

    info!("opening {image_path}");
    let image = File::open(&image_path)?;
    let mut volume = Volume::open(image)?;

    if let Some(plist_path) = plist_path {
        info!("loading {plist_path}");
        let mut plist_file = File::open(&plist_path)?;
        volume.set_encrypted_root_plist(&mut plist_file)?;
    }

    inspect_volume(&volume, passphrase.as_deref())?;
    Ok(())
}
