/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::cleanup::{Cleanup, Inverse};
use crate::ensure;
use crate::error::ProvisionError;
use crate::host::Host;
use anyhow::Result;
use log::*;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Vfat,
    Swap,
}

impl FsKind {
    pub fn fstype(&self) -> &'static str {
        match self {
            FsKind::Ext4 => "ext4",
            FsKind::Vfat => "vfat",
            FsKind::Swap => "swap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub device: PathBuf,
    pub kind: FsKind,
    pub uuid: String,
}

pub fn uuid_of(host: &dyn Host, device: &Path) -> Result<String> {
    let out = ensure::output(
        host,
        &["blkid", "-s", "UUID", "-o", "value", ensure::utf8(&device)?],
    )?;
    let uuid = out.trim();
    if uuid.is_empty() {
        return Err(ProvisionError::verify(format!(
            "{} has no filesystem UUID",
            device.display()
        )));
    }
    Ok(uuid.to_string())
}

/**
 * Put a filesystem (or swap signature) on a device and read back its UUID.
 * On abort the signature is wiped again.
 */
pub fn make(
    host: &dyn Host,
    device: &Path,
    kind: FsKind,
    label: &str,
    cleanup: &mut Cleanup,
) -> Result<Formatted> {
    let dev = ensure::utf8(&device)?;
    info!("MAKE FILESYSTEM: {} on {} (label {})", kind.fstype(), dev, label);

    match kind {
        FsKind::Ext4 => ensure::run(host, &["mkfs.ext4", "-F", "-q", "-L", label, dev])?,
        FsKind::Vfat => ensure::run(host, &["mkfs.vfat", "-F", "32", "-n", label, dev])?,
        FsKind::Swap => ensure::run(host, &["mkswap", "-f", "-L", label, dev])?,
    }
    cleanup.register(
        format!("{} filesystem on {}", kind.fstype(), dev),
        Inverse::WipeSignatures {
            devices: vec![device.to_path_buf()],
        },
    );

    let uuid = uuid_of(host, device)?;
    debug!("{} UUID={}", dev, uuid);
    Ok(Formatted {
        device: device.to_path_buf(),
        kind,
        uuid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_uuid, FakeHost};

    #[test]
    fn formats_and_reads_uuid() {
        let host = FakeHost::new();
        let mut c = Cleanup::new(&host, Path::new("/mnt"));

        let f = make(&host, Path::new("/dev/md127"), FsKind::Vfat, "EFI", &mut c).unwrap();
        assert_eq!(f.uuid, fake_uuid("/dev/md127"));
        assert_eq!(
            host.commands(),
            vec![
                "mkfs.vfat -F 32 -n EFI /dev/md127",
                "blkid -s UUID -o value /dev/md127",
            ]
        );

        c.abort().unwrap();
        assert_eq!(host.commands_matching("wipefs"), vec!["wipefs --all /dev/md127"]);
    }

    #[test]
    fn failed_mkfs_registers_nothing() {
        let host = FakeHost::new();
        host.fail_on("mkswap");
        let mut c = Cleanup::new(&host, Path::new("/mnt"));
        assert!(make(&host, Path::new("/dev/md125"), FsKind::Swap, "swap", &mut c).is_err());
        assert!(c.state().is_empty());
        c.commit().unwrap();
    }
}
