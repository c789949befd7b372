/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

//! Boot-time tables written into the installed system.

use crate::cleanup::{Cleanup, Inverse};
use crate::crypt::OpenVolume;
use crate::ensure;
use crate::format::{Formatted, FsKind};
use anyhow::Result;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub uuid: String,
    pub mountpoint: String,
    pub fstype: String,
    pub options: String,
    pub dump: u8,
    pub pass: u8,
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UUID={}\t{}\t{}\t{}\t{}\t{}",
            self.uuid, self.mountpoint, self.fstype, self.options, self.dump, self.pass
        )
    }
}

impl FstabEntry {
    pub fn for_filesystem(fs: &Formatted, mountpoint: &str) -> FstabEntry {
        let (options, pass) = match fs.kind {
            FsKind::Ext4 => ("defaults", 2),
            FsKind::Vfat => ("umask=0077,shortname=winnt", 2),
            FsKind::Swap => ("defaults", 0),
        };
        FstabEntry {
            uuid: fs.uuid.clone(),
            mountpoint: match fs.kind {
                FsKind::Swap => "none".to_string(),
                _ => mountpoint.to_string(),
            },
            fstype: fs.kind.fstype().to_string(),
            options: options.to_string(),
            dump: 0,
            pass,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub name: String,
    pub uuid: String,
    pub keyfile: String,
    pub options: String,
}

impl From<&OpenVolume> for CrypttabEntry {
    fn from(v: &OpenVolume) -> Self {
        CrypttabEntry {
            name: v.name.clone(),
            uuid: v.uuid.clone(),
            keyfile: "none".to_string(),
            options: "luks,discard".to_string(),
        }
    }
}

impl fmt::Display for CrypttabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} UUID={} {} {}",
            self.name, self.uuid, self.keyfile, self.options
        )
    }
}

/*
 * The datasets are mounted by ZFS itself and do not appear here.
 */
pub fn render_fstab(entries: &[FstabEntry]) -> String {
    let mut s = String::from("# <file system>\t<mount point>\t<type>\t<options>\t<dump>\t<pass>\n");
    for e in entries.iter() {
        s += &format!("{}\n", e);
    }
    s
}

pub fn render_crypttab(entries: &[CrypttabEntry]) -> String {
    let mut s = String::from("# <name> <device> <password> <options>\n");
    for e in entries.iter() {
        s += &format!("{}\n", e);
    }
    s
}

/**
 * Write a file below the installation root and register its removal.
 */
pub fn install(root: &Path, rel: &str, contents: &str, cleanup: &mut Cleanup) -> Result<()> {
    let dst = root.join(rel);
    if let Some(dir) = dst.parent() {
        ensure::directory(dir, 0o755)?;
    }
    ensure::filestr(contents, &dst, 0o644)?;
    cleanup.register(format!("write /{}", rel), Inverse::RemoveFile { path: dst });
    Ok(())
}
