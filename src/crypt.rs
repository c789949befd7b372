/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::cleanup::{Cleanup, Inverse};
use crate::ensure;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::partition::{self, Settle};
use anyhow::{Context, Result};
use log::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CipherProfile {
    #[serde(rename = "type")]
    pub luks_type: String,
    pub cipher: String,
    pub key_size: u32,
    pub hash: String,
    pub pbkdf: String,
    pub sector_size: u32,
}

impl Default for CipherProfile {
    fn default() -> Self {
        CipherProfile {
            luks_type: "luks2".to_string(),
            cipher: "aes-xts-plain64".to_string(),
            key_size: 512,
            hash: "sha256".to_string(),
            pbkdf: "argon2id".to_string(),
            sector_size: 4096,
        }
    }
}

/**
 * Passphrase material.  Never printed.
 */
#[derive(Clone)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(b: Vec<u8>) -> Key {
        Key(b)
    }

    pub fn from_file(p: &Path) -> Result<Key> {
        let b = std::fs::read(p).with_context(|| format!("reading key file {}", p.display()))?;
        if b.is_empty() {
            return Err(ProvisionError::config(format!(
                "key file {} is empty",
                p.display()
            )));
        }
        Ok(Key(b))
    }

    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(<{} bytes>)", self.0.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub backing: PathBuf,
    pub profile: CipherProfile,
}

/**
 * An open encrypted volume.  The mapper name is derived from the UUID that
 * luksFormat assigned, so it cannot exist before the volume is formatted.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenVolume {
    pub backing: PathBuf,
    pub uuid: String,
    pub name: String,
}

impl OpenVolume {
    pub fn path(&self) -> PathBuf {
        mapper_path(&self.name)
    }
}

fn mapper_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{}", name))
}

pub fn mapper_name(uuid: &str) -> String {
    format!("luks-{}", uuid)
}

pub fn is_open(host: &dyn Host, name: &str) -> Result<bool> {
    Ok(host.block_device(&mapper_path(name))?.is_some())
}

/**
 * Write a LUKS header to the device and return the UUID it was given.
 */
pub fn format(host: &dyn Host, spec: &VolumeSpec, key: &Key) -> Result<String> {
    let dev = ensure::utf8(&spec.backing)?;
    let p = &spec.profile;
    let key_size = format!("--key-size={}", p.key_size);
    let sector_size = format!("--sector-size={}", p.sector_size);

    info!("FORMAT ENCRYPTED VOLUME: {} ({} {})", dev, p.luks_type, p.cipher);
    ensure::run_input(
        host,
        &[
            "cryptsetup",
            "luksFormat",
            "--batch-mode",
            "--type",
            &p.luks_type,
            "--cipher",
            &p.cipher,
            &key_size,
            "--hash",
            &p.hash,
            "--pbkdf",
            &p.pbkdf,
            &sector_size,
            "--key-file=-",
            dev,
        ],
        Some(key.bytes()),
    )?;

    let out = ensure::output(host, &["cryptsetup", "luksUUID", dev])?;
    let uuid = uuid::Uuid::parse_str(out.trim())
        .map_err(|e| {
            ProvisionError::verify(format!(
                "{} reported a bad LUKS UUID {:?}: {}",
                dev,
                out.trim(),
                e
            ))
        })?
        .as_hyphenated()
        .to_string();
    debug!("{} has LUKS UUID {}", dev, uuid);
    Ok(uuid)
}

/**
 * Format and open a volume, registering its close as soon as it is open.
 */
pub fn setup(
    host: &dyn Host,
    spec: &VolumeSpec,
    key: &Key,
    settle: &Settle,
    cleanup: &mut Cleanup,
) -> Result<OpenVolume> {
    let uuid = format(host, spec, key)?;
    let v = OpenVolume {
        backing: spec.backing.clone(),
        name: mapper_name(&uuid),
        uuid,
    };

    info!("OPEN ENCRYPTED VOLUME: {} as {}", spec.backing.display(), v.name);
    ensure::run_input(
        host,
        &[
            "cryptsetup",
            "open",
            "--type",
            "luks",
            "--allow-discards",
            "--key-file=-",
            ensure::utf8(&spec.backing)?,
            &v.name,
        ],
        Some(key.bytes()),
    )?;
    cleanup.register(
        format!("volume {}", v.name),
        Inverse::CloseVolume {
            name: v.name.clone(),
        },
    );

    /*
     * Persist the discard and workqueue flags in the LUKS2 header so that
     * the installed system opens the volume the same way.
     */
    ensure::run_input(
        host,
        &[
            "cryptsetup",
            "refresh",
            "--persistent",
            "--allow-discards",
            "--perf-no_read_workqueue",
            "--perf-no_write_workqueue",
            "--key-file=-",
            &v.name,
        ],
        Some(key.bytes()),
    )?;

    partition::wait_for_nodes(host, &[v.path()], settle)?;
    Ok(v)
}

pub fn close(host: &dyn Host, name: &str) -> Result<()> {
    if !is_open(host, name)? {
        debug!("volume {} is not open", name);
        return Ok(());
    }
    info!("CLOSE ENCRYPTED VOLUME: {}", name);
    ensure::run(host, &["cryptsetup", "close", name])
}
