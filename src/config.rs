/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::crypt::CipherProfile;
use crate::error::ProvisionError;
use crate::partition::Settle;
use crate::plan::{LayoutPolicy, MIB};
use crate::pool::{Redundancy, TreeOptions};
use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/**
 * An installation profile, read from a JSON file.  Everything is optional;
 * the accessors supply the defaults.
 */
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub pool: Option<String>,
    pub redundancy: Option<Redundancy>,
    pub ashift: Option<u8>,
    pub efi_mib: Option<u64>,
    pub boot_mib: Option<u64>,
    pub swap_gib: Option<u64>,
    pub encrypt: Option<bool>,
    pub cipher: Option<CipherProfile>,
    pub data: Option<bool>,
    pub vm: Option<bool>,
    pub home_quota: Option<String>,
    pub data_quota: Option<String>,
    pub settle_ms: Option<u64>,
    pub settle_attempts: Option<u32>,
}

impl Profile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Profile> {
        let path = path.as_ref();
        let f = std::fs::File::open(path).map_err(|e| {
            ProvisionError::config(format!("profile {}: {}", path.display(), e))
        })?;
        serde_json::from_reader(f)
            .map_err(|e| ProvisionError::config(format!("profile {}: {}", path.display(), e)))
    }

    pub fn pool(&self) -> &str {
        self.pool.as_deref().unwrap_or("rpool")
    }

    pub fn ashift(&self) -> u8 {
        /*
         * Default to 4K sectors even on disks that claim 512: many of them
         * lie, and the ashift of a vdev cannot be changed later.
         */
        self.ashift.unwrap_or(12)
    }

    pub fn redundancy(&self) -> Redundancy {
        self.redundancy.unwrap_or_default()
    }

    pub fn swap_gib(&self) -> u64 {
        self.swap_gib.unwrap_or(4)
    }

    pub fn encrypt(&self) -> bool {
        self.encrypt.unwrap_or(false)
    }

    pub fn cipher(&self) -> CipherProfile {
        self.cipher.clone().unwrap_or_default()
    }

    pub fn settle(&self) -> Settle {
        let d = Settle::default();
        Settle {
            delay: self.settle_ms.map(Duration::from_millis).unwrap_or(d.delay),
            attempts: self.settle_attempts.unwrap_or(d.attempts),
        }
    }

    pub fn tree(&self) -> TreeOptions {
        TreeOptions {
            data: self.data.unwrap_or(false),
            vm: self.vm.unwrap_or(false),
            home_quota: self.home_quota.clone(),
            data_quota: self.data_quota.clone(),
        }
    }
}

/**
 * The settings for one run, after the command line has been laid over the
 * profile.
 */
#[derive(Debug, Clone)]
pub struct Settings {
    pub disks: Vec<String>,
    pub hostname: String,
    pub username: String,
    pub root: PathBuf,
    pub pool: String,
    pub redundancy: Redundancy,
    pub ashift: u8,
    pub layout: LayoutPolicy,
    pub encrypt: bool,
    pub keyfile: Option<PathBuf>,
    pub cipher: CipherProfile,
    pub tree: TreeOptions,
    pub settle: Settle,
    pub template_root: Option<PathBuf>,
    pub yes: bool,
}

/*
 * Sizes come from the operator; one that does not fit in a u64 byte count is
 * a configuration error, not a wrapped value.
 */
fn bytes(what: &str, n: u64, unit: u64) -> Result<u64> {
    n.checked_mul(unit)
        .ok_or_else(|| ProvisionError::config(format!("{} of {} is too large", what, n)))
}

impl Settings {
    pub fn from_profile(p: &Profile) -> Result<Settings> {
        let d = LayoutPolicy::default();
        Ok(Settings {
            disks: Vec::new(),
            hostname: p.hostname.clone().unwrap_or_default(),
            username: p.username.clone().unwrap_or_default(),
            root: PathBuf::from("/mnt"),
            pool: p.pool().to_string(),
            redundancy: p.redundancy(),
            ashift: p.ashift(),
            layout: LayoutPolicy {
                efi: match p.efi_mib {
                    Some(m) => bytes("efi_mib", m, MIB)?,
                    None => d.efi,
                },
                boot: match p.boot_mib {
                    Some(m) => bytes("boot_mib", m, MIB)?,
                    None => d.boot,
                },
                swap: bytes("swap_gib", p.swap_gib(), 1024 * MIB)?,
                ..d
            },
            encrypt: p.encrypt(),
            keyfile: None,
            cipher: p.cipher(),
            tree: p.tree(),
            settle: p.settle(),
            template_root: None,
            yes: false,
        })
    }

    pub fn set_swap_gib(&mut self, gib: u64) -> Result<()> {
        self.layout.swap = bytes("swap size in GiB", gib, 1024 * MIB)?;
        Ok(())
    }

    /**
     * Check everything that can be checked without touching a disk.
     */
    pub fn validate(&self) -> Result<()> {
        if self.disks.is_empty() {
            return Err(ProvisionError::config(
                "at least one target disk (-d) is required",
            ));
        }
        validate_hostname(&self.hostname)?;
        validate_username(&self.username)?;
        crate::pool::validate_name(&self.pool)?;

        if !self.root.is_absolute() || self.root == Path::new("/") {
            return Err(ProvisionError::config(format!(
                "installation root {} must be an absolute path other than /",
                self.root.display()
            )));
        }
        if !(9..=16).contains(&self.ashift) {
            return Err(ProvisionError::config(format!(
                "ashift {} is out of range (9-16)",
                self.ashift
            )));
        }
        self.redundancy.resolve(self.disks.len())?;

        if self.encrypt && self.yes && self.keyfile.is_none() {
            return Err(ProvisionError::config(
                "non-interactive encrypted installs need a key file (-k)",
            ));
        }
        Ok(())
    }
}

pub fn validate_hostname(h: &str) -> Result<()> {
    let ok = !h.is_empty()
        && h.len() <= 63
        && !h.starts_with('-')
        && !h.ends_with('-')
        && h.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !ok {
        return Err(ProvisionError::config(format!(
            "\"{}\" is not a valid host name",
            h
        )));
    }
    Ok(())
}

pub fn validate_username(u: &str) -> Result<()> {
    let ok = !u.is_empty()
        && u.len() <= 32
        && u.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && u
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !ok || u == "root" {
        return Err(ProvisionError::config(format!(
            "\"{}\" is not a valid user name",
            u
        )));
    }
    Ok(())
}
