/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::ensure;
use crate::error::ProvisionError;
use crate::host::Host;
use anyhow::{anyhow, Context, Result};
use log::*;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/**
 * How the kernel names the partitions of a whole-disk device.  Devices whose
 * names end in a digit (nvme0n1, mmcblk0, loop3) need a "p" between the disk
 * name and the partition number; others (sda, vdb) do not.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Plain,
    Infixed,
}

impl DeviceClass {
    pub fn of(kernel_name: &str) -> DeviceClass {
        if kernel_name.ends_with(|c: char| c.is_ascii_digit()) {
            DeviceClass::Infixed
        } else {
            DeviceClass::Plain
        }
    }

    pub fn partition(&self, device: &Path, n: u32) -> PathBuf {
        let mut s = device.as_os_str().to_owned();
        match self {
            DeviceClass::Plain => s.push(n.to_string()),
            DeviceClass::Infixed => s.push(format!("p{}", n)),
        }
        PathBuf::from(s)
    }
}

/**
 * A target disk, resolved once at the start of a run.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    /** The identifier as given by the operator. */
    pub id: PathBuf,
    pub device: PathBuf,
    pub class: DeviceClass,
    pub sectors: u64,
    pub logical_sector: u32,
    pub physical_block: u32,
}

impl DiskSpec {
    pub fn name(&self) -> &str {
        self.device
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("?")
    }

    pub fn bytes(&self) -> u64 {
        self.sectors * u64::from(self.logical_sector)
    }

    /**
     * The kernel device path of partition n.
     */
    pub fn partition(&self, n: u32) -> PathBuf {
        self.class.partition(&self.device, n)
    }

    /**
     * Is this kernel name one of our partitions?  "sda2" is on "sda" but
     * "sdaa1" is not; "nvme0n1p2" is on "nvme0n1".
     */
    pub fn owns_partition(&self, kernel_name: &str) -> bool {
        let Some(rest) = kernel_name.strip_prefix(self.name()) else {
            return false;
        };
        let digits = match self.class {
            DeviceClass::Plain => rest,
            DeviceClass::Infixed => match rest.strip_prefix('p') {
                Some(d) => d,
                None => return false,
            },
        };
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
    }

    /**
     * A path for partition n that survives device renumbering.  Identifiers
     * from /dev/disk/by-id have a "-partN" companion link maintained by udev;
     * anything else falls back to the kernel path.
     */
    pub fn stable_partition(&self, n: u32) -> PathBuf {
        if self.id.starts_with("/dev/disk/by-id") {
            let mut s = self.id.as_os_str().to_owned();
            s.push(format!("-part{}", n));
            PathBuf::from(s)
        } else {
            self.partition(n)
        }
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    size: serde_json::Value,
    #[serde(rename = "log-sec")]
    log_sec: serde_json::Value,
    #[serde(rename = "phy-sec")]
    phy_sec: serde_json::Value,
    #[serde(rename = "type")]
    devtype: String,
}

/*
 * Depending on the util-linux version, numeric columns come back either as
 * JSON numbers or as strings.
 */
fn number(v: &serde_json::Value) -> Option<u64> {
    match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn probe(host: &dyn Host, device: &Path) -> Result<LsblkDevice> {
    let out = ensure::output(
        host,
        &[
            "lsblk",
            "--json",
            "--bytes",
            "--nodeps",
            "--output",
            "NAME,SIZE,LOG-SEC,PHY-SEC,TYPE",
            ensure::utf8(&device)?,
        ],
    )?;

    let mut o: LsblkOutput = serde_json::from_str(&out)
        .with_context(|| format!("parsing lsblk output for {}", device.display()))?;
    if o.blockdevices.len() != 1 {
        return Err(anyhow!(
            "lsblk reported {} devices for {}",
            o.blockdevices.len(),
            device.display()
        ));
    }
    Ok(o.blockdevices.remove(0))
}

/**
 * Resolve operator-supplied disk identifiers to whole-disk block devices.
 * Every identifier must exist, and no two may name the same disk.
 */
pub fn resolve(host: &dyn Host, ids: &[String]) -> Result<Vec<DiskSpec>> {
    if ids.is_empty() {
        return Err(ProvisionError::config("no target disks were specified"));
    }

    let mut seen: BTreeMap<PathBuf, &str> = BTreeMap::new();
    let mut out = Vec::new();

    for id in ids.iter() {
        let device = match host.block_device(Path::new(id))? {
            Some(d) => d,
            None => {
                return Err(ProvisionError::config(format!(
                    "disk {} does not exist or is not a block device",
                    id
                )))
            }
        };

        if let Some(other) = seen.insert(device.clone(), id.as_str()) {
            return Err(ProvisionError::config(format!(
                "disks {} and {} are the same device ({})",
                other,
                id,
                device.display()
            )));
        }

        let d = probe(host, &device)?;
        if d.devtype != "disk" && d.devtype != "loop" {
            return Err(ProvisionError::config(format!(
                "{} is a {}, not a whole disk",
                id, d.devtype
            )));
        }

        let bytes = number(&d.size).ok_or_else(|| anyhow!("bad size for {}", id))?;
        let logical = number(&d.log_sec)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| anyhow!("bad logical sector size for {}", id))?;
        let physical = number(&d.phy_sec)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(logical);
        if logical == 0 || bytes < u64::from(logical) {
            return Err(ProvisionError::config(format!("{} has no usable capacity", id)));
        }

        let spec = DiskSpec {
            id: PathBuf::from(id),
            class: DeviceClass::of(&d.name),
            device,
            sectors: bytes / u64::from(logical),
            logical_sector: logical,
            physical_block: physical,
        };
        info!(
            "disk {} -> {} ({} sectors of {} bytes, {:?})",
            id,
            spec.device.display(),
            spec.sectors,
            spec.logical_sector,
            spec.class
        );
        out.push(spec);
    }

    Ok(out)
}
