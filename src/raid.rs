/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::cleanup::{Cleanup, Inverse};
use crate::disk::DiskSpec;
use crate::ensure;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::partition::{self, Settle};
use crate::plan::Purpose;
use anyhow::{anyhow, Result};
use log::*;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Mirror,
    Stripe,
}

impl Level {
    fn arg(&self) -> &'static str {
        match self {
            Level::Mirror => "--level=1",
            Level::Stripe => "--level=0",
        }
    }

    pub fn minimum(&self) -> usize {
        2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metadata {
    /**
     * Superblock at the end of the member, so that firmware and boot loaders
     * see each member as a plain filesystem.
     */
    V1_0,
    Default,
}

impl Metadata {
    pub fn for_purpose(purpose: Purpose) -> Metadata {
        match purpose {
            Purpose::Efi | Purpose::Boot => Metadata::V1_0,
            _ => Metadata::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArraySpec {
    pub name: String,
    pub level: Level,
    pub metadata: Metadata,
    pub members: Vec<PathBuf>,
    pub purpose: Purpose,
}

impl ArraySpec {
    /**
     * Arrays are named after what they hold, so that names are the same from
     * one run to the next.
     */
    pub fn new(purpose: Purpose, level: Level, members: Vec<PathBuf>) -> ArraySpec {
        ArraySpec {
            name: purpose.to_string(),
            level,
            metadata: Metadata::for_purpose(purpose),
            members,
            purpose,
        }
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/md/{}", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayHandle {
    pub spec: ArraySpec,
    /** The kernel device, e.g. /dev/md127. */
    pub device: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdStat {
    pub name: String,
    pub level: String,
    pub members: Vec<String>,
}

/*
 * Lines of interest in /proc/mdstat look like:
 *
 *     md127 : active raid1 sdb2[1] sda2[0]
 */
fn parse_mdstat(text: &str) -> Vec<MdStat> {
    let mut out = Vec::new();
    for l in text.lines() {
        let Some((name, rest)) = l.split_once(" : ") else {
            continue;
        };
        let name = name.trim();
        if !name.starts_with("md") {
            continue;
        }

        let mut words = rest.split_whitespace();
        let _state = words.next();
        let mut level = String::new();
        let mut members = Vec::new();
        for w in words {
            match w.split_once('[') {
                Some((m, _)) => members.push(m.to_string()),
                None if w.starts_with("raid") || w == "linear" => level = w.to_string(),
                None => (),
            }
        }
        out.push(MdStat {
            name: name.to_string(),
            level,
            members,
        });
    }
    out
}

pub fn active_arrays(host: &dyn Host) -> Result<Vec<MdStat>> {
    Ok(host
        .read_file(Path::new("/proc/mdstat"))?
        .map(|s| parse_mdstat(&s))
        .unwrap_or_default())
}

/**
 * Stop every active array built on partitions of these disks.  Anything left
 * over from an earlier run would otherwise keep the partitions open.
 */
pub fn stop_stale(host: &dyn Host, disks: &[DiskSpec]) -> Result<Vec<String>> {
    let mut stopped = Vec::new();
    for a in active_arrays(host)? {
        let ours = a
            .members
            .iter()
            .any(|m| disks.iter().any(|d| d.owns_partition(m)));
        if !ours {
            continue;
        }

        info!("STOP STALE ARRAY: /dev/{} ({})", a.name, a.members.join(" "));
        ensure::run(host, &["mdadm", "--stop", &format!("/dev/{}", a.name)])?;
        stopped.push(a.name);
    }
    Ok(stopped)
}

/**
 * Stop every active array that holds any of these devices.  Partitioning
 * can bring old arrays back (udev assembles whatever superblocks a re-read
 * table exposes), so this runs again right before each array is created.
 */
pub fn stop_holding(host: &dyn Host, members: &[PathBuf]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for m in members.iter() {
        let dev = host.block_device(m)?.unwrap_or_else(|| m.clone());
        if let Some(n) = dev.file_name().and_then(|s| s.to_str()) {
            names.push(n.to_string());
        }
    }

    let mut stopped = Vec::new();
    for a in active_arrays(host)? {
        if !a.members.iter().any(|m| names.contains(m)) {
            continue;
        }

        info!("STOP ARRAY HOLDING MEMBERS: /dev/{} ({})", a.name, a.members.join(" "));
        ensure::run(host, &["mdadm", "--stop", &format!("/dev/{}", a.name)])?;
        stopped.push(a.name);
    }
    Ok(stopped)
}

/**
 * Remove md metadata from a member.  A device without any is fine.
 */
pub fn zero_superblock(host: &dyn Host, member: &Path) -> Result<()> {
    let m = ensure::utf8(&member)?;
    let out = host.exec(&["mdadm", "--zero-superblock", m], None)?;
    if out.success() {
        info!("ZERO SUPERBLOCK: {}", m);
        return Ok(());
    }
    if out.stderr.contains("Unrecognised md component") {
        debug!("{} has no md metadata", m);
        return Ok(());
    }

    Err(ProvisionError::ToolInvocation {
        command: format!("mdadm --zero-superblock {}", m),
        status: out.status,
        stderr: out.stderr.trim().to_string(),
    }
    .into())
}

/**
 * Is the array behind this path (/dev/md/NAME or /dev/mdNNN) running?  Once
 * an array is stopped its named link goes away with it.
 */
pub fn is_active(host: &dyn Host, device: &Path) -> Result<bool> {
    let Some(dev) = host.block_device(device)? else {
        return Ok(false);
    };
    let kname = dev
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("bad array device {}", dev.display()))?;
    Ok(active_arrays(host)?.iter().any(|a| a.name == kname))
}

/**
 * Stop an array if it is still running.
 */
pub fn stop(host: &dyn Host, device: &Path) -> Result<()> {
    if !is_active(host, device)? {
        debug!("array {} is not active", device.display());
        return Ok(());
    }

    info!("STOP ARRAY: {}", device.display());
    ensure::run(host, &["mdadm", "--stop", ensure::utf8(&device)?])
}

fn detail_field<'a>(detail: &'a str, key: &str) -> Option<&'a str> {
    detail.lines().find_map(|l| {
        let (k, v) = l.split_once(" : ")?;
        if k.trim() == key {
            Some(v.trim())
        } else {
            None
        }
    })
}

/**
 * Confirm that a freshly created array is whole.  A degraded array straight
 * after creation means a member is bad; that is fatal.
 */
pub fn check_health(host: &dyn Host, h: &ArrayHandle) -> Result<()> {
    let detail = ensure::output(host, &["mdadm", "--detail", ensure::utf8(&h.device)?])?;

    let state = detail_field(&detail, "State").unwrap_or("unknown");
    let active: usize = detail_field(&detail, "Active Devices")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let expected = h.spec.members.len();

    if state.contains("degraded") || state.contains("FAILED") || state.contains("inactive") {
        return Err(ProvisionError::verify(format!(
            "array assembly: {} ({}) is in state \"{}\"",
            h.spec.name,
            h.device.display(),
            state
        )));
    }
    if active != expected {
        return Err(ProvisionError::verify(format!(
            "array assembly: {} ({}) has {} active of {} members",
            h.spec.name,
            h.device.display(),
            active,
            expected
        )));
    }

    debug!("array {} state \"{}\", {} active", h.spec.name, state, active);
    Ok(())
}

/**
 * Create an array and register its inverse.  Any running array that holds a
 * member is stopped and the old metadata zeroed first.
 */
pub fn create(
    host: &dyn Host,
    spec: &ArraySpec,
    settle: &Settle,
    cleanup: &mut Cleanup,
) -> Result<ArrayHandle> {
    if spec.members.len() < spec.level.minimum() {
        return Err(ProvisionError::verify(format!(
            "array assembly: {} needs at least {} members, got {}",
            spec.name,
            spec.level.minimum(),
            spec.members.len()
        )));
    }

    stop_holding(host, &spec.members)?;
    for m in spec.members.iter() {
        zero_superblock(host, m)?;
    }

    let path = spec.path();
    let ndevs = format!("--raid-devices={}", spec.members.len());
    let mut args = vec![
        "mdadm",
        "--create",
        ensure::utf8(&path)?,
        "--run",
        spec.level.arg(),
        &ndevs,
    ];
    if spec.metadata == Metadata::V1_0 {
        args.push("--metadata=1.0");
    }
    for m in spec.members.iter() {
        args.push(ensure::utf8(m)?);
    }

    info!(
        "CREATE ARRAY: {} {:?} over {}",
        path.display(),
        spec.level,
        spec.members
            .iter()
            .map(|m| m.display().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );
    ensure::run(host, &args)?;

    /*
     * The array exists from here on, even if we cannot yet see its device
     * node.  Stopping by name works either way.
     */
    cleanup.register(
        format!("array {}", spec.name),
        Inverse::StopArray {
            device: path.clone(),
            members: spec.members.clone(),
        },
    );

    partition::wait_for_nodes(host, &[path.clone()], settle)?;
    let device = host
        .block_device(&path)?
        .ok_or_else(|| ProvisionError::verify(format!("{} vanished", path.display())))?;

    let h = ArrayHandle {
        spec: spec.clone(),
        device,
    };
    check_health(host, &h)?;
    info!("array {} is {}", spec.name, h.device.display());
    Ok(h)
}
