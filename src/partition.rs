/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::disk::DiskSpec;
use crate::ensure;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::plan::PartitionPlan;
use anyhow::Result;
use log::*;
use std::path::PathBuf;
use std::time::Duration;

/**
 * How long to wait for the kernel to publish device nodes after a change to
 * a partition table or an array.  The wait is bounded: a fixed delay between
 * a limited number of probes.
 */
#[derive(Debug, Clone, Copy)]
pub struct Settle {
    pub delay: Duration,
    pub attempts: u32,
}

impl Default for Settle {
    fn default() -> Self {
        Settle {
            delay: Duration::from_secs(1),
            attempts: 10,
        }
    }
}

/**
 * Destroy whatever is on the disk: discard, then signatures, then both GPT
 * and MBR structures.
 */
pub fn wipe(host: &dyn Host, disk: &DiskSpec) -> Result<()> {
    let dev = ensure::utf8(&disk.device)?;
    info!("WIPE DEVICE: {} ({})", dev, disk.id.display());

    /*
     * Not every device supports discard (virtual disks, some USB bridges), so
     * a failure here is only worth a warning.
     */
    let out = host.exec(&["blkdiscard", "--force", dev], None)?;
    if !out.success() {
        warn!("discard of {} failed: {}", dev, out.stderr.trim());
    }

    ensure::run(host, &["wipefs", "--all", "--force", dev])?;
    ensure::run(host, &["sgdisk", "--zap-all", dev])?;
    Ok(())
}

/**
 * Wait until every one of these paths resolves to a block device.
 */
pub fn wait_for_nodes(host: &dyn Host, nodes: &[PathBuf], settle: &Settle) -> Result<()> {
    ensure::run(host, &["udevadm", "settle", "--timeout=10"])?;

    let mut missing = Vec::new();
    for attempt in 1..=settle.attempts.max(1) {
        missing.clear();
        for n in nodes.iter() {
            if host.block_device(n)?.is_none() {
                missing.push(n.display().to_string());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        debug!(
            "waiting for {} (attempt {}/{})",
            missing.join(", "),
            attempt,
            settle.attempts
        );
        host.settle(settle.delay);
    }

    Err(ProvisionError::verify(format!(
        "device nodes did not appear: {}",
        missing.join(", ")
    )))
}

/**
 * Ask the kernel to re-read the partition table, then wait for the nodes.
 */
pub fn reprobe(host: &dyn Host, disk: &DiskSpec, nodes: &[PathBuf], settle: &Settle) -> Result<()> {
    ensure::run(host, &["partprobe", ensure::utf8(&disk.device)?])?;
    wait_for_nodes(host, nodes, settle)
}

/**
 * Write a plan to its disk.  Anything already on the disk is destroyed first,
 * so applying the same plan twice gives the same result.
 */
pub fn apply(host: &dyn Host, plan: &PartitionPlan, settle: &Settle) -> Result<()> {
    let disk = &plan.disk;
    let dev = ensure::utf8(&disk.device)?;

    wipe(host, disk)?;

    info!("CREATE PARTITION TABLE: {}", dev);
    ensure::run(host, &["sgdisk", "--clear", dev])?;

    let mut args: Vec<String> = vec!["sgdisk".to_string()];
    for p in plan.partitions.iter() {
        info!(
            "    partition {} {:>5}: sectors {}..{} ({} MiB) type {}",
            p.spec.index,
            p.spec.label,
            p.start,
            p.end,
            plan.bytes(p) / (1024 * 1024),
            p.spec.type_code
        );
        args.push(format!("--new={}:{}:{}", p.spec.index, p.start, p.end));
        args.push(format!("--typecode={}:{}", p.spec.index, p.spec.type_code));
        args.push(format!("--change-name={}:{}", p.spec.index, p.spec.label));
    }
    args.push(dev.to_string());

    let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    ensure::run(host, &args)?;

    let nodes: Vec<PathBuf> = plan
        .partitions
        .iter()
        .map(|p| disk.partition(p.spec.index))
        .collect();
    reprobe(host, disk, &nodes, settle)
}
