/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

//! Partition layout computation.  Nothing in here touches a device.

use crate::disk::DiskSpec;
use crate::error::ProvisionError;
use anyhow::Result;
use std::fmt;
use std::path::PathBuf;

pub const MIB: u64 = 1024 * 1024;

/*
 * A GPT partition entry array is 128 entries of 128 bytes.
 */
const GPT_ENTRY_BYTES: u64 = 128 * 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Purpose {
    Efi,
    Boot,
    Swap,
    Pool,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Purpose::Efi => "efi",
            Purpose::Boot => "boot",
            Purpose::Swap => "swap",
            Purpose::Pool => "pool",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /** An explicit starting sector; rounded up to alignment. */
    At(u64),
    /** Directly after the previous partition. */
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    /** Rounded down to alignment. */
    Bytes(u64),
    /** Everything up to the last aligned sector of the device. */
    Remainder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub index: u32,
    pub offset: Offset,
    pub size: Size,
    pub type_code: &'static str,
    pub label: &'static str,
    pub purpose: Purpose,
}

/**
 * A partition with its extent worked out.  Both start and end are inclusive
 * sector numbers, as sgdisk expects them.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub spec: PartitionSpec,
    pub start: u64,
    pub end: u64,
}

impl PlannedPartition {
    pub fn sectors(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub disk: DiskSpec,
    pub alignment: u64,
    pub partitions: Vec<PlannedPartition>,
}

impl PartitionPlan {
    pub fn get(&self, purpose: Purpose) -> Option<&PlannedPartition> {
        self.partitions.iter().find(|p| p.spec.purpose == purpose)
    }

    /**
     * The kernel path of the partition serving this purpose.
     */
    pub fn path(&self, purpose: Purpose) -> Option<PathBuf> {
        self.get(purpose).map(|p| self.disk.partition(p.spec.index))
    }

    pub fn stable_path(&self, purpose: Purpose) -> Option<PathBuf> {
        self.get(purpose)
            .map(|p| self.disk.stable_partition(p.spec.index))
    }

    pub fn bytes(&self, p: &PlannedPartition) -> u64 {
        p.sectors() * u64::from(self.disk.logical_sector)
    }
}

#[derive(Debug, Clone)]
pub struct LayoutPolicy {
    /** Minimum alignment in bytes; the disk's physical block may raise it. */
    pub alignment: u64,
    pub first_offset: u64,
    pub efi: u64,
    pub boot: u64,
    /** Zero means no swap partition. */
    pub swap: u64,
    /** Whether the small partitions become md array members. */
    pub arrays: bool,
}

impl Default for LayoutPolicy {
    fn default() -> Self {
        LayoutPolicy {
            alignment: 4096,
            first_offset: MIB,
            efi: 512 * MIB,
            boot: 1024 * MIB,
            swap: 4096 * MIB,
            arrays: true,
        }
    }
}

impl LayoutPolicy {
    /**
     * The declarative layout shared by every disk: EFI, /boot, optional swap,
     * then the pool partition over whatever remains.
     */
    pub fn specs(&self) -> Vec<PartitionSpec> {
        let raid = |plain: &'static str| if self.arrays { "FD00" } else { plain };

        let mut v = vec![
            PartitionSpec {
                index: 1,
                offset: Offset::At(0),
                size: Size::Bytes(self.efi),
                /*
                 * The ESP keeps its own type even as a mirror member so that
                 * firmware will still look at it.
                 */
                type_code: "EF00",
                label: "EFI",
                purpose: Purpose::Efi,
            },
            PartitionSpec {
                index: 2,
                offset: Offset::Next,
                size: Size::Bytes(self.boot),
                type_code: raid("8300"),
                label: "boot",
                purpose: Purpose::Boot,
            },
        ];

        if self.swap > 0 {
            v.push(PartitionSpec {
                index: 3,
                offset: Offset::Next,
                size: Size::Bytes(self.swap),
                type_code: raid("8200"),
                label: "swap",
                purpose: Purpose::Swap,
            });
        }

        v.push(PartitionSpec {
            index: v.len() as u32 + 1,
            offset: Offset::Next,
            size: Size::Remainder,
            type_code: "BF00",
            label: "zfs",
            purpose: Purpose::Pool,
        });

        v
    }
}

fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

fn round_down(n: u64, align: u64) -> u64 {
    n / align * align
}

/**
 * Alignment in sectors for this disk: the policy alignment or the physical
 * block size, whichever is larger.
 */
pub fn alignment_sectors(disk: &DiskSpec, alignment: u64) -> u64 {
    let bytes = alignment.max(u64::from(disk.physical_block));
    (bytes / u64::from(disk.logical_sector)).max(1)
}

/**
 * The highest sector a partition may use.  The backup GPT header occupies the
 * final sector, with the backup entry array just before it.
 */
pub fn last_usable(disk: &DiskSpec) -> u64 {
    let entries = GPT_ENTRY_BYTES.div_ceil(u64::from(disk.logical_sector));
    disk.sectors.saturating_sub(2 + entries)
}

/**
 * The last sector of the final fully aligned chunk below the usable limit.
 * Truncates: any partial chunk at the end of the disk is left unused.
 */
pub fn last_aligned_end(disk: &DiskSpec, align: u64) -> Option<u64> {
    let limit = round_down(last_usable(disk) + 1, align);
    limit.checked_sub(1)
}

fn too_small(disk: &DiskSpec, what: &str) -> anyhow::Error {
    ProvisionError::config(format!(
        "disk {} ({} bytes) is too small: {}",
        disk.id.display(),
        disk.bytes(),
        what
    ))
}

pub fn plan_disk(disk: &DiskSpec, policy: &LayoutPolicy) -> Result<PartitionPlan> {
    let align = alignment_sectors(disk, policy.alignment);
    let sector = u64::from(disk.logical_sector);
    let first = round_up(
        (policy.first_offset / sector).max(2 + GPT_ENTRY_BYTES.div_ceil(sector)),
        align,
    );
    let last = last_aligned_end(disk, align).ok_or_else(|| too_small(disk, "no aligned space"))?;

    let mut out = Vec::new();
    let mut next = first;

    for spec in policy.specs() {
        let start = match spec.offset {
            Offset::At(s) => round_up(s.max(first), align),
            Offset::Next => next,
        };
        if start < next {
            return Err(ProvisionError::config(format!(
                "partition {} overlaps its predecessor",
                spec.index
            )));
        }

        let end = match spec.size {
            Size::Bytes(b) => {
                let n = round_down(b / sector, align);
                if n == 0 {
                    return Err(ProvisionError::config(format!(
                        "partition {} ({}) is smaller than one alignment unit",
                        spec.index, spec.label
                    )));
                }
                start + n - 1
            }
            Size::Remainder => last,
        };

        if start > last || end > last || end < start + align - 1 {
            return Err(too_small(
                disk,
                &format!("partition {} ({}) does not fit", spec.index, spec.label),
            ));
        }

        next = end + 1;
        out.push(PlannedPartition { spec, start, end });
    }

    Ok(PartitionPlan {
        disk: disk.clone(),
        alignment: align,
        partitions: out,
    })
}

/**
 * Compute one plan per disk.  Pure: the same disks and policy always give the
 * same plans.
 */
pub fn plan(disks: &[DiskSpec], policy: &LayoutPolicy) -> Result<Vec<PartitionPlan>> {
    disks.iter().map(|d| plan_disk(d, policy)).collect()
}
