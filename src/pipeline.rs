/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

//! The provisioning pipeline.  Stages run strictly in order; each one
//! registers its inverse with the cleanup controller as soon as it has left
//! something behind, and the controller either commits or rolls everything
//! back at the end.

use crate::cleanup::{self, Cleanup, Inverse, Targets};
use crate::config::Settings;
use crate::crypt::{self, Key, OpenVolume, VolumeSpec};
use crate::disk::{self, DiskSpec};
use crate::error::ProvisionError;
use crate::format::{self, Formatted, FsKind};
use crate::fstab::{self, CrypttabEntry, FstabEntry};
use crate::host::Host;
use crate::mount::{self, MountPlan};
use crate::partition;
use crate::plan::{self, PartitionPlan, Purpose};
use crate::pool::{self, DatasetSpec, PoolSpec};
use crate::raid::{self, ArrayHandle, ArraySpec, Level};
use crate::signal;
use crate::stage::{self, Script, StageParams};
use anyhow::{Context, Result};
use log::*;
use std::path::{Path, PathBuf};

/**
 * Everything decided before the first destructive action.
 */
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub disks: Vec<DiskSpec>,
    pub plans: Vec<PartitionPlan>,
    pub arrays: Vec<ArraySpec>,
    pub pool: PoolSpec,
    pub tree: Vec<DatasetSpec>,
    pub script: String,
}

impl Blueprint {
    /**
     * A human-readable account of what is about to happen.
     */
    pub fn describe(&self, s: &Settings) -> Vec<String> {
        let mut out = Vec::new();

        out.push("disks (all data on them will be destroyed):".to_string());
        for d in self.disks.iter() {
            out.push(format!(
                "    {} -> {} ({} GiB)",
                d.id.display(),
                d.device.display(),
                d.bytes() / (1024 * 1024 * 1024)
            ));
        }

        out.push("partitions (per disk):".to_string());
        if let Some(p) = self.plans.first() {
            for pp in p.partitions.iter() {
                out.push(format!(
                    "    {} {:<5} {:>8} MiB  type {}",
                    pp.spec.index,
                    pp.spec.label,
                    p.bytes(pp) / plan::MIB,
                    pp.spec.type_code
                ));
            }
        }

        if self.arrays.is_empty() {
            out.push("arrays: none (single disk)".to_string());
        } else {
            out.push("arrays:".to_string());
            for a in self.arrays.iter() {
                out.push(format!(
                    "    {} {:?} of {} members",
                    a.path().display(),
                    a.level,
                    a.members.len()
                ));
            }
        }

        out.push(format!(
            "encryption: {}",
            if s.encrypt {
                format!("{} ({})", s.cipher.luks_type, s.cipher.cipher)
            } else {
                "none".to_string()
            }
        ));
        out.push(format!(
            "pool: {} ({:?}, ashift {})",
            self.pool.name, self.pool.redundancy, s.ashift
        ));
        out.push("datasets:".to_string());
        for ds in self.tree.iter() {
            out.push(format!(
                "    {}/{} -> {}",
                self.pool.name,
                ds.name,
                pool::effective_mountpoint(&self.tree, &ds.name)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not mounted)".to_string())
            ));
        }
        out.push(format!("installation root: {}", s.root.display()));
        out
    }
}

/**
 * What a completed run built.
 */
#[derive(Debug, Clone)]
pub struct Report {
    pub arrays: Vec<ArrayHandle>,
    pub volumes: Vec<OpenVolume>,
    pub filesystems: Vec<Formatted>,
    pub datasets: Vec<String>,
    pub mounts: Vec<PathBuf>,
    pub fstab: Vec<FstabEntry>,
    pub crypttab: Vec<CrypttabEntry>,
    /** What the second stage printed. */
    pub second_stage: Vec<String>,
}

/*
 * The block devices that hold /boot, the ESP and swap, either arrays or (on a
 * single disk) the partitions themselves.
 */
struct BootDevices {
    efi: PathBuf,
    boot: PathBuf,
    swap: Option<PathBuf>,
}

pub struct Installer<'a> {
    host: &'a dyn Host,
    s: &'a Settings,
    interrupted: Box<dyn Fn() -> bool + 'a>,
}

impl<'a> Installer<'a> {
    pub fn new(host: &'a dyn Host, s: &'a Settings) -> Installer<'a> {
        Installer {
            host,
            s,
            interrupted: Box::new(signal::interrupted),
        }
    }

    pub fn with_interrupt<F: Fn() -> bool + 'a>(mut self, f: F) -> Installer<'a> {
        self.interrupted = Box::new(f);
        self
    }

    pub fn require_privilege(&self) -> Result<()> {
        if !self.host.privileged() {
            return Err(ProvisionError::config("this must be run as root"));
        }
        Ok(())
    }

    /*
     * Between stages: an interrupt turns into a stage failure, and so into a
     * rollback.
     */
    fn checkpoint(&self, next: &str) -> Result<()> {
        if (self.interrupted)() {
            return Err(ProvisionError::verify(format!(
                "interrupted before {}",
                next
            )));
        }
        info!("==> {}", next);
        Ok(())
    }

    fn stage_params(&self, disks: &[DiskSpec]) -> StageParams {
        StageParams {
            hostname: self.s.hostname.clone(),
            username: self.s.username.clone(),
            pool: self.s.pool.clone(),
            root_dataset: format!("{}/ROOT/{}", self.s.pool, self.s.hostname),
            efi_devices: disks
                .iter()
                .map(|d| d.device.display().to_string())
                .collect(),
            encrypted: self.s.encrypt,
            arrays: disks.len() > 1,
        }
    }

    /**
     * Resolve and check everything that can be checked without changing
     * anything: disks, partition layout, arrays, pool, dataset tree and the
     * rendered second stage script.
     */
    pub fn blueprint(&self) -> Result<Blueprint> {
        self.s.validate()?;

        let disks = disk::resolve(self.host, &self.s.disks)?;
        let mut policy = self.s.layout.clone();
        policy.arrays = disks.len() > 1;
        let plans = plan::plan(&disks, &policy)?;

        let members = |purpose: Purpose| -> Vec<PathBuf> {
            plans.iter().filter_map(|p| p.path(purpose)).collect()
        };
        let mut arrays = Vec::new();
        if policy.arrays {
            arrays.push(ArraySpec::new(Purpose::Efi, Level::Mirror, members(Purpose::Efi)));
            arrays.push(ArraySpec::new(Purpose::Boot, Level::Mirror, members(Purpose::Boot)));
            if policy.swap > 0 {
                arrays.push(ArraySpec::new(Purpose::Swap, Level::Stripe, members(Purpose::Swap)));
            }
        }

        let redundancy = self.s.redundancy.resolve(disks.len())?;
        let pool = PoolSpec::new(
            &self.s.pool,
            plans.iter().filter_map(|p| p.stable_path(Purpose::Pool)).collect(),
            redundancy,
            self.s.ashift,
        );

        let tree = pool::default_tree(&self.s.hostname, &self.s.tree);
        pool::validate_tree(&tree)?;

        let script = Script::load(self.s.template_root.as_deref())?
            .render(&self.stage_params(&disks))?;

        Ok(Blueprint {
            disks,
            plans,
            arrays,
            pool,
            tree,
            script,
        })
    }

    /*
     * Refuse to start over anything that is still in use.  Leftover arrays
     * are not a reason to refuse: they are torn down as part of the run.
     */
    fn preflight(&self, b: &Blueprint) -> Result<()> {
        for m in self.host.mounts()? {
            if m.target.starts_with(&self.s.root) {
                return Err(ProvisionError::config(format!(
                    "{} is already mounted under the installation root",
                    m.target.display()
                )));
            }
            if !m.source.starts_with("/dev/") {
                continue;
            }
            let Some(dev) = self.host.block_device(Path::new(&m.source))? else {
                continue;
            };
            let name = dev.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            if let Some(d) = b
                .disks
                .iter()
                .find(|d| d.device == dev || d.owns_partition(name))
            {
                return Err(ProvisionError::config(format!(
                    "{} ({}) is mounted at {}",
                    d.id.display(),
                    m.source,
                    m.target.display()
                )));
            }
        }

        if pool::imported(self.host, &b.pool.name)? {
            return Err(ProvisionError::config(format!(
                "a pool named {} is already imported",
                b.pool.name
            )));
        }
        Ok(())
    }

    /**
     * Run the whole pipeline, committing on success and rolling back on any
     * failure.
     */
    pub fn install(&self, b: &Blueprint, key: Option<&Key>) -> Result<Report> {
        let mut cleanup = Cleanup::new(self.host, &self.s.root);
        self.install_with(b, key, &mut cleanup)
    }

    pub fn install_with(
        &self,
        b: &Blueprint,
        key: Option<&Key>,
        cleanup: &mut Cleanup,
    ) -> Result<Report> {
        if let Err(e) = self.ready(b, key) {
            cleanup.dismiss();
            return Err(e);
        }

        match self.stages(b, key, cleanup) {
            Ok(report) => {
                info!("all stages complete; committing");
                cleanup.commit()?;
                Ok(report)
            }
            Err(e) => {
                error!("provisioning failed: {:#}", e);
                match cleanup.abort() {
                    Ok(()) => Err(e),
                    Err(residual) => {
                        Err(residual.context(format!("rolling back after: {:#}", e)))
                    }
                }
            }
        }
    }

    fn ready(&self, b: &Blueprint, key: Option<&Key>) -> Result<()> {
        self.require_privilege()?;
        if self.s.encrypt && key.is_none() {
            return Err(ProvisionError::config("encryption needs a passphrase"));
        }
        self.preflight(b)
    }

    fn stages(&self, b: &Blueprint, key: Option<&Key>, cleanup: &mut Cleanup) -> Result<Report> {
        let host = self.host;
        let s = self.s;
        let root = s.root.as_path();

        self.checkpoint("stale arrays")?;
        raid::stop_stale(host, &b.disks)?;

        for p in b.plans.iter() {
            self.checkpoint(&format!("partition {}", p.disk.device.display()))?;
            partition::apply(host, p, &s.settle)?;
            cleanup.register(
                format!("partition {}", p.disk.name()),
                Inverse::Reprobe {
                    device: p.disk.device.clone(),
                },
            );
        }

        let mut arrays = Vec::new();
        for a in b.arrays.iter() {
            self.checkpoint(&format!("array {}", a.name))?;
            arrays.push(raid::create(host, a, &s.settle, cleanup)?);
        }
        let boot_devices = self.boot_devices(b, &arrays)?;

        let mut volumes = Vec::new();
        let mut swap = boot_devices.swap.clone();
        let mut pool_devices = b.pool.devices.clone();
        if let Some(key) = key.filter(|_| s.encrypt) {
            self.checkpoint("encryption")?;
            if let Some(dev) = swap.as_ref() {
                let v = crypt::setup(
                    host,
                    &VolumeSpec {
                        backing: dev.clone(),
                        profile: s.cipher.clone(),
                    },
                    key,
                    &s.settle,
                    cleanup,
                )?;
                swap = Some(v.path());
                volumes.push(v);
            }
            pool_devices.clear();
            for dev in b.pool.devices.iter() {
                let v = crypt::setup(
                    host,
                    &VolumeSpec {
                        backing: dev.clone(),
                        profile: s.cipher.clone(),
                    },
                    key,
                    &s.settle,
                    cleanup,
                )?;
                pool_devices.push(v.path());
                volumes.push(v);
            }
        }

        self.checkpoint("filesystems")?;
        let mut filesystems = vec![
            format::make(host, &boot_devices.boot, FsKind::Ext4, "boot", cleanup)?,
            format::make(host, &boot_devices.efi, FsKind::Vfat, "EFI", cleanup)?,
        ];
        if let Some(dev) = swap.as_ref() {
            filesystems.push(format::make(host, dev, FsKind::Swap, "swap", cleanup)?);
        }

        self.checkpoint("pool")?;
        let spec = PoolSpec {
            devices: pool_devices,
            ..b.pool.clone()
        };
        pool::create_pool(host, &spec, root, cleanup)?;

        self.checkpoint("datasets")?;
        let datasets = pool::create_datasets(host, &spec.name, &b.tree, cleanup)?;
        pool::set_boot_properties(
            host,
            &spec.name,
            root,
            &format!("ROOT/{}", s.hostname),
            cleanup,
        )?;

        self.checkpoint("mounts")?;
        let plan = MountPlan::new(root, &boot_devices.boot, &boot_devices.efi);
        mount::mount_all(host, &plan, cleanup)?;

        self.checkpoint("boot tables")?;
        let mut table = vec![
            FstabEntry::for_filesystem(&filesystems[0], "/boot"),
            FstabEntry::for_filesystem(&filesystems[1], "/boot/efi"),
        ];
        if let Some(sw) = filesystems.get(2) {
            table.push(FstabEntry::for_filesystem(sw, "none"));
        }
        fstab::install(root, "etc/fstab", &fstab::render_fstab(&table), cleanup)?;

        let crypttab: Vec<CrypttabEntry> = volumes.iter().map(CrypttabEntry::from).collect();
        if !crypttab.is_empty() {
            fstab::install(
                root,
                "etc/crypttab",
                &fstab::render_crypttab(&crypttab),
                cleanup,
            )?;
        }

        self.checkpoint("second stage")?;
        let second_stage = stage::execute(host, root, &b.script, cleanup)?;

        /*
         * A signal that arrived during the second stage still aborts.
         */
        self.checkpoint("commit")?;

        Ok(Report {
            arrays,
            volumes,
            filesystems,
            datasets,
            mounts: plan.entries.iter().map(|e| plan.target(e)).collect(),
            fstab: table,
            crypttab,
            second_stage,
        })
    }

    fn boot_devices(&self, b: &Blueprint, arrays: &[ArrayHandle]) -> Result<BootDevices> {
        if !arrays.is_empty() {
            let find = |p: Purpose| arrays.iter().find(|a| a.spec.purpose == p).map(|a| a.device.clone());
            return Ok(BootDevices {
                efi: find(Purpose::Efi).context("no EFI array")?,
                boot: find(Purpose::Boot).context("no boot array")?,
                swap: find(Purpose::Swap),
            });
        }

        let p = b.plans.first().context("no partition plan")?;
        Ok(BootDevices {
            efi: p.path(Purpose::Efi).context("no EFI partition")?,
            boot: p.path(Purpose::Boot).context("no boot partition")?,
            swap: p.path(Purpose::Swap),
        })
    }

    /**
     * Look for anything a previous run left behind under the root: mounts,
     * the pool, and the arrays this installer builds.
     */
    pub fn verify(&self) -> Result<Vec<String>> {
        self.require_privilege()?;
        let t = Targets {
            root: self.s.root.clone(),
            pool: Some(self.s.pool.clone()),
            arrays: [Purpose::Efi, Purpose::Boot, Purpose::Swap]
                .iter()
                .map(|p| PathBuf::from(format!("/dev/md/{}", p)))
                .collect(),
            mappers: Vec::new(),
        };
        cleanup::verify(self.host, &t)
    }
}
