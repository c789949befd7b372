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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    /** Relative to the installation root. */
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
    pub bind: bool,
}

impl MountSpec {
    fn new(source: &str, target: &str, fstype: &str, options: &str) -> MountSpec {
        MountSpec {
            source: source.to_string(),
            target: PathBuf::from(target),
            fstype: fstype.to_string(),
            options: options.to_string(),
            bind: false,
        }
    }

    fn bind(source: &str, target: &str) -> MountSpec {
        MountSpec {
            source: source.to_string(),
            target: PathBuf::from(target),
            fstype: String::new(),
            options: String::new(),
            bind: true,
        }
    }
}

/**
 * Everything mounted under the installation root apart from the datasets,
 * parents before children.
 */
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub root: PathBuf,
    pub entries: Vec<MountSpec>,
}

impl MountPlan {
    pub fn new(root: &Path, boot: &Path, efi: &Path) -> MountPlan {
        MountPlan {
            root: root.to_path_buf(),
            entries: vec![
                MountSpec::new(&boot.to_string_lossy(), "boot", "ext4", "defaults"),
                MountSpec::new(&efi.to_string_lossy(), "boot/efi", "vfat", "umask=0077"),
                MountSpec::new("proc", "proc", "proc", "nosuid,noexec,nodev"),
                MountSpec::new("sysfs", "sys", "sysfs", "nosuid,noexec,nodev"),
                MountSpec::bind("/dev", "dev"),
                MountSpec::bind("/dev/pts", "dev/pts"),
                MountSpec::new("tmpfs", "run", "tmpfs", "mode=0755,nosuid,nodev"),
            ],
        }
    }

    pub fn target(&self, e: &MountSpec) -> PathBuf {
        self.root.join(&e.target)
    }

    /**
     * No entry may be mounted over by an entry that comes before it.
     */
    pub fn validate(&self) -> Result<()> {
        for (i, e) in self.entries.iter().enumerate() {
            if e.target.is_absolute() || e.target.as_os_str().is_empty() {
                return Err(ProvisionError::config(format!(
                    "mount target {} must be relative to the root",
                    e.target.display()
                )));
            }
            if let Some(later) = self.entries[i + 1..]
                .iter()
                .find(|l| e.target.starts_with(&l.target))
            {
                return Err(ProvisionError::config(format!(
                    "{} is mounted after {}, which it contains",
                    later.target.display(),
                    e.target.display()
                )));
            }
        }
        Ok(())
    }
}

/**
 * Build the error for a mount point that could not be unmounted, after
 * reporting whatever holds it.
 */
pub fn busy(host: &dyn Host, target: &Path, stderr: &str) -> anyhow::Error {
    let holders = match host.holders(target) {
        Ok(h) => h,
        Err(e) => {
            warn!("could not list processes using {}: {:#}", target.display(), e);
            Vec::new()
        }
    };

    let mut who = Vec::new();
    for h in holders.iter() {
        error!("{} is held by pid {} ({})", target.display(), h.pid, h.command);
        who.push(format!("{} ({})", h.pid, h.command));
    }

    ProvisionError::verify(if who.is_empty() {
        format!("could not unmount {}: {}", target.display(), stderr)
    } else {
        format!(
            "could not unmount {}: {}; held by {}",
            target.display(),
            stderr,
            who.join(", ")
        )
    })
}

pub fn is_mounted(host: &dyn Host, target: &Path) -> Result<bool> {
    Ok(host.mounts()?.iter().any(|m| m.target == target))
}

/**
 * Unmount a mount point if something is mounted there.
 */
pub fn unmount(host: &dyn Host, target: &Path) -> Result<()> {
    if !is_mounted(host, target)? {
        debug!("{} is not mounted", target.display());
        return Ok(());
    }

    info!("UNMOUNT: {}", target.display());
    let out = host.exec(&["umount", ensure::utf8(&target)?], None)?;
    if !out.success() {
        return Err(busy(host, target, out.stderr.trim()));
    }
    Ok(())
}

pub fn mount_all(host: &dyn Host, plan: &MountPlan, cleanup: &mut Cleanup) -> Result<()> {
    plan.validate()?;

    for e in plan.entries.iter() {
        let target = plan.target(e);
        ensure::directory(&target, 0o755)?;

        let tgt = ensure::utf8(&target)?;
        info!("MOUNT: {} on {}", e.source, tgt);
        if e.bind {
            ensure::run(host, &["mount", "--bind", &e.source, tgt])?;
        } else {
            ensure::run(
                host,
                &["mount", "-t", &e.fstype, "-o", &e.options, &e.source, tgt],
            )?;
        }

        cleanup.register(
            format!("mount {}", e.target.display()),
            Inverse::Unmount {
                target: target.clone(),
            },
        );
    }
    Ok(())
}
