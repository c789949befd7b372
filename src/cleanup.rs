/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

//! The rollback/cleanup controller.
//!
//! Every pipeline stage that leaves live state behind registers an inverse
//! here as soon as it succeeds.  The controller is consumed exactly once,
//! either by commit (release everything, keep what was built) or by abort
//! (release and destroy).  Either way the inverses run in the reverse of the
//! order in which they were registered, and a verification pass checks that
//! nothing is left mounted, assembled, open or imported.

use crate::crypt;
use crate::ensure;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::mount;
use crate::pool;
use crate::raid;
use anyhow::Result;
use log::*;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inverse {
    /** Ask the kernel to re-read the partition table of a disk. */
    Reprobe { device: PathBuf },
    /** Stop an array; on abort, also zero the metadata of its members. */
    StopArray { device: PathBuf, members: Vec<PathBuf> },
    CloseVolume { name: String },
    /** On abort, remove filesystem signatures from these devices. */
    WipeSignatures { devices: Vec<PathBuf> },
    ExportPool { pool: String },
    /** Datasets in the order they were mounted. */
    UnmountDatasets { datasets: Vec<String> },
    Unmount { target: PathBuf },
    /** On abort, remove a file that was written into the target. */
    RemoveFile { path: PathBuf },
}

impl fmt::Display for Inverse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inverse::Reprobe { device } => write!(f, "reprobe {}", device.display()),
            Inverse::StopArray { device, .. } => write!(f, "stop array {}", device.display()),
            Inverse::CloseVolume { name } => write!(f, "close volume {}", name),
            Inverse::WipeSignatures { devices } => write!(
                f,
                "wipe signatures on {}",
                devices
                    .iter()
                    .map(|d| d.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Inverse::ExportPool { pool } => write!(f, "export pool {}", pool),
            Inverse::UnmountDatasets { datasets } => {
                write!(f, "unmount datasets {}", datasets.join(", "))
            }
            Inverse::Unmount { target } => write!(f, "unmount {}", target.display()),
            Inverse::RemoveFile { path } => write!(f, "remove {}", path.display()),
        }
    }
}

impl Inverse {
    /**
     * Let go of live state without destroying anything that was built.
     */
    fn release(&self, host: &dyn Host) -> Result<()> {
        match self {
            Inverse::Reprobe { device } => {
                ensure::run(host, &["partprobe", ensure::utf8(&device)?])
            }
            Inverse::StopArray { device, .. } => raid::stop(host, device),
            Inverse::CloseVolume { name } => crypt::close(host, name),
            Inverse::ExportPool { pool } => pool::export(host, pool).map(|_| ()),
            Inverse::UnmountDatasets { datasets } => {
                for ds in datasets.iter().rev() {
                    pool::unmount_dataset(host, ds)?;
                }
                Ok(())
            }
            Inverse::Unmount { target } => mount::unmount(host, target),
            Inverse::WipeSignatures { .. } | Inverse::RemoveFile { .. } => Ok(()),
        }
    }

    /**
     * Undo the construction itself.  Only run on abort, after release.
     */
    fn destroy(&self, host: &dyn Host) -> Result<()> {
        match self {
            Inverse::StopArray { members, .. } => {
                for m in members.iter() {
                    raid::zero_superblock(host, m)?;
                }
                Ok(())
            }
            Inverse::WipeSignatures { devices } => {
                for d in devices.iter() {
                    info!("WIPE SIGNATURES: {}", d.display());
                    ensure::run(host, &["wipefs", "--all", ensure::utf8(d)?])?;
                }
                Ok(())
            }
            Inverse::RemoveFile { path } => ensure::removed(path).map(|_| ()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub stage: String,
    pub inverse: Inverse,
}

/**
 * The append-only record of completed stages for one run.
 */
#[derive(Debug, Default)]
pub struct ProvisioningState {
    entries: Vec<Completed>,
}

impl ProvisioningState {
    pub fn push(&mut self, stage: String, inverse: Inverse) {
        self.entries.push(Completed { stage, inverse });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Completed> {
        self.entries.iter()
    }

    fn take(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.entries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Commit,
    Abort,
}

/**
 * What the verification pass looks for.
 */
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub root: PathBuf,
    pub pool: Option<String>,
    pub arrays: Vec<PathBuf>,
    pub mappers: Vec<String>,
}

impl Targets {
    fn from_state(root: &Path, state: &ProvisioningState) -> Targets {
        let mut t = Targets {
            root: root.to_path_buf(),
            ..Default::default()
        };
        for c in state.iter() {
            match &c.inverse {
                Inverse::StopArray { device, .. } => t.arrays.push(device.clone()),
                Inverse::CloseVolume { name } => t.mappers.push(name.clone()),
                Inverse::ExportPool { pool } => t.pool = Some(pool.clone()),
                _ => (),
            }
        }
        t
    }
}

/**
 * Look for live state left behind.  Returns one description per problem; an
 * empty list means the host is clean.
 */
pub fn verify(host: &dyn Host, t: &Targets) -> Result<Vec<String>> {
    let mut residual = Vec::new();

    for m in host.mounts()? {
        if m.target.starts_with(&t.root) {
            residual.push(format!(
                "{} is still mounted at {}",
                m.source,
                m.target.display()
            ));
        }
    }

    for a in t.arrays.iter() {
        if raid::is_active(host, a)? {
            residual.push(format!("array {} is still active", a.display()));
        }
    }

    for m in t.mappers.iter() {
        if crypt::is_open(host, m)? {
            residual.push(format!("encrypted volume {} is still open", m));
        }
    }

    if let Some(p) = t.pool.as_deref() {
        if pool::imported(host, p)? {
            residual.push(format!("pool {} is still imported", p));
        }
    }

    Ok(residual)
}

pub struct Cleanup<'a> {
    host: &'a dyn Host,
    root: PathBuf,
    state: ProvisioningState,
    executed: Vec<String>,
    finished: bool,
}

impl<'a> Cleanup<'a> {
    pub fn new(host: &'a dyn Host, root: &Path) -> Cleanup<'a> {
        Cleanup {
            host,
            root: root.to_path_buf(),
            state: ProvisioningState::default(),
            executed: Vec::new(),
            finished: false,
        }
    }

    /**
     * Record a completed stage.  Call this as soon as the stage has left
     * live state behind, before doing anything else that could fail.
     */
    pub fn register<S: Into<String>>(&mut self, stage: S, inverse: Inverse) {
        let stage = stage.into();
        debug!("stage {} complete; inverse: {}", stage, inverse);
        self.state.push(stage, inverse);
    }

    pub fn state(&self) -> &ProvisioningState {
        &self.state
    }

    /**
     * The inverses run so far, in execution order.
     */
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    /**
     * Finish a run that was refused before any stage ran.  There is nothing
     * to undo, and whatever caused the refusal is not ours to verify.
     */
    pub fn dismiss(&mut self) {
        if self.state.is_empty() {
            debug!("nothing was done; no cleanup needed");
            self.finished = true;
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        self.finish(Transition::Commit)
    }

    pub fn abort(&mut self) -> Result<()> {
        self.finish(Transition::Abort)
    }

    fn finish(&mut self, t: Transition) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let targets = Targets::from_state(&self.root, &self.state);
        let entries = self.state.take();
        info!(
            "{}: undoing {} stage(s)",
            match t {
                Transition::Commit => "COMMIT",
                Transition::Abort => "ABORT",
            },
            entries.len()
        );

        /*
         * A failed inverse does not stop the others from running; whatever it
         * left behind will be caught by verification.
         */
        let mut failures = 0;
        for c in entries.iter().rev() {
            info!("UNDO {}: {}", c.stage, c.inverse);
            self.executed.push(c.inverse.to_string());

            if let Err(e) = c.inverse.release(self.host) {
                error!("{} ({}) failed: {:#}", c.inverse, c.stage, e);
                failures += 1;
                continue;
            }
            if t == Transition::Abort {
                if let Err(e) = c.inverse.destroy(self.host) {
                    error!("{} ({}) failed: {:#}", c.inverse, c.stage, e);
                    failures += 1;
                }
            }
        }

        let residual = verify(self.host, &targets)?;
        if !residual.is_empty() {
            for r in residual.iter() {
                error!("RESIDUAL: {}", r);
            }
            return Err(ProvisionError::ResidualState(residual).into());
        }

        if failures > 0 {
            warn!(
                "{} cleanup action(s) failed, but no residual state remains",
                failures
            );
        }
        info!("cleanup verified: nothing left mounted, assembled or imported");
        Ok(())
    }
}

impl Drop for Cleanup<'_> {
    /*
     * Leaving scope without a transition (an early return, a panic) is an
     * abort.
     */
    fn drop(&mut self) {
        if !self.finished {
            warn!("provisioning ended without commit; rolling back");
            if let Err(e) = self.abort() {
                error!("rollback failed: {:#}", e);
            }
        }
    }
}
