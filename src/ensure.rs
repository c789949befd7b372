/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::error::ProvisionError;
use crate::host::{Host, Output};
use anyhow::{anyhow, bail, Context, Result};
use log::*;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

#[derive(Debug, PartialEq, Eq)]
pub enum FileType {
    Directory,
    File,
    Link,
    Other,
}

#[derive(Debug)]
pub struct FileInfo {
    pub filetype: FileType,
    pub perms: u32,
}

impl FileInfo {
    pub fn is_file(&self) -> bool {
        self.filetype == FileType::File
    }

    pub fn is_dir(&self) -> bool {
        self.filetype == FileType::Directory
    }
}

pub fn check<P: AsRef<Path>>(p: P) -> Result<Option<FileInfo>> {
    let p = p.as_ref();
    let md = match std::fs::symlink_metadata(p) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => bail!("checking {}: {}", p.display(), e),
    };

    let ft = md.file_type();
    let filetype = if ft.is_dir() {
        FileType::Directory
    } else if ft.is_file() {
        FileType::File
    } else if ft.is_symlink() {
        FileType::Link
    } else {
        FileType::Other
    };

    Ok(Some(FileInfo {
        filetype,
        perms: md.permissions().mode() & 0o7777,
    }))
}

/**
 * Tools take paths as arguments; a path that is not UTF-8 cannot be passed
 * through and is an error rather than a panic.
 */
pub fn utf8(p: &Path) -> Result<&str> {
    p.to_str()
        .ok_or_else(|| anyhow!("path {} is not valid UTF-8", p.display()))
}

/**
 * Run a tool and require it to succeed.  A failure is reported as a
 * ToolInvocation error carrying the tool's diagnostic output.
 */
pub fn run(host: &dyn Host, args: &[&str]) -> Result<()> {
    run_input(host, args, None).map(|_| ())
}

/**
 * Run a tool, require it to succeed, and return its standard output.
 */
pub fn output(host: &dyn Host, args: &[&str]) -> Result<String> {
    run_input(host, args, None).map(|o| o.stdout)
}

pub fn run_input(host: &dyn Host, args: &[&str], input: Option<&[u8]>) -> Result<Output> {
    let line = args.join(" ");
    debug!("exec: {}", line);

    let out = host.exec(args, input)?;
    if !out.success() {
        let stderr = out.stderr.trim().to_string();
        error!("{} failed: {}", line, stderr);
        return Err(ProvisionError::ToolInvocation {
            command: line,
            status: out.status,
            stderr,
        }
        .into());
    }

    Ok(out)
}

/**
 * Make sure a directory exists with the given mode.  Parent directories are
 * created as required.
 */
pub fn directory<P: AsRef<Path>>(dir: P, mode: u32) -> Result<()> {
    let dir = dir.as_ref();

    if let Some(fi) = check(dir)? {
        if !fi.is_dir() {
            bail!("{} exists but is not a directory", dir.display());
        }
        if fi.perms != mode {
            info!("directory {} mode {:o} -> {:o}", dir.display(), fi.perms, mode);
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))?;
        }
        return Ok(());
    }

    info!("CREATE DIRECTORY: {}", dir.display());
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .with_context(|| format!("creating directory {}", dir.display()))?;
    Ok(())
}

/**
 * Write a file with exactly this content and mode, replacing whatever was
 * there.
 */
pub fn filestr<P: AsRef<Path>>(contents: &str, dst: P, mode: u32) -> Result<()> {
    let dst = dst.as_ref();

    if let Some(fi) = check(dst)? {
        if !fi.is_file() {
            bail!("{} exists but is not a file", dst.display());
        }
        let existing = std::fs::read_to_string(dst)?;
        if existing == contents && fi.perms == mode {
            info!("file {} is already correct", dst.display());
            return Ok(());
        }
        std::fs::remove_file(dst)?;
    }

    info!("WRITE FILE: {} ({} bytes)", dst.display(), contents.len());
    let mut f = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(mode)
        .open(dst)
        .with_context(|| format!("creating {}", dst.display()))?;
    f.write_all(contents.as_bytes())?;
    f.flush()?;

    /*
     * The mode passed to open(2) is filtered by the umask.
     */
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/**
 * Make sure nothing exists at this path.  Returns true if something was
 * removed.
 */
pub fn removed<P: AsRef<Path>>(dst: P) -> Result<bool> {
    let dst = dst.as_ref();

    match check(dst)? {
        None => Ok(false),
        Some(fi) if fi.is_dir() => bail!("{} is a directory", dst.display()),
        Some(_) => {
            info!("REMOVE FILE: {}", dst.display());
            std::fs::remove_file(dst)?;
            Ok(true)
        }
    }
}
