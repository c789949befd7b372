/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

//! The seam between the pipeline and the machine it runs on.

use anyhow::{Context, Result};
use std::io::Write;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/*
 * Tools are run with a cleared environment.  This is the search path they
 * are given instead.
 */
const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone)]
pub struct Output {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

/**
 * A process with a working directory, root or open file beneath a mount
 * point.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub pid: i32,
    pub command: String,
}

pub trait Host {
    /**
     * Run a tool to completion.  A non-zero exit is not an error at this
     * level; callers decide what a failure means.  An Err is returned only
     * when the tool could not be started at all.
     */
    fn exec(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output>;

    /**
     * Resolve a path (following links) to a block device node.  Returns None
     * if nothing exists at the path or it is not a block device.
     */
    fn block_device(&self, path: &Path) -> Result<Option<PathBuf>>;

    fn mounts(&self) -> Result<Vec<MountEntry>>;

    fn holders(&self, path: &Path) -> Result<Vec<Holder>>;

    fn read_file(&self, path: &Path) -> Result<Option<String>>;

    fn settle(&self, delay: Duration);

    fn privileged(&self) -> bool;
}

/**
 * The host we are actually running on.
 */
pub struct System;

impl Host for System {
    fn exec(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output> {
        let (prog, rest) = args
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty command"))?;

        let mut cmd = Command::new(prog);
        cmd.env_clear()
            .env("PATH", SAFE_PATH)
            .env("LC_ALL", "C")
            .args(rest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("could not start {}", prog))?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload)?;
                stdin.flush()?;
            }
        }

        let out = child.wait_with_output()?;
        Ok(Output {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }

    fn block_device(&self, path: &Path) -> Result<Option<PathBuf>> {
        let real = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("resolving {}", path.display())),
        };

        let md = std::fs::metadata(&real)?;
        if md.file_type().is_block_device() {
            Ok(Some(real))
        } else {
            Ok(None)
        }
    }

    fn mounts(&self) -> Result<Vec<MountEntry>> {
        let data = std::fs::read_to_string("/proc/self/mounts")?;
        Ok(parse_mounts(&data))
    }

    fn holders(&self, path: &Path) -> Result<Vec<Holder>> {
        let mut out = Vec::new();

        for p in procfs::process::all_processes()? {
            /*
             * Processes come and go while we walk the table, and we may not
             * be allowed to look at some of them.  Skip those.
             */
            let p = match p {
                Ok(p) => p,
                Err(_) => continue,
            };

            let mut holds = [p.cwd(), p.root()]
                .into_iter()
                .filter_map(|r| r.ok())
                .any(|d| d.starts_with(path));

            if !holds {
                if let Ok(fds) = p.fd() {
                    holds = fds.filter_map(|fd| fd.ok()).any(|fd| match fd.target {
                        procfs::process::FDTarget::Path(t) => t.starts_with(path),
                        _ => false,
                    });
                }
            }

            if holds {
                let command = p
                    .stat()
                    .map(|s| s.comm)
                    .unwrap_or_else(|_| "?".to_string());
                out.push(Holder {
                    pid: p.pid(),
                    command,
                });
            }
        }

        Ok(out)
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("reading {}", path.display())),
        }
    }

    fn settle(&self, delay: Duration) {
        std::thread::sleep(delay);
    }

    fn privileged(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }
}

/*
 * The kernel escapes space, tab, newline and backslash in the mount table as
 * three-digit octal sequences.
 */
fn unescape_mount_field(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' && i + 3 < b.len() {
            let oct = &b[i + 1..i + 4];
            if oct.iter().all(|c| (b'0'..=b'7').contains(c)) {
                let v = oct
                    .iter()
                    .fold(0u32, |acc, c| acc * 8 + u32::from(c - b'0'));
                if let Ok(v) = u8::try_from(v) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(b[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

pub fn parse_mounts(data: &str) -> Vec<MountEntry> {
    data.lines()
        .filter_map(|l| {
            let t = l.split_whitespace().collect::<Vec<_>>();
            if t.len() < 4 {
                return None;
            }
            Some(MountEntry {
                source: unescape_mount_field(t[0]),
                target: PathBuf::from(unescape_mount_field(t[1])),
                fstype: t[2].to_string(),
                options: t[3].to_string(),
            })
        })
        .collect()
}
