/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::cleanup::{Cleanup, Inverse};
use crate::ensure;
use crate::expand::{self, Expansion};
use crate::host::Host;
use anyhow::{Context, Result};
use log::*;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const TEMPLATE_NAME: &str = "second-stage.sh";

const BUILTIN: &str = include_str!("../templates/second-stage.sh");

/**
 * Everything the second stage script is told about the system it runs in.
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct StageParams {
    pub hostname: String,
    pub username: String,
    pub pool: String,
    pub root_dataset: String,
    /** Whole disks that carry an EFI system partition. */
    pub efi_devices: Vec<String>,
    pub encrypted: bool,
    pub arrays: bool,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub source: String,
    expansion: Expansion,
}

impl Script {
    pub fn parse(source: &str, text: &str) -> Result<Script> {
        let expansion =
            Expansion::parse(text).with_context(|| format!("parsing template {}", source))?;
        Ok(Script {
            source: source.to_string(),
            expansion,
        })
    }

    /**
     * Use the template from the template directory if there is one there,
     * otherwise the one built into the program.
     */
    pub fn load(template_root: Option<&Path>) -> Result<Script> {
        if let Some(dir) = template_root {
            let p = dir.join(TEMPLATE_NAME);
            if let Some(fi) = ensure::check(&p)? {
                if fi.is_file() {
                    let text = std::fs::read_to_string(&p)
                        .with_context(|| format!("reading {}", p.display()))?;
                    return Script::parse(&p.display().to_string(), &text);
                }
            }
            debug!("no {} in {}; using built-in", TEMPLATE_NAME, dir.display());
        }
        Script::parse("built-in", BUILTIN)
    }

    /**
     * Fill in every placeholder.  A placeholder without a parameter is a
     * configuration error, found before anything is written or run.
     */
    pub fn render(&self, params: &StageParams) -> Result<String> {
        self.expansion
            .evaluate(&expand::values_of(params)?)
            .with_context(|| format!("rendering template {}", self.source))
    }
}

/**
 * Write the script into the installed system and run it there.  The script
 * is removed again once it succeeds; on failure it stays until rollback.
 * Returns what the script printed, each line of which is also logged.
 */
pub fn execute(
    host: &dyn Host,
    root: &Path,
    text: &str,
    cleanup: &mut Cleanup,
) -> Result<Vec<String>> {
    let dir = root.join("root");
    ensure::directory(&dir, 0o700)?;

    let id = uuid::Uuid::new_v4().simple().to_string();
    let name = format!("second-stage-{}.sh", &id[..8]);
    let dst: PathBuf = dir.join(&name);
    ensure::filestr(text, &dst, 0o700)?;
    cleanup.register(
        "second stage script",
        Inverse::RemoveFile { path: dst.clone() },
    );

    let inside = format!("/root/{}", name);
    info!("RUN SECOND STAGE: chroot {} {}", root.display(), inside);
    let out = ensure::output(
        host,
        &["chroot", ensure::utf8(&root)?, "/bin/bash", &inside],
    )?;
    let transcript: Vec<String> = out
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect();
    for l in transcript.iter() {
        info!("second stage: {}", l);
    }

    ensure::removed(&dst)?;
    info!("second stage complete");
    Ok(transcript)
}
