/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::Result;
use log::*;
use std::path::PathBuf;

pub mod cleanup;
pub mod config;
pub mod crypt;
pub mod disk;
pub mod ensure;
pub mod error;
pub mod expand;
pub mod format;
pub mod fstab;
pub mod host;
pub mod mount;
pub mod partition;
pub mod pipeline;
pub mod plan;
pub mod pool;
pub mod raid;
pub mod signal;
pub mod stage;

#[cfg(test)]
pub mod testing;

/**
 * Locate the directory that may hold an override for the second stage
 * template.  Returns None when there is no such directory, in which case the
 * template built into the program is used.
 */
pub fn find_template_root(arg: Option<String>) -> Result<Option<PathBuf>> {
    Ok(if let Some(arg) = arg {
        let p = PathBuf::from(&arg);
        if p.is_relative() {
            let mut cd = std::env::current_dir()?;
            cd.push(&p);
            Some(cd)
        } else {
            Some(p)
        }
    } else {
        /*
         * If no template root is specified, we look in the natural location:
         * either up one, if we are deployed in a "bin" directory, or up to the
         * project root if we reside in a Cargo "target" directory.
         */
        match jmclib::dirs::rootpath("templates") {
            Ok(p) => Some(p),
            Err(e) => {
                debug!("no template directory ({}); using built-in", e);
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_template_root_is_anchored() {
        let p = find_template_root(Some("tmpl".to_string()))
            .unwrap()
            .unwrap();
        assert!(p.is_absolute());
        assert!(p.ends_with("tmpl"));

        let p = find_template_root(Some("/opt/tmpl".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(p, PathBuf::from("/opt/tmpl"));
    }
}
