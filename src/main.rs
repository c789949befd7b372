/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Context, Result};
use console::Style;
use inquire::{Confirm, InquireError, Password};
use log::*;
use slog::{Drain, Logger};
use slog_async::Async;
use slog_scope::crit;
use slog_scope::{set_global_logger, GlobalLoggerGuard};
use slog_syslog::Facility;
use slog_term::{CompactFormat, TermDecorator};
use std::path::PathBuf;
use std::process::exit;
use zfs_installer::config::{Profile, Settings};
use zfs_installer::crypt::Key;
use zfs_installer::error::{classify, ProvisionError};
use zfs_installer::host::System;
use zfs_installer::pipeline::{Installer, Report};
use zfs_installer::{find_template_root, signal};

fn init_slog_logging(use_syslog: bool) -> Result<GlobalLoggerGuard> {
    if use_syslog {
        let drain = slog_syslog::unix_3164(Facility::LOG_DAEMON)?.fuse();
        let logger = Logger::root(drain, slog::slog_o!());

        let scope_guard = set_global_logger(logger);
        let _log_guard = slog_stdlog::init()?;

        Ok(scope_guard)
    } else {
        let decorator = TermDecorator::new().stdout().build();
        let drain = CompactFormat::new(decorator).build().fuse();
        let drain = Async::new(drain).build().fuse();
        let logger = Logger::root(drain, slog::slog_o!());

        let scope_guard = set_global_logger(logger);
        let _log_guard = slog_stdlog::init()?;

        Ok(scope_guard)
    }
}

type Command = fn(&getopts::Matches) -> Result<()>;

fn main() -> Result<()> {
    let cmd = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("missing command name (install, plan or verify)"))?;

    let mut opts = getopts::Options::new();
    opts.parsing_style(getopts::ParsingStyle::StopAtFirstFree);

    fn usage(opts: &getopts::Options) {
        let s = opts.usage("zfs-installer install|plan|verify [options]");
        println!("{}", s);
    }

    opts.optflag("h", "help", "print this help");
    opts.optflag("L", "syslog", "log to syslog rather than the terminal");
    opts.optopt("c", "config", "JSON installation profile", "FILE");
    opts.optopt("p", "pool", "pool name (default rpool)", "POOL");
    opts.optopt("R", "root", "installation root (default /mnt)", "DIR");

    let f: Command = match cmd.as_str() {
        "install" | "plan" => {
            opts.optmulti(
                "d",
                "disk",
                "target disk, preferably /dev/disk/by-id/...",
                "DISK",
            );
            opts.optopt("H", "hostname", "host name of the new system", "NAME");
            opts.optopt("u", "username", "first user of the new system", "USER");
            opts.optopt("s", "swap", "swap size per disk in GiB (0 for none)", "GIB");
            opts.optflag("e", "encrypt", "encrypt swap and pool devices");
            opts.optopt("k", "keyfile", "file holding the encryption passphrase", "FILE");
            opts.optopt("T", "templates", "directory for templates", "DIR");

            if cmd == "install" {
                opts.optflag("y", "yes", "do not ask before destroying disks");
                run_install
            } else {
                run_plan
            }
        }
        "verify" => run_verify,
        "-h" | "--help" | "help" => {
            usage(&opts);
            return Ok(());
        }
        n => {
            usage(&opts);
            bail!("invalid command: {}", n);
        }
    };

    let mat = match opts.parse(std::env::args().skip(2)) {
        Ok(mat) => mat,
        Err(e) => {
            usage(&opts);
            bail!("invalid options: {:?}", e);
        }
    };

    if mat.opt_present("h") {
        usage(&opts);
        return Ok(());
    }

    let guard = init_slog_logging(mat.opt_present("L"))?;

    if let Err(e) = f(&mat) {
        crit!("fatal error: {:?}", e);
        banner_failure(&e);
        /*
         * Dropping the guard flushes the asynchronous drain before we exit.
         */
        drop(guard);
        exit(1);
    }

    Ok(())
}

fn opt_present(mat: &getopts::Matches, n: &str) -> bool {
    mat.opt_defined(n) && mat.opt_present(n)
}

fn opt_str(mat: &getopts::Matches, n: &str) -> Option<String> {
    if mat.opt_defined(n) {
        mat.opt_str(n)
    } else {
        None
    }
}

/**
 * Lay the command line over the profile.
 */
fn settings(mat: &getopts::Matches) -> Result<Settings> {
    let profile = match mat.opt_str("c") {
        Some(p) => Profile::load(&p)?,
        None => Profile::default(),
    };
    let mut s = Settings::from_profile(&profile)?;

    if mat.opt_defined("d") {
        s.disks = mat.opt_strs("d");
    }
    if let Some(h) = opt_str(mat, "H") {
        s.hostname = h;
    }
    if let Some(u) = opt_str(mat, "u") {
        s.username = u;
    }
    if let Some(gib) = opt_str(mat, "s") {
        let gib: u64 = gib.trim().parse().map_err(|_| {
            ProvisionError::config(format!("swap size \"{}\" is not a number of GiB", gib))
        })?;
        s.set_swap_gib(gib)?;
    }
    if opt_present(mat, "e") {
        s.encrypt = true;
    }
    if let Some(k) = opt_str(mat, "k") {
        s.keyfile = Some(PathBuf::from(k));
    }
    if let Some(p) = mat.opt_str("p") {
        s.pool = p;
    }
    if let Some(r) = mat.opt_str("R") {
        s.root = PathBuf::from(r);
    }
    s.template_root = find_template_root(opt_str(mat, "T"))?;
    s.yes = opt_present(mat, "y");

    Ok(s)
}

fn heading(text: &str) {
    println!("\n{}", Style::new().bold().apply_to(text));
}

fn banner_failure(e: &anyhow::Error) {
    let kind = classify(e).map(|pe| pe.kind()).unwrap_or("Error");
    println!(
        "\n{} {}",
        Style::new().bold().red().apply_to("INSTALLATION FAILED"),
        Style::new().red().apply_to(format!("({}): {:#}", kind, e))
    );
}

/*
 * Escape or ^C at a prompt is the operator backing out, not a failure.
 */
fn answered<T>(r: std::result::Result<T, InquireError>, what: &str) -> Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(InquireError::OperationCanceled) | Err(InquireError::OperationInterrupted) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", what)),
    }
}

fn passphrase(s: &Settings) -> Result<Option<Key>> {
    if let Some(p) = s.keyfile.as_deref() {
        return Key::from_file(p).map(Some);
    }

    let Some(p) = answered(
        Password::new("Encryption passphrase:")
            .with_help_message("used for swap and every pool device")
            .prompt(),
        "passphrase",
    )?
    else {
        return Ok(None);
    };
    if p.is_empty() {
        return Err(ProvisionError::config("the passphrase may not be empty"));
    }
    Ok(Some(Key::new(p.into_bytes())))
}

fn print_report(s: &Settings, r: &Report) {
    heading("Installed");
    for a in r.arrays.iter() {
        println!("    array   {} -> {}", a.spec.path().display(), a.device.display());
    }
    for v in r.volumes.iter() {
        println!("    luks    {} on {}", v.name, v.backing.display());
    }
    for f in r.filesystems.iter() {
        println!(
            "    {:<7} {} UUID={}",
            f.kind.fstype(),
            f.device.display(),
            f.uuid
        );
    }
    for d in r.datasets.iter() {
        println!("    dataset {}", d);
    }
    println!(
        "\n{} {} is ready; boot from any of the target disks.",
        Style::new().bold().green().apply_to("SUCCESS"),
        s.hostname
    );
}

fn run_install(mat: &getopts::Matches) -> Result<()> {
    let s = settings(mat)?;
    let host = System;
    let inst = Installer::new(&host, &s);

    inst.require_privilege()?;
    signal::install()?;

    let b = inst.blueprint()?;
    heading("This installation will:");
    for l in b.describe(&s) {
        println!("  {}", l);
    }
    println!();

    if !s.yes {
        let go = answered(
            Confirm::new("Destroy all data on these disks and install?")
                .with_default(false)
                .with_help_message("type y to continue; anything else leaves the disks alone")
                .prompt(),
            "confirmation",
        )?;
        if go != Some(true) {
            println!("Nothing was changed.");
            return Ok(());
        }
    }

    let key = if s.encrypt {
        match passphrase(&s)? {
            Some(k) => Some(k),
            None => {
                println!("Nothing was changed.");
                return Ok(());
            }
        }
    } else {
        None
    };

    info!("installing {} onto {} disk(s)", s.hostname, b.disks.len());
    let r = inst.install(&b, key.as_ref())?;
    print_report(&s, &r);
    Ok(())
}

fn run_plan(mat: &getopts::Matches) -> Result<()> {
    let s = settings(mat)?;
    let host = System;
    let b = Installer::new(&host, &s).blueprint()?;

    heading("Plan (nothing has been changed):");
    for l in b.describe(&s) {
        println!("  {}", l);
    }
    for p in b.plans.iter() {
        heading(&format!("{}:", p.disk.id.display()));
        for pp in p.partitions.iter() {
            println!(
                "    {:<24} sectors {:>12} - {:>12}",
                p.disk.partition(pp.spec.index).display().to_string(),
                pp.start,
                pp.end
            );
        }
    }
    Ok(())
}

fn run_verify(mat: &getopts::Matches) -> Result<()> {
    let s = settings(mat)?;
    let host = System;
    let residual = Installer::new(&host, &s).verify()?;

    if !residual.is_empty() {
        for r in residual.iter() {
            warn!("{}", r);
        }
        return Err(ProvisionError::ResidualState(residual).into());
    }

    println!(
        "{} nothing is mounted under {} and pool {} is not imported",
        Style::new().bold().green().apply_to("CLEAN"),
        s.root.display(),
        s.pool
    );
    Ok(())
}
