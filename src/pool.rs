/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use crate::cleanup::{Cleanup, Inverse};
use crate::ensure;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::mount;
use anyhow::{bail, Result};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/*
 * A pool that stays busy for this long after its datasets are unmounted is
 * not going to become idle on its own.
 */
const EXPORT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Redundancy {
    #[default]
    Auto,
    Single,
    Mirror,
    Raidz1,
    Raidz2,
}

impl Redundancy {
    /**
     * Pick a concrete layout for this many devices, or check that an
     * explicit choice makes sense for them.
     */
    pub fn resolve(self, ndevs: usize) -> Result<Redundancy> {
        let r = match self {
            Redundancy::Auto => match ndevs {
                0 => return Err(ProvisionError::config("no devices for the pool")),
                1 => Redundancy::Single,
                2 => Redundancy::Mirror,
                _ => Redundancy::Raidz1,
            },
            r => r,
        };

        let min = match r {
            Redundancy::Auto | Redundancy::Single => 1,
            Redundancy::Mirror => 2,
            Redundancy::Raidz1 => 3,
            Redundancy::Raidz2 => 4,
        };
        if ndevs < min || (r == Redundancy::Single && ndevs != 1) {
            return Err(ProvisionError::config(format!(
                "pool redundancy {:?} does not fit {} device(s)",
                r, ndevs
            )));
        }
        Ok(r)
    }

    fn vdev(&self) -> Option<&'static str> {
        match self {
            Redundancy::Mirror => Some("mirror"),
            Redundancy::Raidz1 => Some("raidz1"),
            Redundancy::Raidz2 => Some("raidz2"),
            Redundancy::Auto | Redundancy::Single => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub devices: Vec<PathBuf>,
    pub redundancy: Redundancy,
    /** Pool properties, "zpool create -o". */
    pub properties: Vec<(String, String)>,
    /** Properties of the root dataset, "zpool create -O". */
    pub fs_properties: Vec<(String, String)>,
}

fn props(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl PoolSpec {
    pub fn new(name: &str, devices: Vec<PathBuf>, redundancy: Redundancy, ashift: u8) -> PoolSpec {
        let ashift = ashift.to_string();
        PoolSpec {
            name: name.to_string(),
            devices,
            redundancy,
            properties: props(&[("ashift", &ashift), ("autotrim", "on")]),
            fs_properties: props(&[
                ("acltype", "posixacl"),
                ("xattr", "sa"),
                ("compression", "lz4"),
                ("dnodesize", "auto"),
                ("normalization", "formD"),
                ("relatime", "on"),
                ("canmount", "off"),
                ("mountpoint", "none"),
            ]),
        }
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    let ok = name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.:".contains(c))
        && !["mirror", "raidz", "draid", "spare", "log"]
            .iter()
            .any(|r| name.starts_with(r));
    if !ok {
        return Err(ProvisionError::config(format!(
            "\"{}\" is not a usable pool name",
            name
        )));
    }
    Ok(())
}

pub fn zpool_set(host: &dyn Host, pool: &str, n: &str, v: &str) -> Result<()> {
    if pool.contains('/') {
        bail!("no / allowed here");
    }

    info!("SET POOL PROPERTY ON {}: {} = {}", pool, n, v);
    ensure::run(host, &["zpool", "set", &format!("{}={}", n, v), pool])
}

pub fn imported(host: &dyn Host, name: &str) -> Result<bool> {
    let out = ensure::output(host, &["zpool", "list", "-H", "-o", "name"])?;
    Ok(out.lines().any(|l| l.trim() == name))
}

/**
 * Export the pool if it is imported.  A busy pool is retried a bounded number
 * of times before giving up.  Returns true if the pool was exported.
 */
pub fn export(host: &dyn Host, name: &str) -> Result<bool> {
    if name.contains('@') || name.contains('/') {
        bail!("no @ or / allowed here");
    }
    if !imported(host, name)? {
        debug!("pool {} is not imported", name);
        return Ok(false);
    }

    info!("EXPORT POOL: {}", name);

    for attempt in 1..=EXPORT_ATTEMPTS {
        let out = host.exec(&["zpool", "export", name], None)?;
        if out.success() {
            return Ok(true);
        }

        if out.stderr.trim().ends_with("pool is busy") {
            warn!(
                "pool is busy... retrying ({}/{})...",
                attempt, EXPORT_ATTEMPTS
            );
            host.settle(Duration::from_secs(1));
            continue;
        }
        return Err(ProvisionError::ToolInvocation {
            command: format!("zpool export {}", name),
            status: out.status,
            stderr: out.stderr.trim().to_string(),
        }
        .into());
    }

    Err(ProvisionError::verify(format!(
        "pool {} is still busy after {} export attempts",
        name, EXPORT_ATTEMPTS
    )))
}

/**
 * Import without mounting anything, under an alternate root.
 */
pub fn import(host: &dyn Host, name: &str, root: &Path) -> Result<()> {
    info!("IMPORT POOL: {} at {}", name, root.display());
    ensure::run(
        host,
        &["zpool", "import", "-N", "-R", ensure::utf8(&root)?, name],
    )
}

/**
 * Create the pool, then export it and import it again under the alternate
 * root.  The pool must not remember the provisioning host's root: the
 * installed system imports it at "/".
 */
pub fn create_pool(host: &dyn Host, spec: &PoolSpec, root: &Path, cleanup: &mut Cleanup) -> Result<()> {
    validate_name(&spec.name)?;
    let redundancy = spec.redundancy.resolve(spec.devices.len())?;

    for d in spec.devices.iter() {
        if host.block_device(d)?.is_none() {
            return Err(ProvisionError::verify(format!(
                "pool device {} is not ready",
                d.display()
            )));
        }
    }

    let mut args: Vec<String> = vec!["zpool".into(), "create".into(), "-f".into()];
    for (k, v) in spec.properties.iter() {
        args.push("-o".into());
        args.push(format!("{}={}", k, v));
    }
    for (k, v) in spec.fs_properties.iter() {
        args.push("-O".into());
        args.push(format!("{}={}", k, v));
    }
    args.push("-R".into());
    args.push(ensure::utf8(&root)?.into());
    args.push(spec.name.clone());
    if let Some(v) = redundancy.vdev() {
        args.push(v.into());
    }
    for d in spec.devices.iter() {
        args.push(ensure::utf8(d)?.into());
    }

    info!(
        "CREATE POOL: {} ({:?} over {} device(s))",
        spec.name,
        redundancy,
        spec.devices.len()
    );
    let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    ensure::run(host, &args)?;
    cleanup.register(
        format!("pool {}", spec.name),
        Inverse::ExportPool {
            pool: spec.name.clone(),
        },
    );

    export(host, &spec.name)?;
    import(host, &spec.name, root)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanMount {
    On,
    Off,
    NoAuto,
}

impl CanMount {
    fn value(&self) -> &'static str {
        match self {
            CanMount::On => "on",
            CanMount::Off => "off",
            CanMount::NoAuto => "noauto",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /** The name below the pool, e.g. "var/log". */
    pub name: String,
    /** An explicit mount point; None inherits from the parent. */
    pub mountpoint: Option<String>,
    pub canmount: CanMount,
    pub properties: Vec<(String, String)>,
}

impl DatasetSpec {
    /**
     * A node that only exists to hold children and properties.
     */
    pub fn container(name: &str, mountpoint: &str) -> DatasetSpec {
        DatasetSpec {
            name: name.to_string(),
            mountpoint: Some(mountpoint.to_string()),
            canmount: CanMount::Off,
            properties: Vec::new(),
        }
    }

    pub fn mounted(name: &str, mountpoint: Option<&str>) -> DatasetSpec {
        DatasetSpec {
            name: name.to_string(),
            mountpoint: mountpoint.map(str::to_string),
            canmount: CanMount::On,
            properties: Vec::new(),
        }
    }

    pub fn canmount(mut self, c: CanMount) -> DatasetSpec {
        self.canmount = c;
        self
    }

    pub fn with(mut self, n: &str, v: &str) -> DatasetSpec {
        self.properties.push((n.to_string(), v.to_string()));
        self
    }

    fn parent(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(p, _)| p)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeOptions {
    pub data: bool,
    pub vm: bool,
    pub home_quota: Option<String>,
    pub data_quota: Option<String>,
}

/**
 * The dataset layout of an installed system.
 */
pub fn default_tree(hostname: &str, o: &TreeOptions) -> Vec<DatasetSpec> {
    let mut home = DatasetSpec::mounted("home", Some("/home"));
    if let Some(q) = o.home_quota.as_deref() {
        home = home.with("quota", q);
    }

    let mut t = vec![
        DatasetSpec::container("ROOT", "none"),
        DatasetSpec::mounted(&format!("ROOT/{}", hostname), Some("/")).canmount(CanMount::NoAuto),
        home,
        DatasetSpec::container("var", "/var"),
        DatasetSpec::mounted("var/log", None),
        DatasetSpec::mounted("var/cache", None),
        DatasetSpec::mounted("var/tmp", None).with("com.sun:auto-snapshot", "false"),
    ];

    if o.data {
        let mut data = DatasetSpec::mounted("data", Some("/data"));
        if let Some(q) = o.data_quota.as_deref() {
            data = data.with("quota", q);
        }
        t.push(data);
    }
    if o.vm {
        t.push(
            DatasetSpec::mounted("vm", Some("/var/lib/libvirt/images")).with("recordsize", "64K"),
        );
    }
    t
}

/**
 * Where a dataset ends up, following inheritance within the tree.  None for
 * datasets that are never mounted.
 */
pub fn effective_mountpoint(tree: &[DatasetSpec], name: &str) -> Option<PathBuf> {
    let mut suffix: Vec<&str> = Vec::new();
    let mut cur = name;
    loop {
        let ds = tree.iter().find(|d| d.name == cur)?;
        if let Some(mp) = ds.mountpoint.as_deref() {
            if mp == "none" || mp == "legacy" {
                return None;
            }
            let mut p = PathBuf::from(mp);
            for s in suffix.iter().rev() {
                p.push(s);
            }
            return Some(p);
        }
        let (parent, leaf) = cur.rsplit_once('/')?;
        suffix.push(leaf);
        cur = parent;
    }
}

/**
 * Parents must come before their children, and names must be unique.
 */
pub fn validate_tree(tree: &[DatasetSpec]) -> Result<()> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for ds in tree.iter() {
        if ds.name.is_empty() || ds.name.starts_with('/') || ds.name.contains('@') {
            return Err(ProvisionError::config(format!(
                "bad dataset name \"{}\"",
                ds.name
            )));
        }
        if let Some(p) = ds.parent() {
            if !seen.contains(p) {
                return Err(ProvisionError::config(format!(
                    "dataset {} comes before its parent {}",
                    ds.name, p
                )));
            }
        }
        if !seen.insert(&ds.name) {
            return Err(ProvisionError::config(format!(
                "dataset {} is listed twice",
                ds.name
            )));
        }
    }
    Ok(())
}

/**
 * The datasets that get mounted, parents first.
 */
pub fn mount_order(tree: &[DatasetSpec]) -> Vec<(String, PathBuf)> {
    let mut m: Vec<(String, PathBuf)> = tree
        .iter()
        .filter(|ds| ds.canmount != CanMount::Off)
        .filter_map(|ds| effective_mountpoint(tree, &ds.name).map(|mp| (ds.name.clone(), mp)))
        .collect();
    m.sort_by_key(|(_, mp)| mp.components().count());
    m
}

/**
 * Create the tree without mounting anything, then mount what should be
 * mounted in order.  Returns the full names of the mounted datasets.
 */
pub fn create_datasets(
    host: &dyn Host,
    pool: &str,
    tree: &[DatasetSpec],
    cleanup: &mut Cleanup,
) -> Result<Vec<String>> {
    validate_tree(tree)?;

    for ds in tree.iter() {
        let full = format!("{}/{}", pool, ds.name);
        let mut args: Vec<String> = vec!["zfs".into(), "create".into(), "-u".into()];
        args.push("-o".into());
        args.push(format!("canmount={}", ds.canmount.value()));
        if let Some(mp) = ds.mountpoint.as_deref() {
            args.push("-o".into());
            args.push(format!("mountpoint={}", mp));
        }
        for (k, v) in ds.properties.iter() {
            args.push("-o".into());
            args.push(format!("{}={}", k, v));
        }
        args.push(full.clone());

        info!("CREATE DATASET: {}", full);
        let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        ensure::run(host, &args)?;
    }

    let order: Vec<String> = mount_order(tree)
        .into_iter()
        .map(|(n, _)| format!("{}/{}", pool, n))
        .collect();
    cleanup.register(
        format!("datasets of {}", pool),
        Inverse::UnmountDatasets {
            datasets: order.clone(),
        },
    );

    for full in order.iter() {
        info!("MOUNT DATASET: {}", full);
        ensure::run(host, &["zfs", "mount", full])?;
    }
    Ok(order)
}

/**
 * Unmount one dataset if it is mounted.  A busy dataset is reported along
 * with whatever is holding it.
 */
pub fn unmount_dataset(host: &dyn Host, full: &str) -> Result<()> {
    let Some(m) = host.mounts()?.into_iter().find(|m| m.source == full) else {
        debug!("dataset {} is not mounted", full);
        return Ok(());
    };

    info!("UNMOUNT DATASET: {}", full);
    let out = host.exec(&["zfs", "unmount", full], None)?;
    if !out.success() {
        return Err(mount::busy(host, &m.target, out.stderr.trim()));
    }
    Ok(())
}

/**
 * The cache file the pool uses while it is imported here.
 */
pub const LIVE_CACHE: &str = "/etc/zfs/zpool.cache";

/**
 * Mark the root dataset as the one to boot, and give the installed system a
 * cache file to import the pool from.  Export drops the pool from whatever
 * cache file it is using, so the copy is taken now, while it is imported.
 */
pub fn set_boot_properties(
    host: &dyn Host,
    pool: &str,
    root: &Path,
    bootfs: &str,
    cleanup: &mut Cleanup,
) -> Result<()> {
    zpool_set(host, pool, "cachefile", LIVE_CACHE)?;
    zpool_set(host, pool, "bootfs", &format!("{}/{}", pool, bootfs))?;

    let dir = root.join("etc/zfs");
    ensure::directory(&dir, 0o755)?;
    let cache = dir.join("zpool.cache");
    info!("COPY POOL CACHE: {} -> {}", LIVE_CACHE, cache.display());
    ensure::run(host, &["cp", LIVE_CACHE, ensure::utf8(&cache)?])?;
    cleanup.register(
        format!("pool cache {}", pool),
        Inverse::RemoveFile { path: cache },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use crate::testing::FakeHost;

    fn devices(host: &FakeHost) -> Vec<PathBuf> {
        ["/dev/sda", "/dev/sdb", "/dev/nvme0n1"]
            .iter()
            .map(|d| host.block_device(Path::new(d)).unwrap().unwrap())
            .collect()
    }

    #[test]
    fn redundancy_follows_device_count() {
        assert_eq!(Redundancy::Auto.resolve(1).unwrap(), Redundancy::Single);
        assert_eq!(Redundancy::Auto.resolve(2).unwrap(), Redundancy::Mirror);
        assert_eq!(Redundancy::Auto.resolve(3).unwrap(), Redundancy::Raidz1);
        assert_eq!(Redundancy::Mirror.resolve(3).unwrap(), Redundancy::Mirror);

        let e = Redundancy::Raidz2.resolve(3).unwrap_err();
        assert_eq!(classify(&e).unwrap().kind(), "ConfigurationError");
        assert!(Redundancy::Single.resolve(2).is_err());
        assert!(Redundancy::Auto.resolve(0).is_err());
    }

    #[test]
    fn pool_names() {
        assert!(validate_name("rpool").is_ok());
        assert!(validate_name("tank_1").is_ok());
        assert!(validate_name("mirror0").is_err());
        assert!(validate_name("1pool").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn pool_is_reimported_under_root() {
        let host = FakeHost::three_disks();
        let mut c = Cleanup::new(&host, Path::new("/mnt"));
        let spec = PoolSpec::new("rpool", devices(&host), Redundancy::Auto, 12);

        create_pool(&host, &spec, Path::new("/mnt"), &mut c).unwrap();

        let cmds = host.commands_matching("zpool");
        assert!(cmds[0].starts_with("zpool create -f -o ashift=12 -o autotrim=on -O acltype=posixacl"));
        assert!(cmds[0].ends_with("-R /mnt rpool raidz1 /dev/sda /dev/sdb /dev/nvme0n1"));
        assert!(cmds.contains(&"zpool export rpool".to_string()));
        assert_eq!(cmds.last().unwrap(), "zpool import -N -R /mnt rpool");
        assert_eq!(host.imported(), vec!["rpool"]);

        c.commit().unwrap();
        assert!(host.imported().is_empty());
    }

    #[test]
    fn busy_export_is_bounded() {
        let host = FakeHost::three_disks();
        host.import_pool("rpool");
        host.busy_pool("rpool");

        let e = export(&host, "rpool").unwrap_err();
        assert_eq!(classify(&e).unwrap().kind(), "VerificationError");
        assert_eq!(
            host.commands_matching("zpool export").len(),
            EXPORT_ATTEMPTS as usize
        );
        assert_eq!(host.settles(), EXPORT_ATTEMPTS);
    }

    #[test]
    fn unprepared_devices_are_refused() {
        let host = FakeHost::three_disks();
        let mut c = Cleanup::new(&host, Path::new("/mnt"));
        let spec = PoolSpec::new(
            "rpool",
            vec![PathBuf::from("/dev/mapper/luks-missing")],
            Redundancy::Auto,
            12,
        );
        let e = create_pool(&host, &spec, Path::new("/mnt"), &mut c).unwrap_err();
        assert_eq!(classify(&e).unwrap().kind(), "VerificationError");
        assert!(host.commands().is_empty());
        c.commit().unwrap();
    }

    #[test]
    fn default_tree_shape() {
        let t = default_tree("ws", &TreeOptions::default());
        validate_tree(&t).unwrap();

        assert_eq!(effective_mountpoint(&t, "ROOT"), None);
        assert_eq!(effective_mountpoint(&t, "ROOT/ws"), Some(PathBuf::from("/")));
        assert_eq!(effective_mountpoint(&t, "var/log"), Some(PathBuf::from("/var/log")));

        let order: Vec<String> = mount_order(&t).into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            order,
            vec!["ROOT/ws", "home", "var/log", "var/cache", "var/tmp"]
        );
    }

    #[test]
    fn optional_datasets() {
        let o = TreeOptions {
            data: true,
            vm: true,
            home_quota: Some("100G".to_string()),
            data_quota: None,
        };
        let t = default_tree("ws", &o);
        validate_tree(&t).unwrap();
        let vm = t.iter().find(|d| d.name == "vm").unwrap();
        assert!(vm.properties.contains(&("recordsize".to_string(), "64K".to_string())));
        let home = t.iter().find(|d| d.name == "home").unwrap();
        assert_eq!(home.properties, vec![("quota".to_string(), "100G".to_string())]);
    }

    #[test]
    fn children_before_parents_are_rejected() {
        let t = vec![
            DatasetSpec::mounted("var/log", None),
            DatasetSpec::container("var", "/var"),
        ];
        let e = validate_tree(&t).unwrap_err();
        assert_eq!(classify(&e).unwrap().kind(), "ConfigurationError");
    }

    #[test]
    fn datasets_are_created_unmounted_then_mounted_in_order() {
        let host = FakeHost::three_disks();
        let mut c = Cleanup::new(&host, Path::new("/mnt"));
        let spec = PoolSpec::new("rpool", devices(&host), Redundancy::Auto, 12);
        create_pool(&host, &spec, Path::new("/mnt"), &mut c).unwrap();
        host.clear_log();

        let t = default_tree("ws", &TreeOptions::default());
        let mounted = create_datasets(&host, "rpool", &t, &mut c).unwrap();
        assert_eq!(mounted[0], "rpool/ROOT/ws");

        let creates = host.commands_matching("zfs create");
        assert_eq!(creates.len(), t.len());
        assert!(creates.iter().all(|l| l.starts_with("zfs create -u ")));
        assert_eq!(
            creates[1],
            "zfs create -u -o canmount=noauto -o mountpoint=/ rpool/ROOT/ws"
        );
        assert_eq!(
            host.dataset_property("rpool/var", "canmount").as_deref(),
            Some("off")
        );

        assert_eq!(
            host.mounted(),
            vec![
                PathBuf::from("/mnt"),
                PathBuf::from("/mnt/home"),
                PathBuf::from("/mnt/var/log"),
                PathBuf::from("/mnt/var/cache"),
                PathBuf::from("/mnt/var/tmp"),
            ]
        );

        c.abort().unwrap();
        assert!(host.mounted().is_empty());
        assert!(host.imported().is_empty());
    }
}
