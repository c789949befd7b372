/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

//! An in-memory stand-in for the block device toolkit, used by the unit
//! tests.  It keeps just enough state (device nodes, md arrays, LUKS
//! mappers, pools, datasets, the mount table) to answer the questions the
//! pipeline asks, and it records every command it is given.

use crate::host::{Holder, Host, MountEntry, Output};
use anyhow::{bail, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Default)]
struct Array {
    name: String,
    level: String,
    members: Vec<PathBuf>,
}

#[derive(Default)]
struct State {
    log: Vec<String>,
    links: BTreeMap<PathBuf, PathBuf>,
    devices: BTreeSet<PathBuf>,
    sizes: BTreeMap<PathBuf, (u64, u32, u32)>,
    pending: BTreeMap<PathBuf, Vec<u32>>,
    mounts: Vec<MountEntry>,
    arrays: BTreeMap<String, Array>,
    next_md: u32,
    superblocks: BTreeSet<PathBuf>,
    luks: BTreeMap<PathBuf, String>,
    mappers: BTreeSet<String>,
    pools: BTreeMap<String, PathBuf>,
    datasets: BTreeMap<String, BTreeMap<String, String>>,
    fail: Vec<String>,
    busy: BTreeSet<PathBuf>,
    busy_pools: BTreeSet<String>,
    cachefiles: BTreeMap<String, PathBuf>,
    caches: BTreeMap<PathBuf, BTreeSet<String>>,
    holders: Vec<Holder>,
    degraded: BTreeSet<String>,
    hold_partitions: bool,
    settles: u32,
    unprivileged: bool,
}

pub struct FakeHost {
    st: RefCell<State>,
}

/**
 * Deterministic UUIDs so that repeated runs see the same identifiers.
 */
pub fn fake_uuid(seed: &str) -> String {
    let mut h: u64 = 0xcbf29ce484222325;
    let mut bytes = [0u8; 16];
    for (i, b) in seed.bytes().chain("salt".bytes()).enumerate() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x100000001b3);
        bytes[i % 16] ^= (h >> 24) as u8;
    }
    uuid::Uuid::from_bytes(bytes).as_hyphenated().to_string()
}

fn ok(stdout: &str) -> Result<Output> {
    Ok(Output {
        status: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

fn fail(status: i32, stderr: &str) -> Result<Output> {
    Ok(Output {
        status,
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

fn partition_node(dev: &Path, n: u32) -> PathBuf {
    let s = dev.to_str().unwrap();
    if s.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", s, n))
    } else {
        PathBuf::from(format!("{}{}", s, n))
    }
}

impl FakeHost {
    pub fn new() -> FakeHost {
        FakeHost {
            st: RefCell::new(State {
                next_md: 127,
                ..Default::default()
            }),
        }
    }

    /**
     * Add a disk with a by-id link, a kernel device node and a size.
     */
    pub fn with_disk(self, id: &str, dev: &str, bytes: u64) -> FakeHost {
        self.with_disk_geometry(id, dev, bytes, 512, 4096)
    }

    pub fn with_disk_geometry(
        self,
        id: &str,
        dev: &str,
        bytes: u64,
        logical: u32,
        physical: u32,
    ) -> FakeHost {
        {
            let mut st = self.st.borrow_mut();
            st.links.insert(PathBuf::from(id), PathBuf::from(dev));
            st.devices.insert(PathBuf::from(dev));
            st.sizes
                .insert(PathBuf::from(dev), (bytes, logical, physical));
        }
        self
    }

    pub fn three_disks() -> FakeHost {
        FakeHost::new()
            .with_disk("/dev/disk/by-id/ata-DISK_A", "/dev/sda", 64 * GIB)
            .with_disk("/dev/disk/by-id/ata-DISK_B", "/dev/sdb", 64 * GIB)
            .with_disk("/dev/disk/by-id/nvme-DISK_C", "/dev/nvme0n1", 64 * GIB)
    }

    /**
     * Any command whose line starts with this prefix fails.
     */
    pub fn fail_on(&self, prefix: &str) {
        self.st.borrow_mut().fail.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.st.borrow_mut().fail.clear();
    }

    pub fn busy(&self, target: &str, holder: Holder) {
        let mut st = self.st.borrow_mut();
        st.busy.insert(PathBuf::from(target));
        st.holders.push(holder);
    }

    pub fn busy_pool(&self, name: &str) {
        self.st.borrow_mut().busy_pools.insert(name.to_string());
    }

    pub fn degrade(&self, array: &str) {
        self.st.borrow_mut().degraded.insert(array.to_string());
    }

    pub fn hold_partitions(&self) {
        self.st.borrow_mut().hold_partitions = true;
    }

    pub fn unprivileged(&self) {
        self.st.borrow_mut().unprivileged = true;
    }

    /**
     * Pretend an earlier aborted run left an array assembled.
     */
    pub fn stale_array(&self, name: &str, members: &[&str]) {
        let mut st = self.st.borrow_mut();
        let kname = format!("md{}", st.next_md);
        st.next_md -= 1;
        let members: Vec<PathBuf> = members.iter().map(PathBuf::from).collect();
        for m in members.iter() {
            st.superblocks.insert(m.clone());
        }
        st.devices.insert(PathBuf::from(format!("/dev/{}", kname)));
        st.arrays.insert(
            kname,
            Array {
                name: name.to_string(),
                level: "raid1".to_string(),
                members,
            },
        );
    }

    pub fn commands(&self) -> Vec<String> {
        self.st.borrow().log.clone()
    }

    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.st
            .borrow()
            .log
            .iter()
            .filter(|l| l.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.st.borrow_mut().log.clear();
    }

    pub fn settles(&self) -> u32 {
        self.st.borrow().settles
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.st
            .borrow()
            .mounts
            .iter()
            .map(|m| m.target.clone())
            .collect()
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.st.borrow().datasets.keys().cloned().collect()
    }

    pub fn dataset_property(&self, ds: &str, prop: &str) -> Option<String> {
        self.st
            .borrow()
            .datasets
            .get(ds)
            .and_then(|p| p.get(prop).cloned())
    }

    pub fn imported(&self) -> Vec<String> {
        self.st.borrow().pools.keys().cloned().collect()
    }

    pub fn active_arrays(&self) -> Vec<String> {
        self.st
            .borrow()
            .arrays
            .values()
            .map(|a| a.name.clone())
            .collect()
    }

    /**
     * The pools a cache file on the live system currently names.
     */
    pub fn cache_contents(&self, path: &str) -> Vec<String> {
        self.st
            .borrow()
            .caches
            .get(Path::new(path))
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_mappers(&self) -> Vec<String> {
        self.st.borrow().mappers.iter().cloned().collect()
    }

    pub fn mount_at(&self, source: &str, target: &str) {
        self.st.borrow_mut().mounts.push(MountEntry {
            source: source.to_string(),
            target: PathBuf::from(target),
            fstype: "tmpfs".to_string(),
            options: "rw".to_string(),
        });
    }

    pub fn import_pool(&self, name: &str) {
        self.st
            .borrow_mut()
            .pools
            .insert(name.to_string(), PathBuf::from("/"));
    }
}

impl State {
    fn resolve(&self, p: &Path) -> PathBuf {
        let mut p = p.to_path_buf();
        while let Some(t) = self.links.get(&p) {
            p = t.clone();
        }
        p
    }

    fn mdstat(&self) -> String {
        let mut s = String::from("Personalities : [raid1] [raid0]\n");
        for (k, a) in self.arrays.iter() {
            let members = a
                .members
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    let m = self.resolve(m);
                    format!("{}[{}]", m.file_name().unwrap().to_str().unwrap(), i)
                })
                .collect::<Vec<_>>()
                .join(" ");
            s += &format!("{} : active {} {}\n", k, a.level, members);
            s += "      1046528 blocks super 1.0 [2/2] [UU]\n\n";
        }
        s += "unused devices: <none>\n";
        s
    }

    fn dataset_mountpoint(&self, ds: &str) -> Option<PathBuf> {
        let pool = ds.split('/').next()?;
        let altroot = self.pools.get(pool)?.clone();

        /*
         * Walk up the tree until we find a dataset with an explicit mount
         * point, then append the rest of the name as ZFS does.
         */
        let mut cur = ds.to_string();
        let mut suffix: Vec<String> = Vec::new();
        loop {
            if let Some(mp) = self.datasets.get(&cur).and_then(|p| p.get("mountpoint")) {
                if mp == "none" || mp == "legacy" {
                    return None;
                }
                let mut p = PathBuf::from(mp);
                for s in suffix.iter().rev() {
                    p.push(s);
                }
                let rel = p.strip_prefix("/").unwrap().to_path_buf();
                return Some(altroot.join(rel));
            }
            let (parent, leaf) = cur.rsplit_once('/')?;
            suffix.push(leaf.to_string());
            cur = parent.to_string();
        }
    }

    fn unmount_pool(&mut self, pool: &str) {
        let prefix = format!("{}/", pool);
        self.mounts
            .retain(|m| !(m.fstype == "zfs" && (m.source == pool || m.source.starts_with(&prefix))));
    }

    fn mdadm(&mut self, args: &[&str]) -> Result<Output> {
        match args.get(1).copied() {
            Some("--stop") => {
                let dev = self.resolve(Path::new(args[2]));
                let k = dev.file_name().unwrap().to_str().unwrap().to_string();
                if self.arrays.remove(&k).is_none() {
                    return fail(1, "mdadm: error opening: No such file or directory");
                }
                self.devices.remove(&dev);
                self.links.retain(|_, t| *t != dev);
                ok("")
            }
            Some("--zero-superblock") => {
                let m = PathBuf::from(args[2]);
                if self.arrays.values().any(|a| a.members.contains(&m)) {
                    return fail(1, "mdadm: Couldn't open for write - not zeroing");
                }
                if !self.superblocks.remove(&m) {
                    return fail(
                        1,
                        &format!("mdadm: Unrecognised md component device - {}", m.display()),
                    );
                }
                ok("")
            }
            Some("--create") => {
                let path = PathBuf::from(args[2]);
                let name = path.file_name().unwrap().to_str().unwrap().to_string();
                let mut level = String::new();
                let mut members = Vec::new();
                for a in args[3..].iter() {
                    if let Some(l) = a.strip_prefix("--level=") {
                        level = l.to_string();
                    } else if !a.starts_with('-') {
                        members.push(PathBuf::from(a));
                    }
                }
                for m in members.iter() {
                    if !self.devices.contains(&self.resolve(m)) {
                        return fail(1, &format!("mdadm: cannot open {}", m.display()));
                    }
                    self.superblocks.insert(m.clone());
                }
                let k = format!("md{}", self.next_md);
                self.next_md -= 1;
                let dev = PathBuf::from(format!("/dev/{}", k));
                self.devices.insert(dev.clone());
                self.links.insert(path, dev);
                let level = match level.as_str() {
                    "1" | "mirror" => "raid1",
                    _ => "raid0",
                };
                self.arrays.insert(
                    k,
                    Array {
                        name,
                        level: level.to_string(),
                        members,
                    },
                );
                ok("")
            }
            Some("--detail") => {
                let dev = self.resolve(Path::new(args[2]));
                let k = dev.file_name().unwrap().to_str().unwrap().to_string();
                let a = match self.arrays.get(&k) {
                    Some(a) => a,
                    None => return fail(1, "mdadm: cannot open device"),
                };
                let n = a.members.len();
                let (state, active) = if self.degraded.contains(&a.name) {
                    ("clean, degraded", n - 1)
                } else {
                    ("clean", n)
                };
                ok(&format!(
                    "{}:\n        Version : 1.0\n     Raid Level : {}\n   Raid Devices : {}\n\n          State : {}\n Active Devices : {}\nWorking Devices : {}\n Failed Devices : 0\n",
                    dev.display(),
                    a.level,
                    n,
                    state,
                    active,
                    active
                ))
            }
            _ => bail!("fake mdadm: unexpected {:?}", args),
        }
    }

    fn cryptsetup(&mut self, args: &[&str]) -> Result<Output> {
        let last = args.last().copied().unwrap_or_default();
        match args.get(1).copied() {
            Some("luksFormat") => {
                let dev = PathBuf::from(last);
                let uuid = fake_uuid(&format!("luks:{}", last));
                self.luks.insert(dev, uuid);
                ok("")
            }
            Some("luksUUID") => match self.luks.get(Path::new(last)) {
                Some(u) => ok(&format!("{}\n", u)),
                None => fail(1, "Device is not a valid LUKS device."),
            },
            Some("open") => {
                let name = last.to_string();
                let dev = args[args.len() - 2];
                if !self.luks.contains_key(Path::new(dev)) {
                    return fail(1, "Device is not a valid LUKS device.");
                }
                self.mappers.insert(name.clone());
                self.devices.insert(PathBuf::from(format!("/dev/mapper/{}", name)));
                ok("")
            }
            Some("refresh") => ok(""),
            Some("close") => {
                if !self.mappers.remove(last) {
                    return fail(4, &format!("Device {} is not active.", last));
                }
                self.devices.remove(&PathBuf::from(format!("/dev/mapper/{}", last)));
                ok("")
            }
            _ => bail!("fake cryptsetup: unexpected {:?}", args),
        }
    }

    fn zpool(&mut self, args: &[&str]) -> Result<Output> {
        match args.get(1).copied() {
            Some("create") => {
                let mut altroot = PathBuf::from("/");
                let mut i = 2;
                let mut name = None;
                while i < args.len() {
                    match args[i] {
                        "-o" | "-O" => i += 2,
                        "-R" => {
                            altroot = PathBuf::from(args[i + 1]);
                            i += 2;
                        }
                        "-f" => i += 1,
                        n => {
                            name = Some(n.to_string());
                            break;
                        }
                    }
                }
                let name = name.expect("pool name");
                let prefix = format!("{}/", name);
                self.datasets
                    .retain(|d, _| d != &name && !d.starts_with(&prefix));
                let mut props = BTreeMap::new();
                props.insert("mountpoint".to_string(), "none".to_string());
                props.insert("canmount".to_string(), "off".to_string());
                self.datasets.insert(name.clone(), props);
                self.pools.insert(name, altroot);
                ok("")
            }
            Some("export") => {
                let name = args[2];
                if self.busy_pools.contains(name) {
                    return fail(1, &format!("cannot export '{}': pool is busy", name));
                }
                if self.pools.remove(name).is_none() {
                    return fail(1, &format!("cannot open '{}': no such pool", name));
                }
                self.unmount_pool(name);
                if let Some(c) = self.cachefiles.remove(name) {
                    if let Some(pools) = self.caches.get_mut(&c) {
                        pools.remove(name);
                    }
                }
                ok("")
            }
            Some("import") => {
                let name = args.last().unwrap().to_string();
                let altroot = args
                    .iter()
                    .position(|a| *a == "-R")
                    .map(|i| PathBuf::from(args[i + 1]))
                    .unwrap_or_else(|| PathBuf::from("/"));
                if !self.datasets.contains_key(&name) {
                    return fail(1, &format!("cannot import '{}': no such pool available", name));
                }
                self.pools.insert(name, altroot);
                ok("")
            }
            Some("list") => {
                let mut s = String::new();
                for p in self.pools.keys() {
                    s += p;
                    s += "\n";
                }
                ok(&s)
            }
            Some("set") => {
                let name = args[3].to_string();
                if let Some(c) = args[2].strip_prefix("cachefile=") {
                    let c = PathBuf::from(c);
                    self.caches.entry(c.clone()).or_default().insert(name.clone());
                    self.cachefiles.insert(name, c);
                }
                ok("")
            }
            _ => bail!("fake zpool: unexpected {:?}", args),
        }
    }

    fn zfs(&mut self, args: &[&str]) -> Result<Output> {
        match args.get(1).copied() {
            Some("create") => {
                let mut props = BTreeMap::new();
                let mut i = 2;
                while i < args.len() - 1 {
                    if args[i] == "-o" {
                        let (k, v) = args[i + 1].split_once('=').unwrap();
                        props.insert(k.to_string(), v.to_string());
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                let name = args.last().unwrap().to_string();
                let parent = name.rsplit_once('/').map(|(p, _)| p.to_string());
                if let Some(parent) = parent {
                    if !self.datasets.contains_key(&parent) {
                        return fail(1, "cannot create: parent does not exist");
                    }
                }
                if self.datasets.contains_key(&name) {
                    return fail(1, "cannot create: dataset already exists");
                }
                self.datasets.insert(name, props);
                ok("")
            }
            Some("mount") => {
                let name = args[2];
                let target = match self.dataset_mountpoint(name) {
                    Some(t) => t,
                    None => return fail(1, "cannot mount: no mountpoint set"),
                };
                self.mounts.push(MountEntry {
                    source: name.to_string(),
                    target,
                    fstype: "zfs".to_string(),
                    options: "rw".to_string(),
                });
                ok("")
            }
            Some("unmount") => {
                let name = args.last().unwrap();
                let before = self.mounts.len();
                self.mounts.retain(|m| m.source != *name);
                if before == self.mounts.len() {
                    return fail(1, "cannot unmount: not currently mounted");
                }
                ok("")
            }
            _ => bail!("fake zfs: unexpected {:?}", args),
        }
    }

    fn sgdisk(&mut self, args: &[&str]) -> Result<Output> {
        let dev = PathBuf::from(*args.last().unwrap());
        for a in args.iter() {
            if let Some(spec) = a.strip_prefix("--new=") {
                let n: u32 = spec.split(':').next().unwrap().parse().unwrap();
                self.pending.entry(dev.clone()).or_default().push(n);
            }
        }
        if args.contains(&"--zap-all") {
            let prefix = dev.to_str().unwrap().to_string();
            self.devices
                .retain(|d| d == &dev || !d.to_str().unwrap().starts_with(&prefix));
        }
        ok("")
    }

    fn partprobe(&mut self, args: &[&str]) -> Result<Output> {
        if self.hold_partitions {
            return ok("");
        }
        let dev = PathBuf::from(args[1]);
        let parts = self.pending.remove(&dev).unwrap_or_default();
        let ids: Vec<PathBuf> = self
            .links
            .iter()
            .filter(|(_, t)| **t == dev)
            .map(|(l, _)| l.clone())
            .collect();
        for n in parts {
            let node = partition_node(&dev, n);
            self.devices.insert(node.clone());
            for id in ids.iter() {
                self.links
                    .insert(PathBuf::from(format!("{}-part{}", id.display(), n)), node.clone());
            }
        }
        ok("")
    }

    fn lsblk(&mut self, args: &[&str]) -> Result<Output> {
        let dev = PathBuf::from(*args.last().unwrap());
        match self.sizes.get(&dev) {
            Some((bytes, log, phy)) => ok(&format!(
                "{{\"blockdevices\": [{{\"name\": \"{}\", \"size\": {}, \"log-sec\": {}, \"phy-sec\": {}, \"type\": \"disk\"}}]}}",
                dev.file_name().unwrap().to_str().unwrap(),
                bytes,
                log,
                phy
            )),
            None => fail(32, "lsblk: not a block device"),
        }
    }

    fn mount(&mut self, args: &[&str]) -> Result<Output> {
        let n = args.len();
        let fstype = args
            .iter()
            .position(|a| *a == "-t")
            .map(|i| args[i + 1].to_string())
            .unwrap_or_default();
        let options = args
            .iter()
            .position(|a| *a == "-o")
            .map(|i| args[i + 1].to_string())
            .unwrap_or_default();
        self.mounts.push(MountEntry {
            source: args[n - 2].to_string(),
            target: PathBuf::from(args[n - 1]),
            fstype,
            options,
        });
        ok("")
    }

    /*
     * Only pool cache files are copied; the copy lands on the real file
     * system so that tests can read it back.
     */
    fn cp(&mut self, args: &[&str]) -> Result<Output> {
        let src = PathBuf::from(args[1]);
        let Some(pools) = self.caches.get(&src).filter(|p| !p.is_empty()) else {
            return fail(1, &format!("cp: cannot stat '{}'", src.display()));
        };
        let mut text = String::new();
        for p in pools.iter() {
            text += p;
            text += "\n";
        }
        std::fs::write(args[2], text)?;
        ok("")
    }

    fn umount(&mut self, args: &[&str]) -> Result<Output> {
        let target = PathBuf::from(*args.last().unwrap());
        if self.busy.contains(&target) {
            return fail(32, &format!("umount: {}: target is busy.", target.display()));
        }
        match self.mounts.iter().rposition(|m| m.target == target) {
            Some(i) => {
                self.mounts.remove(i);
                ok("")
            }
            None => fail(32, &format!("umount: {}: not mounted.", target.display())),
        }
    }
}

impl Host for FakeHost {
    fn exec(&self, args: &[&str], _input: Option<&[u8]>) -> Result<Output> {
        let mut st = self.st.borrow_mut();
        let line = args.join(" ");
        st.log.push(line.clone());

        if st.fail.iter().any(|f| line.starts_with(f.as_str())) {
            return fail(1, "injected failure");
        }

        match args[0] {
            "blkdiscard" | "wipefs" | "udevadm" | "mkfs.ext4" | "mkfs.vfat" | "mkswap" => ok(""),
            "chroot" => ok("setting up the installed system\n\n"),
            "sgdisk" => st.sgdisk(args),
            "partprobe" => st.partprobe(args),
            "lsblk" => st.lsblk(args),
            "blkid" => ok(&format!("{}\n", fake_uuid(args.last().unwrap()))),
            "mdadm" => st.mdadm(args),
            "cryptsetup" => st.cryptsetup(args),
            "zpool" => st.zpool(args),
            "zfs" => st.zfs(args),
            "cp" => st.cp(args),
            "mount" => st.mount(args),
            "umount" => st.umount(args),
            n => bail!("fake host: unknown tool {}", n),
        }
    }

    fn block_device(&self, path: &Path) -> Result<Option<PathBuf>> {
        let st = self.st.borrow();
        let real = st.resolve(path);
        Ok(if st.devices.contains(&real) {
            Some(real)
        } else {
            None
        })
    }

    fn mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(self.st.borrow().mounts.clone())
    }

    fn holders(&self, path: &Path) -> Result<Vec<Holder>> {
        let st = self.st.borrow();
        Ok(if st.busy.contains(path) {
            st.holders.clone()
        } else {
            Vec::new()
        })
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        let st = self.st.borrow();
        if path == Path::new("/proc/mdstat") {
            Ok(Some(st.mdstat()))
        } else {
            Ok(None)
        }
    }

    fn settle(&self, _delay: Duration) {
        self.st.borrow_mut().settles += 1;
    }

    fn privileged(&self) -> bool {
        !self.st.borrow().unprivileged
    }
}
