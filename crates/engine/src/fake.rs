//! In-memory host for engine tests: disks, partition nodes, filesystems,
//! mounts, directories and the persistent mount table, with failure and hang
//! injection per operation and path.

use anyhow::{anyhow, bail, Result};
use mountwright_core::{
    is_device_or_partition, partition_path, ActiveMount, BlockDevice, DiskHost, FilesystemType,
    HostInfo, MountSource, MountTable,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Enumerate,
    Unmount,
    Wipe,
    Partition,
    Format,
    Mount,
    Chown,
}

#[derive(Debug, Clone)]
struct Filesystem {
    fs_type: String,
    uuid: String,
    label: Option<String>,
}

struct FakeState {
    privileged: bool,
    disks: Vec<BlockDevice>,
    nodes: HashSet<PathBuf>,
    filesystems: HashMap<PathBuf, Filesystem>,
    mounts: Vec<ActiveMount>,
    dirs: HashSet<PathBuf>,
    table: String,
    accounts: HashSet<String>,
    owners: HashMap<PathBuf, String>,
    failures: HashMap<(FakeOp, PathBuf), String>,
    hangs: HashMap<PathBuf, Duration>,
    formats: usize,
}

pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                privileged: true,
                disks: Vec::new(),
                nodes: HashSet::new(),
                filesystems: HashMap::new(),
                mounts: Vec::new(),
                dirs: HashSet::new(),
                table: String::new(),
                accounts: HashSet::new(),
                owners: HashMap::new(),
                failures: HashMap::new(),
                hangs: HashMap::new(),
                formats: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_disk(&self, name: &str) {
        let mut device = BlockDevice::new(name);
        device.size_bytes = 10 * 1024 * 1024 * 1024;
        let mut state = self.state();
        state.nodes.insert(device.path.clone());
        state.disks.push(device);
    }

    /// Disk carrying the root filesystem on its first partition.
    pub fn add_system_disk(&self, name: &str) {
        self.add_disk(name);
        let root = partition_path(&PathBuf::from("/dev").join(name), 1);
        {
            let mut state = self.state();
            if let Some(disk) = state.disks.iter_mut().find(|d| d.identifier == name) {
                disk.is_system_device = true;
            }
        }
        self.put_labeled_filesystem(root.to_str().unwrap(), "ext4", "root-uuid", "cloudimg-rootfs");
        self.put_mount(root.to_str().unwrap(), "/", "ext4");
    }

    pub fn put_filesystem(&self, path: &str, fs_type: &str, uuid: &str) {
        self.insert_filesystem(path, fs_type, uuid, None);
    }

    pub fn put_labeled_filesystem(&self, path: &str, fs_type: &str, uuid: &str, label: &str) {
        self.insert_filesystem(path, fs_type, uuid, Some(label));
    }

    fn insert_filesystem(&self, path: &str, fs_type: &str, uuid: &str, label: Option<&str>) {
        let mut state = self.state();
        state.nodes.insert(PathBuf::from(path));
        state.filesystems.insert(
            PathBuf::from(path),
            Filesystem {
                fs_type: fs_type.to_string(),
                uuid: uuid.to_string(),
                label: label.map(str::to_string),
            },
        );
    }

    pub fn put_mount(&self, source: &str, mount_point: &str, fs_type: &str) {
        let mut state = self.state();
        state.dirs.insert(PathBuf::from(mount_point));
        state.mounts.push(ActiveMount {
            source: PathBuf::from(source),
            mount_point: PathBuf::from(mount_point),
            fs_type: fs_type.to_string(),
        });
    }

    pub fn put_dir(&self, path: &str) {
        self.state().dirs.insert(PathBuf::from(path));
    }

    pub fn add_account(&self, name: &str) {
        self.state().accounts.insert(name.to_string());
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.state().privileged = privileged;
    }

    pub fn set_table(&self, contents: &str) {
        self.state().table = contents.to_string();
    }

    pub fn table(&self) -> String {
        self.state().table.clone()
    }

    pub fn fail(&self, op: FakeOp, path: &str, message: &str) {
        self.state()
            .failures
            .insert((op, PathBuf::from(path)), message.to_string());
    }

    /// Makes formatting `partition` block for `duration` before proceeding.
    pub fn hang_format(&self, partition: &str, duration: Duration) {
        self.state().hangs.insert(PathBuf::from(partition), duration);
    }

    pub fn mount_source(&self, mount_point: &str) -> Option<(PathBuf, String)> {
        self.state()
            .mounts
            .iter()
            .find(|mount| mount.mount_point == Path::new(mount_point))
            .map(|mount| (mount.source.clone(), mount.fs_type.clone()))
    }

    /// `(fs_type, uuid)` currently on `path`.
    pub fn filesystem(&self, path: &str) -> Option<(String, String)> {
        self.state()
            .filesystems
            .get(Path::new(path))
            .map(|fs| (fs.fs_type.clone(), fs.uuid.clone()))
    }

    pub fn owner(&self, path: &str) -> Option<String> {
        self.state().owners.get(Path::new(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(Path::new(path))
    }

    pub fn format_count(&self) -> usize {
        self.state().formats
    }
}

impl FakeState {
    fn check(&self, op: FakeOp, path: &Path) -> Result<()> {
        match self.failures.get(&(op, path.to_path_buf())) {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }

    fn mounts_of(&self, device: &Path) -> Vec<ActiveMount> {
        self.mounts
            .iter()
            .filter(|mount| is_device_or_partition(device, &mount.source))
            .cloned()
            .collect()
    }

    fn ensure_not_busy(&self, device: &Path) -> Result<()> {
        if let Some(mount) = self.mounts_of(device).first() {
            bail!(
                "{} is busy: mounted at {}",
                mount.source.display(),
                mount.mount_point.display()
            );
        }
        Ok(())
    }

    fn drop_signatures(&mut self, device: &Path, include_disk: bool) {
        self.filesystems.retain(|path, _| {
            !(is_device_or_partition(device, path) && (include_disk || path != device))
        });
        self.nodes
            .retain(|path| path == device || !is_device_or_partition(device, path));
    }
}

impl DiskHost for FakeHost {
    fn host_info(&self) -> HostInfo {
        HostInfo {
            os: "linux".to_string(),
            os_version: "fake".to_string(),
            machine: "test-vm".to_string(),
        }
    }

    fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        let state = self.state();
        state.check(FakeOp::Enumerate, Path::new(""))?;
        let mut devices = Vec::new();
        for disk in &state.disks {
            let mut device = disk.clone();
            let mut labeled: Vec<_> = state
                .filesystems
                .iter()
                .filter(|(path, fs)| is_device_or_partition(&disk.path, path) && fs.label.is_some())
                .collect();
            labeled.sort_by(|a, b| a.0.cmp(b.0));
            device.label = labeled.first().and_then(|(_, fs)| fs.label.clone());
            device.current_mounts = state.mounts_of(&disk.path);
            devices.push(device);
        }
        Ok(devices)
    }

    fn list_partitions(&self, device: &BlockDevice) -> Result<Vec<PathBuf>> {
        let state = self.state();
        let mut partitions: Vec<PathBuf> = state
            .nodes
            .iter()
            .filter(|node| **node != device.path && is_device_or_partition(&device.path, node))
            .cloned()
            .collect();
        partitions.sort_by_key(|path| (path.as_os_str().len(), path.clone()));
        Ok(partitions)
    }

    fn filesystem_label(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.state().filesystems.get(path).and_then(|fs| fs.label.clone()))
    }

    fn filesystem_type(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.state().filesystems.get(path).map(|fs| fs.fs_type.clone()))
    }

    fn filesystem_uuid(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.state().filesystems.get(path).map(|fs| fs.uuid.clone()))
    }

    fn active_mounts(&self, device: &BlockDevice) -> Result<Vec<ActiveMount>> {
        Ok(self.state().mounts_of(&device.path))
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let mut state = self.state();
        state.check(FakeOp::Unmount, mount_point)?;
        let before = state.mounts.len();
        state.mounts.retain(|mount| mount.mount_point != mount_point);
        if state.mounts.len() == before {
            bail!("{} is not mounted", mount_point.display());
        }
        Ok(())
    }

    fn read_mount_table(&self) -> Result<String> {
        Ok(self.state().table.clone())
    }

    fn update_mount_table(&self, edit: &mut dyn FnMut(String) -> Result<String>) -> Result<()> {
        let mut state = self.state();
        let updated = edit(state.table.clone())?;
        state.table = updated;
        Ok(())
    }

    fn wipe_signatures(&self, device: &Path) -> Result<()> {
        let mut state = self.state();
        state.check(FakeOp::Wipe, device)?;
        state.ensure_not_busy(device)?;
        state.drop_signatures(device, true);
        Ok(())
    }

    fn create_gpt(&self, device: &Path) -> Result<()> {
        let mut state = self.state();
        state.check(FakeOp::Partition, device)?;
        state.ensure_not_busy(device)?;
        state.drop_signatures(device, true);
        Ok(())
    }

    fn create_partition(&self, device: &Path, span_percent: u8) -> Result<()> {
        let mut state = self.state();
        state.check(FakeOp::Partition, device)?;
        if span_percent != 100 {
            bail!("fake host only models full-span partitions");
        }
        state.nodes.insert(partition_path(device, 1));
        Ok(())
    }

    fn wait_for_device(&self, path: &Path, _timeout: Duration) -> Result<()> {
        if self.state().nodes.contains(path) {
            Ok(())
        } else {
            Err(anyhow!("{} did not appear", path.display()))
        }
    }

    fn format_filesystem(&self, partition: &Path, fs: FilesystemType, force: bool) -> Result<()> {
        let hang = self.state().hangs.get(partition).copied();
        if let Some(duration) = hang {
            thread::sleep(duration);
        }
        let mut state = self.state();
        state.check(FakeOp::Format, partition)?;
        if !state.nodes.contains(partition) {
            bail!("{} does not exist", partition.display());
        }
        state.ensure_not_busy(partition)?;
        if state.filesystems.contains_key(partition) && !force {
            bail!("{} already holds a filesystem", partition.display());
        }
        state.formats += 1;
        let uuid = format!("{:08x}-0000-4000-8000-{:012x}", state.formats, state.formats);
        state.filesystems.insert(
            partition.to_path_buf(),
            Filesystem {
                fs_type: fs.as_str().to_string(),
                uuid,
                label: None,
            },
        );
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            state.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state();
        state.nodes.contains(path) || state.dirs.contains(path)
    }

    fn mount_by_table(&self, mount_point: &Path) -> Result<()> {
        let mut state = self.state();
        state.check(FakeOp::Mount, mount_point)?;
        let table = MountTable::parse(&state.table);
        let record = table
            .records_for_mount_point(mount_point)
            .next()
            .cloned()
            .ok_or_else(|| anyhow!("{} not found in mount table", mount_point.display()))?;
        let source = match &record.source {
            MountSource::Uuid(uuid) => state
                .filesystems
                .iter()
                .find(|(_, fs)| &fs.uuid == uuid)
                .map(|(path, _)| path.clone())
                .ok_or_else(|| anyhow!("can't find UUID={}", uuid))?,
            MountSource::Device(path) => path.clone(),
            other => bail!("unsupported source in fake host: {}", other),
        };
        let fs_type = state
            .filesystems
            .get(&source)
            .map(|fs| fs.fs_type.clone())
            .ok_or_else(|| anyhow!("wrong fs type, bad superblock on {}", source.display()))?;
        if fs_type != record.fs_type {
            bail!("wrong fs type: table says {}, device has {}", record.fs_type, fs_type);
        }
        if !state.dirs.contains(mount_point) {
            bail!("mount point {} does not exist", mount_point.display());
        }
        state.mounts.push(ActiveMount {
            source,
            mount_point: mount_point.to_path_buf(),
            fs_type,
        });
        Ok(())
    }

    fn account_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().accounts.contains(name))
    }

    fn chown_recursive(&self, path: &Path, account: &str) -> Result<()> {
        let mut state = self.state();
        state.check(FakeOp::Chown, path)?;
        state.owners.insert(path.to_path_buf(), account.to_string());
        Ok(())
    }

    fn is_privileged(&self) -> bool {
        self.state().privileged
    }
}
