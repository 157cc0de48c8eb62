//! Linux implementation of [`DiskHost`]: sysfs/procfs for inspection, the
//! util-linux, parted and mkfs tools for every change, and a lock-protected
//! `/etc/fstab`.

mod command;
mod fstab_file;
mod sysfs;

use anyhow::{anyhow, bail, Context, Result};
use command::{probe_tag, run_cmd};
use mountwright_core::{ActiveMount, BlockDevice, DiskHost, FilesystemType, HostInfo};
use std::ffi::CString;
use std::fs;
use std::io;
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use sysfs::read_string;
use tracing::{debug, warn};

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the host reads and writes its state. Overridable for tests and for
/// provisioning a chroot's mount table.
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub sys_block: PathBuf,
    pub proc_mounts: PathBuf,
    pub by_label: PathBuf,
    pub fstab: PathBuf,
    pub fstab_lock: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            proc_mounts: PathBuf::from("/proc/self/mounts"),
            by_label: PathBuf::from("/dev/disk/by-label"),
            fstab: PathBuf::from("/etc/fstab"),
            fstab_lock: PathBuf::from("/run/lock/mountwright-fstab.lock"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinuxHost {
    paths: HostPaths,
}

impl LinuxHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(paths: HostPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }
}

impl DiskHost for LinuxHost {
    fn host_info(&self) -> HostInfo {
        HostInfo {
            os: "linux".to_string(),
            os_version: read_os_release(),
            machine: read_machine(),
        }
    }

    fn list_block_devices(&self) -> Result<Vec<BlockDevice>> {
        sysfs::enumerate_disks(
            &self.paths.sys_block,
            &self.paths.proc_mounts,
            &self.paths.by_label,
            &|path| match probe_tag(path, "LABEL") {
                Ok(label) => label,
                Err(err) => {
                    debug!(device = %path.display(), error = %err, "label probe failed");
                    None
                }
            },
        )
    }

    fn list_partitions(&self, device: &BlockDevice) -> Result<Vec<PathBuf>> {
        let disk = self.paths.sys_block.join(&device.identifier);
        if !disk.exists() {
            bail!("{} is not a block device", device.path.display());
        }
        Ok(sysfs::partition_names(&disk)?
            .into_iter()
            .map(|name| Path::new("/dev").join(name))
            .collect())
    }

    fn filesystem_label(&self, path: &Path) -> Result<Option<String>> {
        probe_tag(path, "LABEL")
    }

    fn filesystem_type(&self, path: &Path) -> Result<Option<String>> {
        probe_tag(path, "TYPE")
    }

    fn filesystem_uuid(&self, path: &Path) -> Result<Option<String>> {
        probe_tag(path, "UUID")
    }

    fn active_mounts(&self, device: &BlockDevice) -> Result<Vec<ActiveMount>> {
        sysfs::disk_mounts(
            &self.paths.sys_block,
            &self.paths.proc_mounts,
            &device.identifier,
        )
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        run_cmd("umount", &[&path_arg(mount_point)]).map(|_| ())
    }

    fn read_mount_table(&self) -> Result<String> {
        fstab_file::read_table(&self.paths.fstab)
    }

    fn update_mount_table(&self, edit: &mut dyn FnMut(String) -> Result<String>) -> Result<()> {
        fstab_file::update_table(&self.paths.fstab, &self.paths.fstab_lock, edit)
    }

    /// Clears signatures on every partition first, then on the disk itself,
    /// so no stale superblock survives under the new partition table.
    fn wipe_signatures(&self, device: &Path) -> Result<()> {
        let name = device
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| anyhow!("not a device path: {}", device.display()))?;
        let disk = self.paths.sys_block.join(name);
        let mut targets = Vec::new();
        if disk.exists() {
            for partition in sysfs::partition_names(&disk)? {
                targets.push(Path::new("/dev").join(partition));
            }
        }
        targets.push(device.to_path_buf());

        let mut failures = Vec::new();
        for target in &targets {
            if let Err(err) = run_cmd("wipefs", &["-a", &path_arg(target)]) {
                warn!(target = %target.display(), error = %err, "wipefs failed");
                failures.push(format!("{:#}", err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{}", failures.join("; "))
        }
    }

    fn create_gpt(&self, device: &Path) -> Result<()> {
        run_cmd("parted", &["-s", &path_arg(device), "mklabel", "gpt"]).map(|_| ())
    }

    fn create_partition(&self, device: &Path, span_percent: u8) -> Result<()> {
        let end = format!("{}%", span_percent.min(100));
        run_cmd(
            "parted",
            &["-s", "-a", "optimal", &path_arg(device), "mkpart", "primary", "0%", &end],
        )
        .map(|_| ())
    }

    fn wait_for_device(&self, path: &Path, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let udev_timeout = format!("--timeout={}", timeout.as_secs().max(1));
        if let Err(err) = run_cmd("udevadm", &["settle", &udev_timeout]) {
            debug!(error = %err, "udevadm settle failed; polling for the node");
        }
        while !path.exists() {
            if Instant::now() >= deadline {
                bail!(
                    "{} did not appear within {}s",
                    path.display(),
                    timeout.as_secs()
                );
            }
            thread::sleep(DEVICE_POLL_INTERVAL);
        }
        Ok(())
    }

    fn format_filesystem(&self, partition: &Path, fs: FilesystemType, force: bool) -> Result<()> {
        let target = path_arg(partition);
        let mut args = Vec::new();
        if force {
            args.push(fs.force_flag());
        }
        args.push(target.as_str());
        run_cmd(fs.mkfs_program(), &args).map(|_| ())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mount_by_table(&self, mount_point: &Path) -> Result<()> {
        run_cmd("mount", &[&path_arg(mount_point)]).map(|_| ())
    }

    fn account_exists(&self, name: &str) -> Result<bool> {
        lookup_account(name)
    }

    fn chown_recursive(&self, path: &Path, account: &str) -> Result<()> {
        let owner = format!("{}:", account);
        run_cmd("chown", &["-R", &owner, &path_arg(path)]).map(|_| ())
    }

    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn lookup_account(name: &str) -> Result<bool> {
    let c_name =
        CString::new(name).map_err(|_| anyhow!("invalid account name: {:?}", name))?;
    let mut entry = MaybeUninit::<libc::passwd>::zeroed();
    let mut buffer = vec![0 as libc::c_char; 16 * 1024];
    let mut found: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: every pointer refers to live, correctly sized storage for the
    // duration of the call; getpwnam_r only writes within `buffer`.
    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            entry.as_mut_ptr(),
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut found,
        )
    };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc))
            .with_context(|| format!("look up account {}", name));
    }
    Ok(!found.is_null())
}

fn read_os_release() -> String {
    let data = fs::read_to_string("/etc/os-release").unwrap_or_default();
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        if line.starts_with("NAME=") && name.is_none() {
            name = Some(trim_os_value(line));
        } else if line.starts_with("VERSION=") && version.is_none() {
            version = Some(trim_os_value(line));
        }
    }
    match (name, version) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => "unknown".to_string(),
    }
}

fn trim_os_value(line: &str) -> String {
    let value = line.splitn(2, '=').nth(1).unwrap_or("").trim();
    value.trim_matches('"').to_string()
}

fn read_machine() -> String {
    let vendor = read_string("/sys/devices/virtual/dmi/id/sys_vendor");
    let product = read_string("/sys/devices/virtual/dmi/id/product_name");
    match (vendor, product) {
        (Some(vendor), Some(product)) => format!("{} {}", vendor, product),
        (Some(vendor), None) => vendor,
        (None, Some(product)) => product,
        _ => read_string("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".to_string()),
    }
}
