//! The operating-system boundary the provisioning engine drives.
//!
//! Every method is a trusted primitive; the engine decides which failures are
//! fatal. Implementations must be usable from several worker threads.

use crate::{ActiveMount, BlockDevice, FilesystemType, HostInfo};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub trait DiskHost: Send + Sync {
    fn host_info(&self) -> HostInfo;

    /// Live kernel view of attached block devices, in a stable order.
    fn list_block_devices(&self) -> Result<Vec<BlockDevice>>;

    /// Partition nodes of `device` as the kernel currently sees them, in
    /// partition order. Numbering gaps (`sdb1`, `sdb5`) are preserved.
    fn list_partitions(&self, device: &BlockDevice) -> Result<Vec<PathBuf>>;

    fn filesystem_label(&self, path: &Path) -> Result<Option<String>>;

    fn filesystem_type(&self, path: &Path) -> Result<Option<String>>;

    fn filesystem_uuid(&self, path: &Path) -> Result<Option<String>>;

    /// Active mounts whose source is the device or one of its partitions.
    fn active_mounts(&self, device: &BlockDevice) -> Result<Vec<ActiveMount>>;

    fn unmount(&self, mount_point: &Path) -> Result<()>;

    fn read_mount_table(&self) -> Result<String>;

    /// Read-modify-write of the persistent mount table as one locked cycle.
    fn update_mount_table(&self, edit: &mut dyn FnMut(String) -> Result<String>) -> Result<()>;

    fn wipe_signatures(&self, device: &Path) -> Result<()>;

    fn create_gpt(&self, device: &Path) -> Result<()>;

    fn create_partition(&self, device: &Path, span_percent: u8) -> Result<()>;

    fn wait_for_device(&self, path: &Path, timeout: Duration) -> Result<()>;

    fn format_filesystem(&self, partition: &Path, fs: FilesystemType, force: bool) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn path_exists(&self, path: &Path) -> bool;

    /// Mounts `mount_point` through its persistent table entry.
    fn mount_by_table(&self, mount_point: &Path) -> Result<()>;

    fn account_exists(&self, name: &str) -> Result<bool>;

    fn chown_recursive(&self, path: &Path, account: &str) -> Result<()>;

    fn is_privileged(&self) -> bool;
}
