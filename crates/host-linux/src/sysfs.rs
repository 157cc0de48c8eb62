//! Live block device inventory from sysfs and procfs.

use anyhow::{Context, Result};
use mountwright_core::fstab::unescape_mount;
use mountwright_core::{ActiveMount, BlockDevice};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Mount points whose backing device is treated as the system device.
const SYSTEM_MOUNT_POINTS: [&str; 3] = ["/", "/boot", "/boot/efi"];

/// Enumerates whole disks under `sys_block`, sorted by kernel name the way the
/// kernel numbers them (`vdb` < `vdc` < `vdaa`).
///
/// `probe_label` is consulted for devices the by-label directory says nothing
/// about.
pub(crate) fn enumerate_disks(
    sys_block: &Path,
    proc_mounts: &Path,
    by_label: &Path,
    probe_label: &dyn Fn(&Path) -> Option<String>,
) -> Result<Vec<BlockDevice>> {
    let mounts = read_mounts(proc_mounts);
    let labels = read_labels(by_label);
    let mut devices = Vec::new();
    let entries =
        fs::read_dir(sys_block).with_context(|| format!("read {}", sys_block.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_virtual_disk(&name, entry.path()) {
            continue;
        }
        let size_bytes = read_u64(entry.path().join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        if size_bytes == 0 {
            continue;
        }

        let partitions = partition_names(&entry.path())?;
        let mut members = vec![name.clone()];
        members.extend(partitions.iter().cloned());
        let current_mounts = mounts_of(&entry.path(), &members, &mounts);
        let is_system_device = current_mounts.iter().any(|mount| {
            SYSTEM_MOUNT_POINTS
                .iter()
                .any(|system| mount.mount_point == Path::new(system))
        });
        let label = members
            .iter()
            .find_map(|member| labels.get(member).cloned())
            .or_else(|| {
                members
                    .iter()
                    .find_map(|member| probe_label(&Path::new("/dev").join(member)))
            });

        let mut device = BlockDevice::new(name);
        device.label = label;
        device.is_system_device = is_system_device;
        device.size_bytes = size_bytes;
        device.current_mounts = current_mounts;
        devices.push(device);
    }
    devices.sort_by(|a, b| {
        (a.identifier.len(), &a.identifier).cmp(&(b.identifier.len(), &b.identifier))
    });
    Ok(devices)
}

/// Active mounts of one disk, its partitions, and anything stacked on them
/// (device-mapper, md).
pub(crate) fn disk_mounts(
    sys_block: &Path,
    proc_mounts: &Path,
    name: &str,
) -> Result<Vec<ActiveMount>> {
    let disk_path = sys_block.join(name);
    let mut members = vec![name.to_string()];
    if disk_path.exists() {
        members.extend(partition_names(&disk_path)?);
    }
    Ok(mounts_of(&disk_path, &members, &read_mounts(proc_mounts)))
}

pub(crate) fn partition_names(disk_path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries =
        fs::read_dir(disk_path).with_context(|| format!("read {}", disk_path.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.path().join("partition").exists() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort_by(|a, b| (a.len(), a).cmp(&(b.len(), b)));
    Ok(names)
}

fn mounts_of(
    disk_path: &Path,
    members: &[String],
    mounts: &HashMap<String, Vec<ActiveMount>>,
) -> Vec<ActiveMount> {
    let mut names: Vec<String> = members.to_vec();
    for member in members {
        let member_path = if member.as_str() == file_name(disk_path) {
            disk_path.to_path_buf()
        } else {
            disk_path.join(member)
        };
        names.extend(holder_names(&member_path));
    }
    names
        .iter()
        .filter_map(|name| mounts.get(name))
        .flatten()
        .cloned()
        .collect()
}

fn holder_names(path: &Path) -> Vec<String> {
    fs::read_dir(path.join("holders"))
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Mount table keyed by the kernel name of each source device. Symlinked
/// sources such as `/dev/mapper/vg-root` are resolved to `dm-N`.
pub(crate) fn read_mounts(path: &Path) -> HashMap<String, Vec<ActiveMount>> {
    let data = fs::read_to_string(path).unwrap_or_default();
    parse_mounts(&data, |source| fs::canonicalize(source).ok())
}

fn parse_mounts(
    data: &str,
    resolve: impl Fn(&Path) -> Option<PathBuf>,
) -> HashMap<String, Vec<ActiveMount>> {
    let mut mounts: HashMap<String, Vec<ActiveMount>> = HashMap::new();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let (Some(source), Some(mount_point), Some(fs_type)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if !source.starts_with("/dev/") {
            continue;
        }
        let source = resolve(Path::new(source)).unwrap_or_else(|| PathBuf::from(source));
        let name = file_name(&source).to_string();
        if name.is_empty() {
            continue;
        }
        mounts.entry(name).or_default().push(ActiveMount {
            source,
            mount_point: PathBuf::from(unescape_mount(mount_point)),
            fs_type: fs_type.to_string(),
        });
    }
    mounts
}

fn read_labels(path: &Path) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                if let Some(name) = target.file_name().and_then(|v| v.to_str()) {
                    let label = unescape_udev(&entry.file_name().to_string_lossy());
                    labels.insert(name.to_string(), label);
                }
            }
        }
    }
    labels
}

/// udev encodes unsafe bytes in by-label names as `\xNN`.
fn unescape_udev(value: &str) -> String {
    let mut bytes = Vec::with_capacity(value.len());
    let raw = value.as_bytes();
    let mut index = 0;
    while index < raw.len() {
        if raw[index] == b'\\' && raw.get(index + 1) == Some(&b'x') {
            let decoded = value
                .get(index + 2..index + 4)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                bytes.push(byte);
                index += 4;
                continue;
            }
        }
        bytes.push(raw[index]);
        index += 1;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn is_virtual_disk(name: &str, path: PathBuf) -> bool {
    if name.starts_with("loop")
        || name.starts_with("ram")
        || name.starts_with("zram")
        || name.starts_with("dm-")
        || name.starts_with("md")
    {
        return true;
    }
    if let Ok(target) = fs::canonicalize(path.join("device")) {
        if target.to_string_lossy().contains("/virtual/") {
            return true;
        }
    }
    false
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|value| value.to_str()).unwrap_or("")
}

pub(crate) fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path).ok().map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}
