use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod fstab;
pub mod host;

pub use config::{ProvisionConfig, ProvisionMode};
pub use error::{BestEffortWarning, DeviceLifecycleError, ProvisionError};
pub use fstab::{MountSource, MountTable, PersistentMountRecord};
pub use host::DiskHost;

pub const INVENTORY_SCHEMA_VERSION: &str = "1.0.0";
pub const RUN_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub os: String,
    pub os_version: String,
    pub machine: String,
}

/// One raw storage device as seen by the enumerator at call time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub identifier: String,        // kernel name, e.g. "vdb"
    pub path: PathBuf,
    pub label: Option<String>,     // filesystem label on the disk or any partition
    pub is_system_device: bool,
    pub size_bytes: u64,
    pub current_mounts: Vec<ActiveMount>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ActiveMount {
    pub source: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
}

impl BlockDevice {
    pub fn new(identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        Self {
            path: PathBuf::from("/dev").join(&identifier),
            identifier,
            label: None,
            is_system_device: false,
            size_bytes: 0,
            current_mounts: Vec::new(),
        }
    }

    pub fn partition_path(&self, index: u32) -> PathBuf {
        partition_path(&self.path, index)
    }
}

/// Path of the `index`th partition node of `device`.
///
/// Kernel names ending in a digit (`nvme0n1`, `mmcblk0`) take a `p` separator.
pub fn partition_path(device: &Path, index: u32) -> PathBuf {
    let raw = device.to_string_lossy();
    if raw.ends_with(|ch: char| ch.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", raw, index))
    } else {
        PathBuf::from(format!("{}{}", raw, index))
    }
}

/// True when `candidate` is `device` itself or one of its partition nodes.
pub fn is_device_or_partition(device: &Path, candidate: &Path) -> bool {
    let device = device.to_string_lossy();
    let candidate = candidate.to_string_lossy();
    let Some(rest) = candidate.strip_prefix(device.as_ref()) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = if device.ends_with(|ch: char| ch.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit())
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Xfs,
    Ext4,
}

impl FilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemType::Xfs => "xfs",
            FilesystemType::Ext4 => "ext4",
        }
    }

    pub fn mkfs_program(&self) -> &'static str {
        match self {
            FilesystemType::Xfs => "mkfs.xfs",
            FilesystemType::Ext4 => "mkfs.ext4",
        }
    }

    /// Flag that makes mkfs overwrite an existing signature.
    pub fn force_flag(&self) -> &'static str {
        match self {
            FilesystemType::Xfs => "-f",
            FilesystemType::Ext4 => "-F",
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilesystemType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xfs" => Ok(FilesystemType::Xfs),
            "ext4" => Ok(FilesystemType::Ext4),
            other => Err(format!("unsupported filesystem: {}", other)),
        }
    }
}

/// Order-derived binding of an eligible device to a mount slot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MountAssignment {
    pub device: BlockDevice,
    pub slot_index: u32,
    pub mount_point: PathBuf,
}

impl MountAssignment {
    pub fn partition(&self) -> PathBuf {
        self.device.partition_path(1)
    }

    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.mount_point.join(name)
    }
}

/// Per-device lifecycle state, inferred from the host on every run.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    UnknownRaw,
    Formatted,
    MountedElsewhereOrStale,
    StaleRecorded,
    Converged,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::UnknownRaw => "UNKNOWN_RAW",
            DeviceState::Formatted => "FORMATTED",
            DeviceState::MountedElsewhereOrStale => "MOUNTED_ELSEWHERE_OR_STALE",
            DeviceState::StaleRecorded => "STALE_RECORDED",
            DeviceState::Converged => "CONVERGED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleStep {
    Schedule,
    Inspect,
    Safety,
    Unmount,
    PurgeRecords,
    WipeSignatures,
    Partition,
    Settle,
    Format,
    ReadUuid,
    CreateMountPoint,
    AppendRecord,
    Mount,
    CreateDataDir,
    AssignOwnership,
}

impl LifecycleStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStep::Schedule => "schedule",
            LifecycleStep::Inspect => "inspect",
            LifecycleStep::Safety => "safety",
            LifecycleStep::Unmount => "unmount",
            LifecycleStep::PurgeRecords => "purge-records",
            LifecycleStep::WipeSignatures => "wipe-signatures",
            LifecycleStep::Partition => "partition",
            LifecycleStep::Settle => "settle",
            LifecycleStep::Format => "format",
            LifecycleStep::ReadUuid => "read-uuid",
            LifecycleStep::CreateMountPoint => "create-mount-point",
            LifecycleStep::AppendRecord => "append-record",
            LifecycleStep::Mount => "mount",
            LifecycleStep::CreateDataDir => "create-data-dir",
            LifecycleStep::AssignOwnership => "assign-ownership",
        }
    }

    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            LifecycleStep::Unmount | LifecycleStep::WipeSignatures | LifecycleStep::AssignOwnership
        )
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceOutcome {
    Converged { uuid: String, reformatted: bool },
    Failed { error: DeviceLifecycleError },
    TimedOut { after_secs: u64 },
}

impl DeviceOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, DeviceOutcome::Converged { .. })
    }

    pub fn label(&self) -> String {
        match self {
            DeviceOutcome::Converged { reformatted: true, .. } => "CONVERGED".to_string(),
            DeviceOutcome::Converged { reformatted: false, .. } => "CONVERGED (unchanged)".to_string(),
            DeviceOutcome::Failed { error } => format!("FAILED({}: {})", error.step, error.cause),
            DeviceOutcome::TimedOut { after_secs } => format!("TIMEOUT({}s)", after_secs),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device: String,
    pub slot_index: u32,
    pub mount_point: PathBuf,
    pub initial_state: Option<DeviceState>,
    pub outcome: DeviceOutcome,
    pub warnings: Vec<BestEffortWarning>,
    pub log: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Exclusion {
    SystemDevice,
    MetadataVolume,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    pub device: BlockDevice,
    pub exclusion: Option<Exclusion>,
    pub slot_index: Option<u32>,
    pub mount_point: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceInventory {
    pub inventory_id: Uuid,
    pub schema_version: String,
    pub host: HostInfo,
    pub entries: Vec<InventoryEntry>,
    pub generated_at_utc: String,
}

impl DeviceInventory {
    pub fn new(host: HostInfo, entries: Vec<InventoryEntry>) -> Self {
        Self {
            inventory_id: Uuid::new_v4(),
            schema_version: INVENTORY_SCHEMA_VERSION.to_string(),
            host,
            entries,
            generated_at_utc: now_utc_rfc3339(),
        }
    }
}

/// Result of one orchestrator run over a host.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchSummary {
    pub mode: ProvisionMode,
    pub started_at_utc: String,
    pub finished_at_utc: String,
    pub inventory: DeviceInventory,
    pub reports: Vec<DeviceReport>,
}

impl BatchSummary {
    pub fn all_converged(&self) -> bool {
        self.reports.iter().all(|report| report.outcome.is_converged())
    }

    pub fn failed_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|report| !report.outcome.is_converged())
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.reports.iter().map(|report| report.warnings.len()).sum()
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
