use crate::error::ProvisionError;
use crate::fstab::{MountSource, PersistentMountRecord};
use crate::FilesystemType;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MOUNT_PREFIX: &str = "/mnt/disk";
pub const DEFAULT_METADATA_LABEL: &str = "cidata";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "minio-user";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionMode {
    /// Skip converged devices, provision raw ones, refuse everything else.
    Detect,
    /// Replay the full destructive lifecycle on every eligible device.
    ForceReformat,
}

impl ProvisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionMode::Detect => "detect",
            ProvisionMode::ForceReformat => "force-reformat",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Mount points are `<mount_prefix><slot>`, e.g. `/mnt/disk1`.
    pub mount_prefix: String,
    pub filesystem: FilesystemType,
    pub mount_options: String,
    pub dump: u32,
    pub pass: u32,
    /// Label of the hypervisor seed volume, never provisioned.
    pub metadata_label: String,
    pub service_account: Option<String>,
    pub data_dir_name: String,
    pub settle_timeout_secs: u64,
    pub device_timeout_secs: u64,
    pub mode: ProvisionMode,
    pub parallel: bool,
    pub allow_empty: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            mount_prefix: DEFAULT_MOUNT_PREFIX.to_string(),
            filesystem: FilesystemType::Xfs,
            mount_options: "defaults".to_string(),
            dump: 0,
            pass: 2,
            metadata_label: DEFAULT_METADATA_LABEL.to_string(),
            service_account: Some(DEFAULT_SERVICE_ACCOUNT.to_string()),
            data_dir_name: "data".to_string(),
            settle_timeout_secs: 10,
            device_timeout_secs: 600,
            mode: ProvisionMode::Detect,
            parallel: false,
            allow_empty: true,
        }
    }
}

impl ProvisionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProvisionError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ProvisionError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ProvisionConfig =
            serde_json::from_str(&data).map_err(|err| ProvisionError::Config {
                reason: format!("{}: {}", path.display(), err),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProvisionError> {
        if !self.mount_prefix.starts_with('/') {
            return Err(config_error(format!(
                "mount_prefix must be absolute: {}",
                self.mount_prefix
            )));
        }
        if self.mount_prefix.ends_with('/') || self.mount_prefix.chars().any(char::is_whitespace) {
            return Err(config_error(format!(
                "mount_prefix must not end in '/' or contain whitespace: {:?}",
                self.mount_prefix
            )));
        }
        if self.mount_options.trim().is_empty() || self.mount_options.contains(char::is_whitespace)
        {
            return Err(config_error("mount_options must be a single non-empty field"));
        }
        let mut components = Path::new(&self.data_dir_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => {
                return Err(config_error(format!(
                    "data_dir_name must be a single path component: {}",
                    self.data_dir_name
                )))
            }
        }
        if self.settle_timeout_secs == 0 {
            return Err(config_error("settle_timeout_secs must be non-zero"));
        }
        if self.device_timeout_secs == 0 {
            return Err(config_error("device_timeout_secs must be non-zero"));
        }
        if let Some(account) = &self.service_account {
            if account.trim().is_empty() {
                return Err(config_error("service_account must not be empty"));
            }
        }
        Ok(())
    }

    pub fn mount_point_for(&self, slot_index: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.mount_prefix, slot_index))
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    /// The UUID-keyed table record written for a freshly formatted partition.
    pub fn record_for(&self, uuid: &str, mount_point: &Path) -> PersistentMountRecord {
        PersistentMountRecord {
            source: MountSource::Uuid(uuid.to_string()),
            mount_point: mount_point.to_path_buf(),
            fs_type: self.filesystem.as_str().to_string(),
            options: self.mount_options.clone(),
            dump: self.dump,
            pass: self.pass,
        }
    }
}

fn config_error(reason: impl Into<String>) -> ProvisionError {
    ProvisionError::Config {
        reason: reason.into(),
    }
}
