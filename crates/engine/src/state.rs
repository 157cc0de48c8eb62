//! Reconstructs a device's lifecycle state from live host inspection.

use anyhow::Result;
use mountwright_core::{
    DeviceState, DiskHost, MountAssignment, MountSource, MountTable, ProvisionConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub state: DeviceState,
    /// UUID of the first partition's filesystem, if any.
    pub partition_uuid: Option<String>,
    /// Every filesystem UUID found on the device before it is touched.
    pub prior_uuids: Vec<String>,
}

pub fn inspect_device(
    host: &dyn DiskHost,
    table: &MountTable,
    assignment: &MountAssignment,
    config: &ProvisionConfig,
) -> Result<Inspection> {
    let device = &assignment.device;
    let partition = assignment.partition();
    let mounts = host.active_mounts(device)?;
    let partitions = host.list_partitions(device)?;

    let disk_fs = host.filesystem_type(&device.path)?;
    let mut prior_uuids: Vec<String> = host.filesystem_uuid(&device.path)?.into_iter().collect();
    let mut partition_fs = None;
    let mut partition_uuid = None;
    for node in &partitions {
        let fs_type = host.filesystem_type(node)?;
        let uuid = host.filesystem_uuid(node)?;
        if *node == partition {
            partition_fs = fs_type;
            partition_uuid = uuid.clone();
        }
        push_unique(&mut prior_uuids, uuid);
    }
    for mount in &mounts {
        push_unique(&mut prior_uuids, host.filesystem_uuid(&mount.source)?);
    }

    let converged = partition_fs.as_deref() == Some(config.filesystem.as_str())
        && mounts
            .iter()
            .any(|mount| mount.source == partition && mount.mount_point == assignment.mount_point)
        && is_single_uuid_record(table, assignment, partition_uuid.as_deref())
        && host.path_exists(&assignment.data_dir(&config.data_dir_name));

    // Any partition at all counts as content, whatever its number.
    let state = if converged {
        DeviceState::Converged
    } else if table
        .records()
        .any(|record| record.references_device(&device.path))
    {
        DeviceState::StaleRecorded
    } else if !mounts.is_empty() {
        DeviceState::MountedElsewhereOrStale
    } else if !partitions.is_empty() || disk_fs.is_some() {
        DeviceState::Formatted
    } else {
        DeviceState::UnknownRaw
    };

    Ok(Inspection {
        state,
        partition_uuid,
        prior_uuids,
    })
}

fn push_unique(uuids: &mut Vec<String>, uuid: Option<String>) {
    if let Some(uuid) = uuid {
        if !uuids.contains(&uuid) {
            uuids.push(uuid);
        }
    }
}

fn is_single_uuid_record(
    table: &MountTable,
    assignment: &MountAssignment,
    partition_uuid: Option<&str>,
) -> bool {
    let Some(uuid) = partition_uuid else {
        return false;
    };
    let records: Vec<_> = table
        .records_for_mount_point(&assignment.mount_point)
        .collect();
    records.len() == 1 && records[0].source == MountSource::Uuid(uuid.to_string())
}
