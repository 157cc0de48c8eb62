//! Device classification and mount-slot assignment. Both are pure.

use mountwright_core::{BlockDevice, Exclusion, InventoryEntry, MountAssignment, ProvisionConfig};

/// Why `device` is not a candidate data disk, if it is not.
///
/// The metadata label comparison ignores ASCII case: seed volumes show up as
/// both `cidata` and `CIDATA` depending on the filesystem that carries them.
pub fn exclusion_reason(device: &BlockDevice, metadata_label: &str) -> Option<Exclusion> {
    if device.is_system_device {
        return Some(Exclusion::SystemDevice);
    }
    match &device.label {
        Some(label) if label.eq_ignore_ascii_case(metadata_label) => {
            Some(Exclusion::MetadataVolume)
        }
        _ => None,
    }
}

/// Eligible devices, in input order.
pub fn eligible_devices(devices: &[BlockDevice], metadata_label: &str) -> Vec<BlockDevice> {
    devices
        .iter()
        .filter(|device| exclusion_reason(device, metadata_label).is_none())
        .cloned()
        .collect()
}

/// Slots are 1-based and follow input order. They are not persisted, so a
/// device removed between runs shifts every later slot.
pub fn assign_slots(eligible: Vec<BlockDevice>, config: &ProvisionConfig) -> Vec<MountAssignment> {
    eligible
        .into_iter()
        .zip(1u32..)
        .map(|(device, slot_index)| MountAssignment {
            mount_point: config.mount_point_for(slot_index),
            device,
            slot_index,
        })
        .collect()
}

pub fn classify_inventory(devices: &[BlockDevice], config: &ProvisionConfig) -> Vec<InventoryEntry> {
    let mut next_slot = 1u32;
    devices
        .iter()
        .map(|device| {
            let exclusion = exclusion_reason(device, &config.metadata_label);
            let slot_index = if exclusion.is_none() {
                next_slot += 1;
                Some(next_slot - 1)
            } else {
                None
            };
            InventoryEntry {
                device: device.clone(),
                exclusion,
                slot_index,
                mount_point: slot_index.map(|slot| config.mount_point_for(slot)),
            }
        })
        .collect()
}
