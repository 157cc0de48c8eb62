use mountwright_core::{BlockDevice, DeviceState, ProvisionError, ProvisionMode};

#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub mode: ProvisionMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Allow,
    AlreadyConverged,
    Deny(String),
}

/// Batch-level gate: nothing is touched without root.
pub fn require_privilege(privileged: bool) -> Result<(), ProvisionError> {
    if privileged {
        return Ok(());
    }
    Err(ProvisionError::Privilege {
        reason: "partitioning, formatting and editing the mount table require root".to_string(),
    })
}

/// Per-device gate for the destructive lifecycle.
///
/// Only `force-reformat` may destroy an existing filesystem, mount or table
/// record. Raw devices hold nothing to lose and are always allowed.
pub fn can_provision_device(
    ctx: &SafetyContext,
    device: &BlockDevice,
    state: DeviceState,
) -> SafetyDecision {
    if device.is_system_device {
        return SafetyDecision::Deny(format!(
            "refusing to provision system device: {}",
            device.path.display()
        ));
    }

    match ctx.mode {
        ProvisionMode::ForceReformat => SafetyDecision::Allow,
        ProvisionMode::Detect => match state {
            DeviceState::Converged => SafetyDecision::AlreadyConverged,
            DeviceState::UnknownRaw => SafetyDecision::Allow,
            other => SafetyDecision::Deny(format!(
                "device is {}; rerun with --force-reformat to wipe and reformat it",
                other
            )),
        },
    }
}
