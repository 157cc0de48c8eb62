//! The per-device lifecycle: any prior state -> converged.

use crate::mount_table::MountTableEditor;
use crate::state::{inspect_device, Inspection};
use anyhow::{anyhow, Result};
use mountwright_core::{
    BestEffortWarning, DeviceLifecycleError, DeviceOutcome, DeviceReport, DeviceState, DiskHost,
    LifecycleStep, MountAssignment, ProvisionConfig,
};
use mountwright_safety::{can_provision_device, SafetyContext, SafetyDecision};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};

/// Partition span handed to the partitioner, in percent of the device.
const FULL_SPAN_PERCENT: u8 = 100;

/// Everything one lifecycle produced, successful or not.
#[derive(Debug, Clone)]
pub struct DeviceRun {
    pub assignment: MountAssignment,
    pub initial_state: Option<DeviceState>,
    pub outcome: DeviceOutcome,
    pub warnings: Vec<BestEffortWarning>,
    pub log: Vec<String>,
}

impl DeviceRun {
    pub fn into_report(self) -> DeviceReport {
        DeviceReport {
            device: self.assignment.device.path.display().to_string(),
            slot_index: self.assignment.slot_index,
            mount_point: self.assignment.mount_point,
            initial_state: self.initial_state,
            outcome: self.outcome,
            warnings: self.warnings,
            log: self.log,
        }
    }
}

struct StepRecorder {
    device: String,
    warnings: Vec<BestEffortWarning>,
    log: Vec<String>,
}

impl StepRecorder {
    fn note(&mut self, line: String) {
        debug!(device = %self.device, "{}", line);
        self.log.push(line);
    }

    fn fatal<T>(&mut self, step: LifecycleStep, result: Result<T>) -> Result<T, DeviceLifecycleError> {
        match result {
            Ok(value) => {
                self.note(format!("{}=ok", step));
                Ok(value)
            }
            Err(err) => {
                let error = DeviceLifecycleError::new(self.device.clone(), step, &err);
                error!(device = %self.device, %step, error = %error.cause, "fatal step failed");
                self.log.push(format!("{}=failed: {}", step, error.cause));
                Err(error)
            }
        }
    }

    fn best_effort(&mut self, step: LifecycleStep, result: Result<()>) {
        match result {
            Ok(()) => self.note(format!("{}=ok", step)),
            Err(err) => {
                let warning = BestEffortWarning::new(self.device.clone(), step, &err);
                warn!(device = %self.device, %step, error = %warning.cause, "best-effort step failed");
                self.log.push(format!("{}=warning: {}", step, warning.cause));
                self.warnings.push(warning);
            }
        }
    }
}

/// Drives one assignment to convergence.
///
/// In `force-reformat` mode every step is replayed unconditionally: the device
/// is unmounted, wiped, repartitioned and reformatted on every invocation, so
/// anything written to it since the previous run is destroyed.
#[derive(Clone)]
pub struct LifecycleExecutor {
    host: Arc<dyn DiskHost>,
    table: Arc<MountTableEditor>,
    config: Arc<ProvisionConfig>,
}

impl LifecycleExecutor {
    pub fn new(
        host: Arc<dyn DiskHost>,
        table: Arc<MountTableEditor>,
        config: Arc<ProvisionConfig>,
    ) -> Self {
        Self {
            host,
            table,
            config,
        }
    }

    pub fn converge(&self, assignment: MountAssignment) -> DeviceRun {
        let device = assignment.device.path.display().to_string();
        let span = info_span!("device", device = %device, slot = assignment.slot_index);
        let _enter = span.enter();

        let mut recorder = StepRecorder {
            device,
            warnings: Vec::new(),
            log: vec![format!(
                "assignment slot={} mount_point={}",
                assignment.slot_index,
                assignment.mount_point.display()
            )],
        };

        let mut initial_state = None;
        let outcome = match self.drive(&assignment, &mut recorder, &mut initial_state) {
            Ok(outcome) => outcome,
            Err(error) => DeviceOutcome::Failed { error },
        };
        match &outcome {
            DeviceOutcome::Converged { uuid, reformatted } => info!(
                mount_point = %assignment.mount_point.display(),
                %uuid,
                reformatted,
                "device converged"
            ),
            other => warn!(outcome = %other.label(), "device did not converge"),
        }

        DeviceRun {
            assignment,
            initial_state,
            outcome,
            warnings: recorder.warnings,
            log: recorder.log,
        }
    }

    fn drive(
        &self,
        assignment: &MountAssignment,
        recorder: &mut StepRecorder,
        initial_state: &mut Option<DeviceState>,
    ) -> Result<DeviceOutcome, DeviceLifecycleError> {
        let inspection = recorder.fatal(LifecycleStep::Inspect, self.inspect(assignment))?;
        *initial_state = Some(inspection.state);
        recorder.note(format!("state={}", inspection.state));

        let ctx = SafetyContext {
            mode: self.config.mode,
        };
        match can_provision_device(&ctx, &assignment.device, inspection.state) {
            SafetyDecision::Allow => {}
            SafetyDecision::AlreadyConverged => {
                recorder.note("already converged; nothing to do".to_string());
                return Ok(DeviceOutcome::Converged {
                    uuid: inspection.partition_uuid.unwrap_or_default(),
                    reformatted: false,
                });
            }
            SafetyDecision::Deny(reason) => {
                return recorder.fatal(LifecycleStep::Safety, Err(anyhow!(reason)));
            }
        }

        let uuid = self.replay(assignment, &inspection, recorder)?;
        Ok(DeviceOutcome::Converged {
            uuid,
            reformatted: true,
        })
    }

    fn inspect(&self, assignment: &MountAssignment) -> Result<Inspection> {
        let table = self.table.snapshot()?;
        inspect_device(self.host.as_ref(), &table, assignment, &self.config)
    }

    fn replay(
        &self,
        assignment: &MountAssignment,
        inspection: &Inspection,
        recorder: &mut StepRecorder,
    ) -> Result<String, DeviceLifecycleError> {
        let host = self.host.as_ref();
        let device = &assignment.device;
        let partition = assignment.partition();
        let mount_point = &assignment.mount_point;

        // Deepest mount points first.
        match host.active_mounts(device) {
            Ok(mounts) => {
                let mut seen = HashSet::new();
                let mut targets: Vec<PathBuf> = mounts
                    .into_iter()
                    .map(|mount| mount.mount_point)
                    .filter(|path| seen.insert(path.clone()))
                    .collect();
                targets.sort_by_key(|path| Reverse(path.components().count()));
                for target in targets {
                    recorder.note(format!("unmount {}", target.display()));
                    recorder.best_effort(LifecycleStep::Unmount, host.unmount(&target));
                }
            }
            Err(err) => recorder.best_effort(LifecycleStep::Unmount, Err(err)),
        }

        // Device-keyed records, records for any of the old filesystems, and
        // anything already claiming this mount point.
        let removed = recorder.fatal(
            LifecycleStep::PurgeRecords,
            self.table.remove_matching(|record| {
                record.references_device(&device.path)
                    || record.mount_point == *mount_point
                    || record
                        .uuid()
                        .map_or(false, |uuid| inspection.prior_uuids.iter().any(|u| u == uuid))
            }),
        )?;
        for record in removed {
            recorder.note(format!("purged record: {}", record.render()));
        }

        recorder.best_effort(
            LifecycleStep::WipeSignatures,
            host.wipe_signatures(&device.path),
        );

        recorder.fatal(
            LifecycleStep::Partition,
            host.create_gpt(&device.path)
                .and_then(|()| host.create_partition(&device.path, FULL_SPAN_PERCENT)),
        )?;

        recorder.fatal(
            LifecycleStep::Settle,
            host.wait_for_device(&partition, self.config.settle_timeout()),
        )?;

        // Forced: a signature the wipe missed must not block mkfs.
        recorder.fatal(
            LifecycleStep::Format,
            host.format_filesystem(&partition, self.config.filesystem, true),
        )?;

        let uuid = recorder.fatal(
            LifecycleStep::ReadUuid,
            host.filesystem_uuid(&partition).and_then(|uuid| {
                uuid.filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow!("no filesystem UUID on {}", partition.display()))
            }),
        )?;
        recorder.note(format!("uuid={}", uuid));

        recorder.fatal(LifecycleStep::CreateMountPoint, host.create_dir_all(mount_point))?;

        let record = self.config.record_for(&uuid, mount_point);
        recorder.note(format!("record: {}", record.render()));
        recorder.fatal(LifecycleStep::AppendRecord, self.table.append(record))?;

        // Through the table, so a bad record fails here rather than at boot.
        recorder.fatal(LifecycleStep::Mount, host.mount_by_table(mount_point))?;

        let data_dir = assignment.data_dir(&self.config.data_dir_name);
        recorder.fatal(LifecycleStep::CreateDataDir, host.create_dir_all(&data_dir))?;

        self.assign_ownership(&data_dir, recorder);

        Ok(uuid)
    }

    fn assign_ownership(&self, data_dir: &Path, recorder: &mut StepRecorder) {
        let Some(account) = self.config.service_account.as_deref() else {
            return;
        };
        match self.host.account_exists(account) {
            Ok(true) => recorder.best_effort(
                LifecycleStep::AssignOwnership,
                self.host.chown_recursive(data_dir, account),
            ),
            Ok(false) => {
                info!(account, "service account absent; keeping default ownership");
                recorder.note(format!("account {} absent; ownership unchanged", account));
            }
            Err(err) => recorder.best_effort(LifecycleStep::AssignOwnership, Err(err)),
        }
    }
}
