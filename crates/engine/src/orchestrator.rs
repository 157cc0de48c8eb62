use crate::classify::{assign_slots, classify_inventory, eligible_devices};
use crate::lifecycle::{DeviceRun, LifecycleExecutor};
use crate::mount_table::MountTableEditor;
use crate::state::inspect_device;
use mountwright_core::{
    now_utc_rfc3339, BatchSummary, BlockDevice, DeviceInventory, DeviceLifecycleError,
    DeviceOutcome, DeviceReport, DeviceState, DiskHost, LifecycleStep, MountAssignment,
    ProvisionConfig, ProvisionError,
};
use mountwright_safety::{can_provision_device, require_privilege, SafetyContext, SafetyDecision};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", content = "reason", rename_all = "kebab-case")]
pub enum PlannedAction {
    Provision,
    Skip,
    Refuse(String),
    Unknown(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub assignment: MountAssignment,
    pub state: Option<DeviceState>,
    pub action: PlannedAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub inventory: DeviceInventory,
    pub entries: Vec<PlanEntry>,
}

/// Classifier -> slot assigner -> lifecycle executor, for one host.
///
/// Outcomes come back in assignment order. A failed or timed-out device never
/// stops the others; whether that fails the batch is the caller's call.
pub struct BatchOrchestrator {
    host: Arc<dyn DiskHost>,
    config: Arc<ProvisionConfig>,
    table: Arc<MountTableEditor>,
}

impl BatchOrchestrator {
    pub fn new(host: Arc<dyn DiskHost>, config: ProvisionConfig) -> Self {
        Self {
            table: Arc::new(MountTableEditor::new(host.clone())),
            host,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    pub fn inventory(&self) -> Result<(Vec<BlockDevice>, DeviceInventory), ProvisionError> {
        let devices = self
            .host
            .list_block_devices()
            .map_err(|err| ProvisionError::Enumeration {
                cause: format!("{:#}", err),
            })?;
        let inventory = DeviceInventory::new(
            self.host.host_info(),
            classify_inventory(&devices, &self.config),
        );
        Ok((devices, inventory))
    }

    /// Dry run: what `run` would do to each eligible device. Touches nothing.
    pub fn plan(&self) -> Result<BatchPlan, ProvisionError> {
        let (devices, inventory) = self.inventory()?;
        let assignments = self.assignments(&devices)?;
        let table = self.table.snapshot().map_err(|err| ProvisionError::Enumeration {
            cause: format!("read mount table: {:#}", err),
        })?;
        let ctx = SafetyContext {
            mode: self.config.mode,
        };

        let entries = assignments
            .into_iter()
            .map(|assignment| {
                match inspect_device(self.host.as_ref(), &table, &assignment, &self.config) {
                    Ok(inspection) => {
                        let action =
                            match can_provision_device(&ctx, &assignment.device, inspection.state)
                            {
                                SafetyDecision::Allow => PlannedAction::Provision,
                                SafetyDecision::AlreadyConverged => PlannedAction::Skip,
                                SafetyDecision::Deny(reason) => PlannedAction::Refuse(reason),
                            };
                        PlanEntry {
                            assignment,
                            state: Some(inspection.state),
                            action,
                        }
                    }
                    Err(err) => PlanEntry {
                        assignment,
                        state: None,
                        action: PlannedAction::Unknown(format!("{:#}", err)),
                    },
                }
            })
            .collect();

        Ok(BatchPlan { inventory, entries })
    }

    pub fn run(&self) -> Result<BatchSummary, ProvisionError> {
        require_privilege(self.host.is_privileged())?;
        let started_at_utc = now_utc_rfc3339();
        let (devices, inventory) = self.inventory()?;
        let assignments = self.assignments(&devices)?;

        info!(
            devices = devices.len(),
            eligible = assignments.len(),
            mode = self.config.mode.as_str(),
            parallel = self.config.parallel,
            "provisioning batch"
        );

        let executor = LifecycleExecutor::new(
            self.host.clone(),
            self.table.clone(),
            self.config.clone(),
        );
        let reports = if self.config.parallel {
            let pending: Vec<_> = assignments
                .into_iter()
                .map(|assignment| self.dispatch(&executor, assignment))
                .collect();
            pending
                .into_iter()
                .map(|pending| self.collect(pending))
                .collect()
        } else {
            assignments
                .into_iter()
                .map(|assignment| {
                    let pending = self.dispatch(&executor, assignment);
                    self.collect(pending)
                })
                .collect()
        };

        let summary = BatchSummary {
            mode: self.config.mode,
            started_at_utc,
            finished_at_utc: now_utc_rfc3339(),
            inventory,
            reports,
        };
        if summary.all_converged() {
            info!(devices = summary.reports.len(), "batch converged");
        } else {
            error!(
                failed = summary.failed_count(),
                devices = summary.reports.len(),
                "batch finished with failed devices"
            );
        }
        Ok(summary)
    }

    fn assignments(&self, devices: &[BlockDevice]) -> Result<Vec<MountAssignment>, ProvisionError> {
        let eligible = eligible_devices(devices, &self.config.metadata_label);
        if eligible.is_empty() {
            if !self.config.allow_empty {
                return Err(ProvisionError::NoEligibleDevices {
                    enumerated: devices.len(),
                });
            }
            warn!(enumerated = devices.len(), "no eligible data devices");
        }
        Ok(assign_slots(eligible, &self.config))
    }

    fn dispatch(&self, executor: &LifecycleExecutor, assignment: MountAssignment) -> Pending {
        let (sender, receiver) = mpsc::channel();
        let worker = executor.clone();
        let job = assignment.clone();
        let spawned = thread::Builder::new()
            .name(format!("provision-{}", assignment.device.identifier))
            .spawn(move || {
                let run = worker.converge(job);
                let _ = sender.send(run);
            });
        Pending {
            started: Instant::now(),
            spawn_error: spawned.err().map(anyhow::Error::from),
            assignment,
            receiver,
        }
    }

    fn collect(&self, pending: Pending) -> DeviceReport {
        let Pending {
            assignment,
            receiver,
            started,
            spawn_error,
        } = pending;
        if let Some(err) = spawn_error {
            return failed_report(assignment, LifecycleStep::Schedule, &err);
        }

        let deadline = started + self.config.device_timeout();
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok(run) => run.into_report(),
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    device = %assignment.device.path.display(),
                    timeout_secs = self.config.device_timeout_secs,
                    "device lifecycle timed out; worker left running"
                );
                DeviceRun {
                    outcome: DeviceOutcome::TimedOut {
                        after_secs: self.config.device_timeout_secs,
                    },
                    initial_state: None,
                    warnings: Vec::new(),
                    log: vec!["timed out".to_string()],
                    assignment,
                }
                .into_report()
            }
            Err(RecvTimeoutError::Disconnected) => failed_report(
                assignment,
                LifecycleStep::Schedule,
                &anyhow::anyhow!("lifecycle worker exited without a result"),
            ),
        }
    }
}

struct Pending {
    assignment: MountAssignment,
    receiver: Receiver<DeviceRun>,
    started: Instant,
    spawn_error: Option<anyhow::Error>,
}

fn failed_report(
    assignment: MountAssignment,
    step: LifecycleStep,
    err: &anyhow::Error,
) -> DeviceReport {
    let error =
        DeviceLifecycleError::new(assignment.device.path.display().to_string(), step, err);
    DeviceRun {
        log: vec![format!("{}=failed: {}", step, error.cause)],
        outcome: DeviceOutcome::Failed { error },
        initial_state: None,
        warnings: Vec::new(),
        assignment,
    }
    .into_report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeHost, FakeOp};
    use mountwright_core::{MountTable, ProvisionMode};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    /// A VM: system disk `vda`, cloud-init seed `vdb`, then the data disks.
    fn vm_host(data_disks: &[&str]) -> Arc<FakeHost> {
        let host = Arc::new(FakeHost::new());
        host.add_system_disk("vda");
        host.add_disk("vdb");
        host.put_labeled_filesystem("/dev/vdb", "iso9660", "seed-uuid", "cidata");
        for disk in data_disks {
            host.add_disk(disk);
        }
        host.add_account("minio-user");
        host.set_table("# static\nLABEL=cloudimg-rootfs / ext4 defaults 0 1\n");
        host
    }

    fn config(mode: ProvisionMode) -> ProvisionConfig {
        ProvisionConfig {
            mode,
            settle_timeout_secs: 1,
            device_timeout_secs: 5,
            ..ProvisionConfig::default()
        }
    }

    fn run(host: &Arc<FakeHost>, config: ProvisionConfig) -> BatchSummary {
        BatchOrchestrator::new(host.clone(), config).run().unwrap()
    }

    fn data_records(host: &FakeHost) -> Vec<String> {
        MountTable::parse(&host.table())
            .records()
            .filter(|record| record.mount_point.starts_with("/mnt"))
            .map(|record| record.render())
            .collect()
    }

    fn uuid_of(report: &DeviceReport) -> String {
        match &report.outcome {
            DeviceOutcome::Converged { uuid, .. } => uuid.clone(),
            other => panic!("expected convergence, got {:?}", other),
        }
    }

    #[test]
    fn fresh_disk_converges() {
        let host = vm_host(&["vdc"]);
        let summary = run(&host, config(ProvisionMode::Detect));

        assert_eq!(summary.reports.len(), 1);
        let report = &summary.reports[0];
        assert_eq!(report.device, "/dev/vdc");
        assert_eq!(report.mount_point, PathBuf::from("/mnt/disk1"));
        assert_eq!(report.initial_state, Some(DeviceState::UnknownRaw));
        assert!(report.warnings.is_empty());

        let uuid = uuid_of(report);
        assert_eq!(host.filesystem("/dev/vdc1"), Some(("xfs".to_string(), uuid.clone())));
        assert_eq!(
            data_records(&host),
            vec![format!("UUID={} /mnt/disk1 xfs defaults 0 2", uuid)]
        );
        assert_eq!(
            host.mount_source("/mnt/disk1"),
            Some((PathBuf::from("/dev/vdc1"), "xfs".to_string()))
        );
        assert!(host.has_dir("/mnt/disk1/data"));
        assert_eq!(host.owner("/mnt/disk1/data").as_deref(), Some("minio-user"));
        assert!(host.table().starts_with("# static\n"));
    }

    #[test]
    fn previously_mounted_disk_is_reformatted() {
        let host = vm_host(&["vdc"]);
        host.put_filesystem("/dev/vdc1", "ext4", "old-uuid");
        host.put_mount("/dev/vdc1", "/mnt/disk1", "ext4");
        host.set_table("/dev/vdc1 /mnt/disk1 ext4 defaults 0 0\n");

        let summary = run(&host, config(ProvisionMode::ForceReformat));
        let report = &summary.reports[0];
        assert_eq!(report.initial_state, Some(DeviceState::StaleRecorded));
        let uuid = uuid_of(report);
        assert_ne!(uuid, "old-uuid");

        assert_eq!(host.filesystem("/dev/vdc1"), Some(("xfs".to_string(), uuid.clone())));
        assert!(!host.table().contains("/dev/vdc1"));
        assert_eq!(
            data_records(&host),
            vec![format!("UUID={} /mnt/disk1 xfs defaults 0 2", uuid)]
        );
        assert_eq!(
            host.mount_source("/mnt/disk1"),
            Some((PathBuf::from("/dev/vdc1"), "xfs".to_string()))
        );
    }

    #[test]
    fn stale_record_without_mount_is_purged() {
        let host = vm_host(&["vdc"]);
        host.set_table("/dev/vdc1 /srv/old ext4 defaults 0 0\n/dev/vdc /srv/raw xfs defaults 0 0\n");

        let summary = run(&host, config(ProvisionMode::ForceReformat));
        let uuid = uuid_of(&summary.reports[0]);
        let table = MountTable::parse(&host.table());
        assert!(!table
            .records()
            .any(|record| record.references_device(Path::new("/dev/vdc"))));
        let keyed: Vec<_> = table.records().filter_map(|r| r.uuid()).collect();
        assert_eq!(keyed, vec![uuid.as_str()]);
    }

    #[test]
    fn detect_mode_refuses_used_disk() {
        let host = vm_host(&["vdc"]);
        host.put_filesystem("/dev/vdc1", "ext4", "old-uuid");
        host.put_mount("/dev/vdc1", "/mnt/disk1", "ext4");
        host.set_table("/dev/vdc1 /mnt/disk1 ext4 defaults 0 0\n");

        let summary = run(&host, config(ProvisionMode::Detect));
        match &summary.reports[0].outcome {
            DeviceOutcome::Failed { error } => assert_eq!(error.step, LifecycleStep::Safety),
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(host.filesystem("/dev/vdc1"), Some(("ext4".to_string(), "old-uuid".to_string())));
        assert_eq!(host.table(), "/dev/vdc1 /mnt/disk1 ext4 defaults 0 0\n");
        assert_eq!(host.format_count(), 0);
    }

    #[test]
    fn detect_mode_keeps_data_on_a_logical_partition() {
        let host = vm_host(&["vdc"]);
        host.put_filesystem("/dev/vdc5", "ext4", "user-data");

        let summary = run(&host, config(ProvisionMode::Detect));
        let report = &summary.reports[0];
        assert_eq!(report.initial_state, Some(DeviceState::Formatted));
        match &report.outcome {
            DeviceOutcome::Failed { error } => assert_eq!(error.step, LifecycleStep::Safety),
            other => panic!("expected refusal, got {:?}", other),
        }
        assert_eq!(host.format_count(), 0);
        assert_eq!(
            host.filesystem("/dev/vdc5"),
            Some(("ext4".to_string(), "user-data".to_string()))
        );
    }

    #[test]
    fn forced_run_purges_records_of_every_old_partition() {
        let host = vm_host(&["vdc"]);
        host.put_filesystem("/dev/vdc1", "xfs", "p1-uuid");
        host.put_filesystem("/dev/vdc2", "ext4", "p2-uuid");
        host.set_table("# static\nUUID=p2-uuid /srv/old ext4 defaults 0 2\n");

        let summary = run(&host, config(ProvisionMode::ForceReformat));
        let uuid = uuid_of(&summary.reports[0]);
        assert!(!host.table().contains("p2-uuid"));
        assert_eq!(
            host.table(),
            format!("# static\nUUID={} /mnt/disk1 xfs defaults 0 2\n", uuid)
        );
    }

    #[test]
    fn three_devices_get_sequential_slots() {
        let host = vm_host(&["vdc", "vdd", "vde"]);
        let summary = run(&host, config(ProvisionMode::Detect));

        let slots: Vec<_> = summary
            .reports
            .iter()
            .map(|r| (r.device.as_str(), r.mount_point.clone()))
            .collect();
        assert_eq!(
            slots,
            vec![
                ("/dev/vdc", PathBuf::from("/mnt/disk1")),
                ("/dev/vdd", PathBuf::from("/mnt/disk2")),
                ("/dev/vde", PathBuf::from("/mnt/disk3")),
            ]
        );
        assert!(summary.all_converged());
        assert_eq!(data_records(&host).len(), 3);
    }

    #[test]
    fn format_failure_is_isolated_to_its_device() {
        let host = vm_host(&["vdc", "vdd", "vde"]);
        host.fail(FakeOp::Format, "/dev/vdd1", "mkfs.xfs: cannot open /dev/vdd1");

        let summary = run(&host, config(ProvisionMode::Detect));
        assert!(summary.reports[0].outcome.is_converged());
        assert!(summary.reports[2].outcome.is_converged());
        match &summary.reports[1].outcome {
            DeviceOutcome::Failed { error } => {
                assert_eq!(error.step, LifecycleStep::Format);
                assert_eq!(error.device, "/dev/vdd");
                assert!(error.cause.contains("cannot open"));
            }
            other => panic!("expected format failure, got {:?}", other),
        }
        assert_eq!(summary.failed_count(), 1);
        assert!(host.mount_source("/mnt/disk1").is_some());
        assert!(host.mount_source("/mnt/disk2").is_none());
        assert!(host.mount_source("/mnt/disk3").is_some());
        assert!(!host.table().contains("/mnt/disk2"));
    }

    #[test]
    fn forced_rerun_is_idempotent() {
        let host = vm_host(&["vdc", "vdd"]);
        let first = run(&host, config(ProvisionMode::ForceReformat));
        let second = run(&host, config(ProvisionMode::ForceReformat));

        let mount_points = |summary: &BatchSummary| -> Vec<PathBuf> {
            summary.reports.iter().map(|r| r.mount_point.clone()).collect()
        };
        assert_eq!(mount_points(&first), mount_points(&second));
        assert!(second.all_converged());

        let records = data_records(&host);
        assert_eq!(records.len(), 2);
        for report in &second.reports {
            let expected = format!(
                "UUID={} {} xfs defaults 0 2",
                uuid_of(report),
                report.mount_point.display()
            );
            assert!(records.contains(&expected), "missing {}", expected);
        }
        assert_eq!(host.format_count(), 4);
    }

    #[test]
    fn detect_rerun_leaves_converged_disks_alone() {
        let host = vm_host(&["vdc"]);
        let first = run(&host, config(ProvisionMode::Detect));
        let second = run(&host, config(ProvisionMode::Detect));

        assert_eq!(uuid_of(&first.reports[0]), uuid_of(&second.reports[0]));
        assert_eq!(second.reports[0].initial_state, Some(DeviceState::Converged));
        assert!(matches!(
            second.reports[0].outcome,
            DeviceOutcome::Converged {
                reformatted: false,
                ..
            }
        ));
        assert_eq!(host.format_count(), 1);
        assert_eq!(data_records(&host).len(), 1);
    }

    #[test]
    fn failed_unmount_warns_then_partitioning_fails_loudly() {
        let host = vm_host(&["vdc"]);
        host.put_filesystem("/dev/vdc1", "ext4", "old-uuid");
        host.put_mount("/dev/vdc1", "/media/auto", "ext4");
        host.fail(FakeOp::Unmount, "/media/auto", "umount: target is busy");

        let summary = run(&host, config(ProvisionMode::ForceReformat));
        let report = &summary.reports[0];
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.warnings[0].step, LifecycleStep::Unmount);
        assert_eq!(report.warnings[1].step, LifecycleStep::WipeSignatures);
        match &report.outcome {
            DeviceOutcome::Failed { error } => assert_eq!(error.step, LifecycleStep::Partition),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn best_effort_failures_do_not_fail_the_device() {
        let host = vm_host(&["vdc"]);
        host.fail(FakeOp::Wipe, "/dev/vdc", "wipefs: probing failed");
        host.fail(FakeOp::Chown, "/mnt/disk1/data", "chown: invalid user");

        let summary = run(&host, config(ProvisionMode::Detect));
        let report = &summary.reports[0];
        assert!(report.outcome.is_converged());
        let steps: Vec<_> = report.warnings.iter().map(|w| w.step).collect();
        assert_eq!(
            steps,
            vec![LifecycleStep::WipeSignatures, LifecycleStep::AssignOwnership]
        );
        assert_eq!(summary.warning_count(), 2);
    }

    #[test]
    fn missing_service_account_keeps_default_owner() {
        let host = Arc::new(FakeHost::new());
        host.add_disk("vdc");

        let summary = run(&host, config(ProvisionMode::Detect));
        assert!(summary.all_converged());
        assert!(summary.reports[0].warnings.is_empty());
        assert_eq!(host.owner("/mnt/disk1/data"), None);
    }

    #[test]
    fn mount_failure_is_fatal() {
        let host = vm_host(&["vdc"]);
        host.fail(FakeOp::Mount, "/mnt/disk1", "mount: wrong fs type");

        let summary = run(&host, config(ProvisionMode::Detect));
        match &summary.reports[0].outcome {
            DeviceOutcome::Failed { error } => assert_eq!(error.step, LifecycleStep::Mount),
            other => panic!("expected mount failure, got {:?}", other),
        }
        assert!(!host.has_dir("/mnt/disk1/data"));
    }

    #[test]
    fn hung_device_times_out_without_blocking_the_rest() {
        let host = vm_host(&["vdc", "vdd"]);
        host.hang_format("/dev/vdc1", Duration::from_secs(3));
        let config = ProvisionConfig {
            device_timeout_secs: 1,
            ..config(ProvisionMode::Detect)
        };

        let summary = run(&host, config);
        assert_eq!(
            summary.reports[0].outcome,
            DeviceOutcome::TimedOut { after_secs: 1 }
        );
        assert!(summary.reports[1].outcome.is_converged());
        assert!(!summary.all_converged());
    }

    #[test]
    fn parallel_run_converges_every_device() {
        let host = vm_host(&["vdc", "vdd", "vde", "vdf"]);
        let config = ProvisionConfig {
            parallel: true,
            ..config(ProvisionMode::Detect)
        };

        let summary = run(&host, config);
        assert!(summary.all_converged());
        let devices: Vec<_> = summary.reports.iter().map(|r| r.device.as_str()).collect();
        assert_eq!(devices, vec!["/dev/vdc", "/dev/vdd", "/dev/vde", "/dev/vdf"]);
        assert_eq!(data_records(&host).len(), 4);
    }

    #[test]
    fn unprivileged_run_touches_nothing() {
        let host = vm_host(&["vdc"]);
        host.set_privileged(false);

        let result = BatchOrchestrator::new(host.clone(), config(ProvisionMode::ForceReformat)).run();
        assert!(matches!(result, Err(ProvisionError::Privilege { .. })));
        assert_eq!(host.format_count(), 0);
    }

    #[test]
    fn enumeration_failure_aborts_the_batch() {
        let host = vm_host(&["vdc"]);
        host.fail(FakeOp::Enumerate, "", "/sys/block unreadable");

        let result = BatchOrchestrator::new(host.clone(), config(ProvisionMode::Detect)).run();
        assert!(matches!(result, Err(ProvisionError::Enumeration { .. })));
    }

    #[test]
    fn zero_eligible_devices_follows_policy() {
        let host = vm_host(&[]);

        let summary = run(&host, config(ProvisionMode::Detect));
        assert!(summary.reports.is_empty());
        assert!(summary.all_converged());

        let strict = ProvisionConfig {
            allow_empty: false,
            ..config(ProvisionMode::Detect)
        };
        let result = BatchOrchestrator::new(host.clone(), strict).run();
        assert!(matches!(
            result,
            Err(ProvisionError::NoEligibleDevices { enumerated: 2 })
        ));
    }

    #[test]
    fn plan_reports_actions_without_side_effects() {
        let host = vm_host(&["vdc", "vdd"]);
        host.put_filesystem("/dev/vdd1", "ext4", "old-uuid");
        let before = host.table();

        let plan = BatchOrchestrator::new(host.clone(), config(ProvisionMode::Detect))
            .plan()
            .unwrap();
        assert_eq!(plan.inventory.entries.len(), 4);
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].action, PlannedAction::Provision);
        assert_eq!(plan.entries[1].state, Some(DeviceState::Formatted));
        assert!(matches!(plan.entries[1].action, PlannedAction::Refuse(_)));
        assert_eq!(host.table(), before);
        assert_eq!(host.format_count(), 0);
    }
}
