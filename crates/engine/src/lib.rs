//! Disk provisioning engine.
//!
//! Classifies enumerated block devices, assigns mount slots in enumeration
//! order and drives each eligible device to the converged state: one GPT
//! partition, formatted, mounted through a UUID-keyed persistent mount table
//! record, with a data directory owned by the service account.
//!
//! **Provisioning is destructive.** In `force-reformat` mode every eligible
//! device is wiped and reformatted on every run, whatever it held before.

pub mod classify;
pub mod lifecycle;
pub mod mount_table;
pub mod orchestrator;
pub mod state;

#[cfg(test)]
mod fake;

pub use classify::{assign_slots, classify_inventory, eligible_devices, exclusion_reason};
pub use lifecycle::{DeviceRun, LifecycleExecutor};
pub use mount_table::MountTableEditor;
pub use orchestrator::{BatchOrchestrator, BatchPlan, PlanEntry, PlannedAction};
pub use state::{inspect_device, Inspection};
