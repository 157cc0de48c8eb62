//! Error taxonomy for provisioning runs.
//!
//! Batch-level errors abort before any device is touched. Device-level errors
//! only ever end up inside a [`crate::DeviceOutcome`].

use crate::LifecycleStep;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("elevated privilege required: {reason}")]
    Privilege { reason: String },

    #[error("no eligible data devices found ({enumerated} devices enumerated)")]
    NoEligibleDevices { enumerated: usize },

    #[error("device enumeration failed: {cause}")]
    Enumeration { cause: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("failed to read config {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A fatal step failed; processing of `device` stopped there.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{device}: {step} failed: {cause}")]
pub struct DeviceLifecycleError {
    pub device: String,
    pub step: LifecycleStep,
    pub cause: String,
}

impl DeviceLifecycleError {
    pub fn new(device: impl Into<String>, step: LifecycleStep, cause: &anyhow::Error) -> Self {
        Self {
            device: device.into(),
            step,
            cause: format!("{:#}", cause),
        }
    }
}

/// A best-effort step failed; the lifecycle carried on.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{device}: {step} (best effort) failed: {cause}")]
pub struct BestEffortWarning {
    pub device: String,
    pub step: LifecycleStep,
    pub cause: String,
}

impl BestEffortWarning {
    pub fn new(device: impl Into<String>, step: LifecycleStep, cause: &anyhow::Error) -> Self {
        Self {
            device: device.into(),
            step,
            cause: format!("{:#}", cause),
        }
    }
}
