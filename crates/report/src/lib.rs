use anyhow::{Context, Result};
use mountwright_core::{
    now_utc_rfc3339, BatchSummary, DeviceReport, ProvisionConfig, ProvisionMode,
    RUN_SCHEMA_VERSION,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub inventory_json: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: &'a str,
    schema_version: &'a str,
    created_at_utc: String,
    started_at_utc: &'a str,
    finished_at_utc: &'a str,
    duration_secs: Option<f64>,
    mode: ProvisionMode,
    config: &'a ProvisionConfig,
    converged: usize,
    failed: usize,
    warnings: usize,
    devices: &'a [DeviceReport],
}

/// Writes `<base>/reports/<run-id>/` with the inventory, the run outcome and
/// the captured step log.
pub fn create_report_bundle(
    base: impl AsRef<Path>,
    summary: &BatchSummary,
    config: &ProvisionConfig,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let root = base.as_ref().join("reports").join(&run_id);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create report directory {}", root.display()))?;

    let inventory_json = root.join("inventory.json");
    let run_json = root.join("run.json");
    let logs_path = root.join("logs.txt");

    let inventory = serde_json::to_string_pretty(&summary.inventory)?;
    std::fs::write(&inventory_json, inventory)
        .with_context(|| format!("write {}", inventory_json.display()))?;

    let run_meta = RunMetadata {
        run_id: &run_id,
        schema_version: RUN_SCHEMA_VERSION,
        created_at_utc: now_utc_rfc3339(),
        started_at_utc: &summary.started_at_utc,
        finished_at_utc: &summary.finished_at_utc,
        duration_secs: duration_secs(&summary.started_at_utc, &summary.finished_at_utc),
        mode: summary.mode,
        config,
        converged: summary.reports.len() - summary.failed_count(),
        failed: summary.failed_count(),
        warnings: summary.warning_count(),
        devices: &summary.reports,
    };
    let run_json_data = serde_json::to_string_pretty(&run_meta)?;
    std::fs::write(&run_json, run_json_data)
        .with_context(|| format!("write {}", run_json.display()))?;

    std::fs::write(&logs_path, render_logs(summary))
        .with_context(|| format!("write {}", logs_path.display()))?;

    Ok(ReportPaths {
        run_id,
        root,
        inventory_json,
        run_json,
        logs_path,
    })
}

/// One line per recorded step event, prefixed with the device.
pub fn render_logs(summary: &BatchSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "run mode={} started={} finished={}",
        summary.mode.as_str(),
        summary.started_at_utc,
        summary.finished_at_utc
    );
    for report in &summary.reports {
        for line in &report.log {
            let _ = writeln!(out, "[{}] {}", report.device, line);
        }
        for warning in &report.warnings {
            let _ = writeln!(
                out,
                "[{}] warning {}: {}",
                report.device, warning.step, warning.cause
            );
        }
        let _ = writeln!(out, "[{}] outcome {}", report.device, report.outcome.label());
    }
    out
}

/// The per-device result table printed after every run.
pub fn render_outcome_table(summary: &BatchSummary) -> String {
    if summary.reports.is_empty() {
        return "no eligible devices; nothing to provision\n".to_string();
    }

    let header = ["DEVICE", "MOUNT POINT", "STATE BEFORE", "OUTCOME"];
    let rows: Vec<[String; 4]> = summary
        .reports
        .iter()
        .map(|report| {
            let mut outcome = report.outcome.label();
            if !report.warnings.is_empty() {
                let _ = write!(outcome, " [{} warning(s)]", report.warnings.len());
            }
            [
                report.device.clone(),
                report.mount_point.display().to_string(),
                report
                    .initial_state
                    .map(|state| state.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                outcome,
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, header.iter().copied());
    for row in &rows {
        push_row(&mut out, &widths, row.iter().map(String::as_str));
    }
    let failed = summary.failed_count();
    let _ = writeln!(
        out,
        "{} device(s): {} converged, {} failed, {} warning(s)",
        rows.len(),
        rows.len() - failed,
        failed,
        summary.warning_count()
    );
    out
}

fn push_row<'a>(out: &mut String, widths: &[usize; 4], cells: impl Iterator<Item = &'a str>) {
    let line: Vec<String> = cells
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect();
    let _ = writeln!(out, "{}", line.join("  ").trim_end());
}

fn duration_secs(started: &str, finished: &str) -> Option<f64> {
    let started = OffsetDateTime::parse(started, &Rfc3339).ok()?;
    let finished = OffsetDateTime::parse(finished, &Rfc3339).ok()?;
    Some((finished - started).as_seconds_f64())
}
