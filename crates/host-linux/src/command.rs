use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// blkid exit status when the requested tag or device was not found.
const BLKID_NOT_FOUND: i32 = 2;
/// blkid exit status when several signatures compete for the same device.
const BLKID_AMBIVALENT: i32 = 8;

pub(crate) fn run_cmd(program: &str, args: &[&str]) -> Result<String> {
    debug!(program, args = %args.join(" "), "running command");
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to spawn {}", program))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{} {} failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Low-level superblock probe of one tag (`TYPE`, `UUID`, `LABEL`), bypassing
/// the blkid cache so the answer reflects what is on disk right now.
///
/// blkid reports "cannot open" with the same status as "no signature", so the
/// device is opened first: an unreadable device is an error, never raw.
pub(crate) fn probe_tag(path: &Path, tag: &str) -> Result<Option<String>> {
    File::open(path).with_context(|| format!("open {} for probing", path.display()))?;
    let target = path.to_string_lossy();
    let output = Command::new("blkid")
        .args(["-p", "-s", tag, "-o", "value", target.as_ref()])
        .output()
        .context("failed to spawn blkid")?;
    match output.status.code() {
        Some(0) => {
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok(if value.is_empty() { None } else { Some(value) })
        }
        Some(BLKID_NOT_FOUND) => Ok(None),
        // Competing signatures still mean "something is on this disk".
        Some(BLKID_AMBIVALENT) if tag == "TYPE" => Ok(Some("ambivalent".to_string())),
        Some(BLKID_AMBIVALENT) => Ok(None),
        _ => bail!(
            "blkid probe of {} on {} failed ({}): {}",
            tag,
            target,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}
