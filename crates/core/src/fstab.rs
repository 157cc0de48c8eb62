//! Persistent mount table (`/etc/fstab`) syntax.
//!
//! Lines that are not entries, and entries nobody edits, are written back
//! exactly as they were read.

use crate::is_device_or_partition;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MountSource {
    Uuid(String),
    Label(String),
    Device(PathBuf),
    Other(String),
}

impl MountSource {
    pub fn parse(value: &str) -> Self {
        if let Some(uuid) = value.strip_prefix("UUID=") {
            MountSource::Uuid(uuid.trim_matches('"').to_string())
        } else if let Some(label) = value.strip_prefix("LABEL=") {
            MountSource::Label(unescape_mount(label.trim_matches('"')))
        } else if value.starts_with("/dev/") {
            MountSource::Device(PathBuf::from(unescape_mount(value)))
        } else {
            MountSource::Other(value.to_string())
        }
    }
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSource::Uuid(uuid) => write!(f, "UUID={}", uuid),
            MountSource::Label(label) => write!(f, "LABEL={}", escape_mount(label)),
            MountSource::Device(path) => f.write_str(&escape_mount(&path.to_string_lossy())),
            MountSource::Other(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PersistentMountRecord {
    pub source: MountSource,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
    pub dump: u32,
    pub pass: u32,
}

impl PersistentMountRecord {
    /// Parses one table line; `None` for comments, blanks and short lines.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let mut fields = trimmed.split_whitespace();
        let source = MountSource::parse(fields.next()?);
        let mount_point = PathBuf::from(unescape_mount(fields.next()?));
        let fs_type = fields.next()?.to_string();
        let options = fields.next()?.to_string();
        let dump = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let pass = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        Some(Self {
            source,
            mount_point,
            fs_type,
            options,
            dump,
            pass,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.source,
            escape_mount(&self.mount_point.to_string_lossy()),
            self.fs_type,
            self.options,
            self.dump,
            self.pass
        )
    }

    /// Keyed by `device` or one of its partitions rather than a UUID.
    pub fn references_device(&self, device: &Path) -> bool {
        match &self.source {
            MountSource::Device(path) => is_device_or_partition(device, path),
            _ => false,
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        match &self.source {
            MountSource::Uuid(uuid) => Some(uuid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableLine {
    raw: String,
    record: Option<PersistentMountRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    lines: Vec<TableLine>,
}

impl MountTable {
    pub fn parse(contents: &str) -> Self {
        let lines = contents
            .lines()
            .map(|raw| TableLine {
                raw: raw.to_string(),
                record: PersistentMountRecord::parse(raw),
            })
            .collect();
        Self { lines }
    }

    pub fn records(&self) -> impl Iterator<Item = &PersistentMountRecord> {
        self.lines.iter().filter_map(|line| line.record.as_ref())
    }

    pub fn records_for_mount_point<'a>(
        &'a self,
        mount_point: &'a Path,
    ) -> impl Iterator<Item = &'a PersistentMountRecord> {
        self.records()
            .filter(move |record| record.mount_point.as_path() == mount_point)
    }

    /// Drops every entry matching `predicate` and returns what was removed.
    pub fn remove_matching(
        &mut self,
        predicate: impl Fn(&PersistentMountRecord) -> bool,
    ) -> Vec<PersistentMountRecord> {
        let mut removed = Vec::new();
        self.lines.retain(|line| match &line.record {
            Some(record) if predicate(record) => {
                removed.push(record.clone());
                false
            }
            _ => true,
        });
        removed
    }

    pub fn append(&mut self, record: PersistentMountRecord) {
        self.lines.push(TableLine {
            raw: record.render(),
            record: Some(record),
        });
    }

    pub fn render(&self) -> String {
        let mut output = String::new();
        for line in &self.lines {
            output.push_str(&line.raw);
            output.push('\n');
        }
        output
    }
}

/// Decodes the octal escapes (`\040`) the kernel and fstab use in paths.
pub fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if next.is_digit(8) {
                        octal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(byte as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&octal);
        } else {
            output.push(ch);
        }
    }
    output
}

pub fn escape_mount(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ' ' => output.push_str("\\040"),
            '\t' => output.push_str("\\011"),
            '\n' => output.push_str("\\012"),
            '\\' => output.push_str("\\134"),
            other => output.push(other),
        }
    }
    output
}
