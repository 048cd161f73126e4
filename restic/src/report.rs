//! Summary of every status record in the status directory.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::SystemTime;

use metrics::{Sample, StatusWriter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Ok,
    Warning,
    Failed,
    Stale,
    Running,
    Unknown,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Ok => "OK",
            Health::Warning => "WARNING",
            Health::Failed => "FAILED",
            Health::Stale => "STALE",
            Health::Running => "RUNNING",
            Health::Unknown => "UNKNOWN",
        }
    }

    fn needs_attention(&self) -> bool {
        matches!(self, Health::Failed | Health::Stale | Health::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Backup,
    Check,
    RestoreTest,
    Snapshot,
    Preseed,
}

impl EntryKind {
    const PREFIXES: [(&'static str, EntryKind); 5] = [
        ("restic_backup_", EntryKind::Backup),
        ("restic_check_", EntryKind::Check),
        ("restic_restore_test_", EntryKind::RestoreTest),
        ("snapshot_", EntryKind::Snapshot),
        ("preseed_", EntryKind::Preseed),
    ];

    fn from_record_name(name: &str) -> Option<(EntryKind, &str)> {
        Self::PREFIXES
            .iter()
            .find_map(|(prefix, kind)| name.strip_prefix(prefix).map(|rest| (*kind, rest)))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Backup => "backup",
            EntryKind::Check => "check",
            EntryKind::RestoreTest => "restore-test",
            EntryKind::Snapshot => "snapshot",
            EntryKind::Preseed => "preseed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub kind: EntryKind,
    pub name: String,
    pub health: Health,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub detail: String,
}

/// Status records grouped by repository. Records without a repository
/// (snapshot sessions, preseeds) are grouped under `-`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub stale_after_hours: u64,
    pub repositories: BTreeMap<String, Vec<ReportEntry>>,
}

struct Record<'a> {
    samples: &'a [Sample],
}

impl Record<'_> {
    fn value(&self, metric: &str) -> Option<f64> {
        self.samples.iter().find(|s| s.name == metric).map(|s| s.value)
    }

    fn label(&self, name: &str) -> Option<&str> {
        self.samples.first().and_then(|s| s.labels.get(name))
    }

    fn timestamp(&self, metric: &str) -> Option<DateTime<Utc>> {
        self.value(metric)
            .filter(|v| *v > 0.0)
            .and_then(|v| Utc.timestamp_opt(v as i64, 0).single())
    }
}

fn humanize(seconds: i64) -> String {
    if seconds < 0 {
        return "in the future".to_string();
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{minutes}m"));
    }
    format!("{} ago", parts.join(" "))
}

impl StatusReport {
    pub fn build(status: &StatusWriter, stale_after_hours: u64) -> Result<Self> {
        Self::build_at(status, stale_after_hours, Utc::now())
    }

    pub fn build_at(status: &StatusWriter, stale_after_hours: u64, now: DateTime<Utc>) -> Result<Self> {
        let mut repositories: BTreeMap<String, Vec<ReportEntry>> = BTreeMap::new();
        for file in status.list()? {
            let Some((kind, name)) = EntryKind::from_record_name(&file.name) else {
                continue;
            };
            let samples = match status.read(&file.name) {
                Ok(Some(samples)) => samples,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Skipping unreadable status record {}: {e}", file.name);
                    Vec::new()
                }
            };
            let record = Record { samples: &samples };
            let repository = record.label("repository").unwrap_or("-").to_string();
            let mut entry = classify(kind, name, &record, now, stale_after_hours);
            if entry.last_run.is_none() {
                entry.last_run = modified(file.modified);
            }
            repositories.entry(repository).or_default().push(entry);
        }
        for entries in repositories.values_mut() {
            entries.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
        }
        Ok(Self {
            generated_at: now,
            stale_after_hours,
            repositories,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &ReportEntry)> {
        self.repositories
            .iter()
            .flat_map(|(repo, entries)| entries.iter().map(move |e| (repo.as_str(), e)))
    }

    /// No entry is failed, stale or unreadable
    pub fn is_healthy(&self) -> bool {
        self.entries().all(|(_, e)| !e.health.needs_attention())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_text(&self) -> String {
        let rows: Vec<[String; 6]> = self
            .entries()
            .map(|(repo, e)| {
                [
                    repo.to_string(),
                    e.kind.as_str().to_string(),
                    e.name.clone(),
                    e.health.as_str().to_string(),
                    e.last_success
                        .map(|t| humanize((self.generated_at - t).num_seconds()))
                        .unwrap_or_else(|| "never".to_string()),
                    e.detail.clone(),
                ]
            })
            .collect();
        let header = ["REPOSITORY", "KIND", "NAME", "STATUS", "LAST SUCCESS", "DETAIL"];

        let mut widths = header.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let mut out = String::new();
        let mut line = |cells: &[&str]| {
            let mut text = String::new();
            for (i, cell) in cells.iter().enumerate() {
                if i + 1 == cells.len() {
                    text.push_str(cell);
                } else {
                    let _ = write!(text, "{cell:<width$}  ", width = widths[i]);
                }
            }
            let _ = writeln!(out, "{}", text.trim_end());
        };
        line(&header);
        for row in &rows {
            line(&row.each_ref().map(String::as_str));
        }
        if rows.is_empty() {
            out.push_str("No status records found\n");
        }
        out
    }
}

fn modified(time: SystemTime) -> Option<DateTime<Utc>> {
    Some(DateTime::<Utc>::from(time))
}

fn classify(kind: EntryKind, name: &str, record: &Record<'_>, now: DateTime<Utc>, stale_after_hours: u64) -> ReportEntry {
    let mut entry = ReportEntry {
        kind,
        name: name.to_string(),
        health: Health::Unknown,
        last_run: None,
        last_success: None,
        detail: String::new(),
    };

    match kind {
        EntryKind::Backup => {
            entry.last_run = record.timestamp("restic_backup_last_run_timestamp");
            entry.last_success = record.timestamp("restic_backup_last_success_timestamp");
            let stale_after = chrono::Duration::hours(stale_after_hours as i64);
            let warnings = record.value("restic_backup_warnings").unwrap_or(0.0);
            (entry.health, entry.detail) = match record.value("restic_backup_status") {
                None => (Health::Unknown, "Unreadable record".to_string()),
                Some(status) if status == 0.0 => (Health::Failed, "Last run failed".to_string()),
                Some(_) => match entry.last_success {
                    Some(t) if now - t > stale_after => (
                        Health::Stale,
                        format!("Last success > {stale_after_hours}h ago"),
                    ),
                    None => (Health::Stale, "Never succeeded".to_string()),
                    Some(_) if warnings > 0.0 => (
                        Health::Warning,
                        format!("{warnings:.0} unreadable files"),
                    ),
                    Some(_) => (Health::Ok, "Success".to_string()),
                },
            };
        }
        EntryKind::Check | EntryKind::RestoreTest => {
            let prefix = match kind {
                EntryKind::Check => "restic_check",
                _ => "restic_restore_test",
            };
            entry.last_run = record.timestamp(&format!("{prefix}_last_run_timestamp"));
            entry.last_success = record.timestamp(&format!("{prefix}_last_success_timestamp"));
            (entry.health, entry.detail) = match record.value(&format!("{prefix}_status")) {
                None => (Health::Unknown, "Unreadable record".to_string()),
                Some(status) if status == 0.0 => (Health::Failed, "Last run failed".to_string()),
                Some(_) if kind == EntryKind::Check => (
                    Health::Ok,
                    format!(
                        "{:.0} snapshots, {:.0} in 24h",
                        record.value("restic_check_snapshots_total").unwrap_or(0.0),
                        record.value("restic_check_snapshots_recent").unwrap_or(0.0)
                    ),
                ),
                Some(_) => (
                    Health::Ok,
                    format!(
                        "{:.0}/{:.0} files restored",
                        record.value("restic_restore_test_files_restored").unwrap_or(0.0),
                        record.value("restic_restore_test_files_sampled").unwrap_or(0.0)
                    ),
                ),
            };
        }
        EntryKind::Snapshot => {
            entry.last_run = record.timestamp("custodian_snapshot_created_timestamp_seconds");
            (entry.health, entry.detail) = match record.value("custodian_snapshot_active") {
                Some(active) if active > 0.0 => (
                    Health::Running,
                    format!("Session on {}", record.label("dataset").unwrap_or("?")),
                ),
                Some(_) => (Health::Ok, "Released".to_string()),
                None => (Health::Unknown, "Unreadable record".to_string()),
            };
        }
        EntryKind::Preseed => {
            entry.last_run = record.timestamp("custodian_preseed_last_run_timestamp");
            (entry.health, entry.detail) = match record.value("custodian_preseed_status") {
                Some(status) if status > 0.0 => {
                    entry.last_success = entry.last_run;
                    (
                        Health::Ok,
                        format!("Seeded by {}", record.label("method").unwrap_or("?")),
                    )
                }
                Some(_) => (Health::Failed, "Every restore method failed".to_string()),
                None => (Health::Unknown, "Unreadable record".to_string()),
            };
        }
    }
    entry
}
