use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::textfile::{parse, Sample, StatusRecord};
use crate::MetricsError;

const EXTENSION: &str = "prom";

/// Record prefixes whose files belong to a single backup job
const JOB_PREFIXES: [&str; 2] = ["restic_backup_", "snapshot_"];

/// A status file found on disk
#[derive(Debug, Clone)]
pub struct StatusFile {
    pub name: String,
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Writes, reads and garbage-collects status records in one directory
#[derive(Debug, Clone)]
pub struct StatusWriter {
    dir: PathBuf,
}

impl StatusWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, MetricsError> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{EXTENSION}")))
    }

    /// Atomically replaces the record `name`
    pub fn write(&self, name: &str, record: &StatusRecord) -> Result<PathBuf, MetricsError> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(record.render().as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        // Collectors usually run unprivileged
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))?;
        tmp.persist(&path)?;

        debug!("Wrote status record {}", path.display());
        Ok(path)
    }

    /// Reads the record `name`; `None` when it does not exist
    pub fn read(&self, name: &str) -> Result<Option<Vec<Sample>>, MetricsError> {
        let path = self.path_for(name)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(parse(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Value of `metric` in the record `name`, if present and readable
    pub fn read_value(&self, name: &str, metric: &str) -> Option<f64> {
        match self.read(name) {
            Ok(Some(samples)) => samples.iter().find(|s| s.name == metric).map(|s| s.value),
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable status record {name}: {e}");
                None
            }
        }
    }

    /// Removes the record `name`; a missing file is not an error
    pub fn remove(&self, name: &str) -> Result<bool, MetricsError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed status record {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All status files in the directory, sorted by name
    pub fn list(&self) -> Result<Vec<StatusFile>, MetricsError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            files.push(StatusFile {
                name: name.to_string(),
                path: path.clone(),
                modified,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Deletes job-scoped records for jobs that are no longer registered
    pub fn reconcile<'a>(
        &self,
        known_jobs: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>, MetricsError> {
        let known: HashSet<&str> = known_jobs.into_iter().collect();
        let mut removed = Vec::new();

        for file in self.list()? {
            let job = JOB_PREFIXES
                .iter()
                .find_map(|prefix| file.name.strip_prefix(prefix));
            let Some(job) = job else { continue };
            if known.contains(job) {
                continue;
            }
            info!("Removing status record {} of unregistered job {job}", file.name);
            if self.remove(&file.name)? {
                removed.push(file.name);
            }
        }
        Ok(removed)
    }

    /// Deletes records not rewritten within `max_age`
    pub fn sweep(&self, max_age: Duration) -> Result<Vec<String>, MetricsError> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for file in self.list()? {
            let age = now.duration_since(file.modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }
            info!(
                "Removing stale status record {} ({} hours old)",
                file.name,
                age.as_secs() / 3600
            );
            if self.remove(&file.name)? {
                removed.push(file.name);
            }
        }
        Ok(removed)
    }
}

fn validate_name(name: &str) -> Result<(), MetricsError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(MetricsError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::textfile::Labels;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn record(job: &str, status: f64) -> StatusRecord {
        let labels = Labels::new().with("backup_job", job);
        let mut record = StatusRecord::new();
        record
            .gauge("restic_backup_status", "Backup outcome", &labels, status)
            .gauge("restic_backup_duration_seconds", "Duration", &labels, 42.0);
        record
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new(dir.path());

        let path = writer
            .write("restic_backup_service-sonarr", &record("service-sonarr", 1.0))
            .unwrap();
        assert!(path.ends_with("restic_backup_service-sonarr.prom"));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);

        let samples = writer.read("restic_backup_service-sonarr").unwrap().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(
            writer.read_value("restic_backup_service-sonarr", "restic_backup_status"),
            Some(1.0)
        );
        assert!(writer.read("missing").unwrap().is_none());

        // No temporary files are left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new(dir.path());
        writer.write("snapshot_job", &record("job", 1.0)).unwrap();
        assert!(writer.remove("snapshot_job").unwrap());
        assert!(!writer.remove("snapshot_job").unwrap());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let writer = StatusWriter::new("/tmp");
        assert!(writer.path_for("../etc/passwd").is_err());
        assert!(writer.path_for(".hidden").is_err());
        assert!(writer.path_for("").is_err());
        assert!(writer.path_for("restic_check_nas-primary").is_ok());
    }

    #[test]
    fn test_reconcile_removes_unregistered_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new(dir.path());
        writer.write("restic_backup_keep", &record("keep", 1.0)).unwrap();
        writer.write("restic_backup_gone", &record("gone", 1.0)).unwrap();
        writer.write("snapshot_gone", &record("gone", 1.0)).unwrap();
        writer.write("restic_check_nas", &record("nas", 1.0)).unwrap();

        let mut removed = writer.reconcile(["keep"]).unwrap();
        removed.sort();
        assert_eq!(removed, vec!["restic_backup_gone", "snapshot_gone"]);

        let names: Vec<String> = writer.list().unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["restic_backup_keep", "restic_check_nas"]);
    }

    #[test]
    fn test_sweep_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new(dir.path());
        let path = writer.write("restic_backup_old", &record("old", 1.0)).unwrap();
        writer.write("restic_backup_new", &record("new", 1.0)).unwrap();

        let old = SystemTime::now() - Duration::from_secs(40 * 24 * 3600);
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(old).unwrap();

        let removed = writer.sweep(Duration::from_secs(30 * 24 * 3600)).unwrap();
        assert_eq!(removed, vec!["restic_backup_old"]);
        assert!(writer.read("restic_backup_new").unwrap().is_some());
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let writer = StatusWriter::new("/nonexistent/custodian-status");
        assert!(writer.list().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_records() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StatusWriter::new(dir.path());
        let name = "restic_backup_stress";

        // Large label values make a torn write easy to spot
        let long_job = "x".repeat(64 * 1024);
        let a = record("a", 1.0);
        let b = record(&long_job, 0.0);
        let expected_a = a.render();
        let expected_b = b.render();
        writer.write(name, &a).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let path = writer.path_for(name).unwrap();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let done = done.clone();
                let path = path.clone();
                let (ea, eb) = (expected_a.clone(), expected_b.clone());
                thread::spawn(move || {
                    let mut reads = 0;
                    loop {
                        let text = fs::read_to_string(&path).unwrap();
                        assert!(text == ea || text == eb, "observed a partial record");
                        reads += 1;
                        if done.load(Ordering::SeqCst) {
                            break reads;
                        }
                    }
                })
            })
            .collect();

        for i in 0..200 {
            let next = if i % 2 == 0 { &b } else { &a };
            writer.write(name, next).unwrap();
        }
        done.store(true, Ordering::SeqCst);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }
}
