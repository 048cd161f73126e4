//! Snapshot sessions: a snapshot of a live dataset, cloned and mounted
//! writable-but-unused under `<mount_base>/<job>` for the duration of one
//! backup job.
//!
//! All resource names derive from the job name, so a session left behind by a
//! crashed run can be found and released without any other state.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{is_valid_job_name, CustodianConfig};
use metrics::{Labels, StatusRecord, StatusWriter};

use crate::wrapper::{Zfs, ZfsOps};
use crate::{Result, ZfsError};

/// Prefix of snapshot and clone names owned by custodian
pub const SESSION_PREFIX: &str = "custodian-";

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSession {
    pub job: String,
    pub dataset: String,
    pub snapshot: String,
    pub clone: String,
    /// Where the clone is mounted
    pub mountpoint: PathBuf,
    /// Where the live dataset is mounted, if it is
    pub source_mountpoint: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotSession {
    fn named(dataset: &str, job: &str, mount_base: &Path) -> Self {
        Self {
            job: job.to_string(),
            dataset: dataset.to_string(),
            snapshot: format!("{dataset}@{SESSION_PREFIX}{job}"),
            clone: clone_name(dataset, job),
            mountpoint: mount_base.join(job),
            source_mountpoint: None,
            created_at: Utc::now(),
        }
    }

    /// Maps a live path under the dataset's mountpoint onto the clone.
    /// `None` when the path lies outside the dataset.
    pub fn remap(&self, path: &Path) -> Option<PathBuf> {
        let source = self.source_mountpoint.as_ref()?;
        let rest = path.strip_prefix(source).ok()?;
        if rest.as_os_str().is_empty() {
            Some(self.mountpoint.clone())
        } else {
            Some(self.mountpoint.join(rest))
        }
    }
}

fn clone_name(dataset: &str, job: &str) -> String {
    format!("{dataset}-{SESSION_PREFIX}{job}")
}

fn validate_job(job: &str) -> Result<()> {
    if is_valid_job_name(job) {
        Ok(())
    } else {
        Err(ZfsError::InvalidJobName(job.to_string()))
    }
}

fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // exists, owned by someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn tolerate_missing<T: Default>(what: &str, result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_missing() => {
            debug!("{what}: already gone");
            Ok(T::default())
        }
        other => other,
    }
}

/// Creates, tracks and tears down snapshot sessions
#[derive(Clone)]
pub struct SnapshotManager {
    zfs: Arc<dyn ZfsOps>,
    mount_base: PathBuf,
    run_dir: PathBuf,
    status: StatusWriter,
}

impl SnapshotManager {
    pub fn new(
        zfs: Arc<dyn ZfsOps>,
        mount_base: impl Into<PathBuf>,
        run_dir: impl Into<PathBuf>,
        status: StatusWriter,
    ) -> Self {
        Self {
            zfs,
            mount_base: mount_base.into(),
            run_dir: run_dir.into(),
            status,
        }
    }

    pub fn from_config(config: &CustodianConfig) -> Self {
        Self::new(
            Arc::new(Zfs::new(config.binaries.zfs.clone())),
            config.mount_base.clone(),
            config.run_dir.clone(),
            StatusWriter::new(config.status_dir.clone()),
        )
    }

    pub fn zfs(&self) -> &Arc<dyn ZfsOps> {
        &self.zfs
    }

    pub fn lease_path(&self, job: &str) -> PathBuf {
        self.run_dir.join("snapshots").join(format!("{job}.pid"))
    }

    fn status_name(job: &str) -> String {
        format!("snapshot_{job}")
    }

    /// Acquires a session owned by this process
    pub fn acquire(&self, dataset: &str, job: &str) -> Result<Option<SnapshotLease>> {
        self.acquire_for(dataset, job, std::process::id() as i32)
    }

    /// Acquires a session whose lease names `owner` as the holding process.
    ///
    /// Returns `Ok(None)` when the dataset does not exist. On failure,
    /// everything created so far is torn down before the error is returned.
    pub fn acquire_for(&self, dataset: &str, job: &str, owner: i32) -> Result<Option<SnapshotLease>> {
        validate_job(job)?;
        let dataset = dataset.trim_matches('/');

        if !self.zfs.dataset_exists(dataset)? {
            info!("Dataset {dataset} does not exist, skipping snapshot for job {job}");
            return Ok(None);
        }

        if let Some(pid) = self.lease_owner(job) {
            if pid != owner && pid_alive(pid) {
                return Err(ZfsError::SessionInUse {
                    job: job.to_string(),
                    pid,
                });
            }
        }
        if self.has_residue(job)? {
            warn!("Releasing leftover snapshot session of job {job}");
            self.release(job)?;
        }

        let mut session = SnapshotSession::named(dataset, job, &self.mount_base);
        match self.create(&mut session, owner) {
            Ok(()) => {
                info!(
                    "Snapshot session for job {job} ready: {} mounted at {}",
                    session.clone,
                    session.mountpoint.display()
                );
                Ok(Some(SnapshotLease::new(self.clone(), session)))
            }
            Err(e) => {
                error!("Failed to set up snapshot session for job {job}: {e}");
                if let Err(cleanup) = self.release(job) {
                    warn!("Cleanup of partial snapshot session for job {job} failed: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn create(&self, session: &mut SnapshotSession, owner: i32) -> Result<()> {
        session.source_mountpoint = self.zfs.mountpoint(&session.dataset)?;

        self.zfs.snapshot(&session.snapshot)?;
        session.created_at = Utc::now();

        let mountpoint = session.mountpoint.to_string_lossy().into_owned();
        self.zfs.clone_snapshot(
            &session.snapshot,
            &session.clone,
            &[("canmount", "noauto".to_string()), ("mountpoint", mountpoint)],
        )?;
        if !self.zfs.is_mounted(&session.clone)? {
            self.zfs.mount(&session.clone)?;
        }

        let lease = self.lease_path(&session.job);
        if let Some(parent) = lease.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&lease, format!("{owner}\n{}\n", session.dataset))?;

        let labels = Labels::new()
            .with("backup_job", session.job.as_str())
            .with("dataset", session.dataset.as_str())
            .with("snapshot", session.snapshot.as_str());
        let mut record = StatusRecord::new();
        record
            .gauge(
                "custodian_snapshot_created_timestamp_seconds",
                "Creation time of the snapshot session",
                &labels,
                session.created_at.timestamp() as f64,
            )
            .gauge(
                "custodian_snapshot_active",
                "Whether a snapshot session is currently held",
                &labels,
                1.0,
            );
        self.status.write(&Self::status_name(&session.job), &record)?;
        Ok(())
    }

    fn session_snapshots(&self, job: &str) -> Result<Vec<String>> {
        let suffix = format!("@{SESSION_PREFIX}{job}");
        Ok(self
            .zfs
            .list_snapshots(None)?
            .into_iter()
            .filter(|s| s.ends_with(&suffix))
            .collect())
    }

    fn has_residue(&self, job: &str) -> Result<bool> {
        Ok(self.lease_path(job).exists()
            || self.mount_base.join(job).exists()
            || !self.session_snapshots(job)?.is_empty())
    }

    /// Pid recorded in the lease file of `job`
    pub fn lease_owner(&self, job: &str) -> Option<i32> {
        fs::read_to_string(self.lease_path(job))
            .ok()?
            .lines()
            .next()?
            .trim()
            .parse()
            .ok()
    }

    /// Tears down every resource of the session of `job`. Resources that are
    /// already gone are skipped, so releasing twice is harmless.
    pub fn release(&self, job: &str) -> Result<()> {
        validate_job(job)?;
        let suffix = format!("@{SESSION_PREFIX}{job}");

        for snapshot in self.session_snapshots(job)? {
            let dataset = &snapshot[..snapshot.len() - suffix.len()];
            let mut clones = tolerate_missing(&snapshot, self.zfs.clones_of(&snapshot))?;
            let named = clone_name(dataset, job);
            if !clones.contains(&named) && self.zfs.dataset_exists(&named)? {
                clones.push(named);
            }
            for clone in clones {
                self.destroy_clone(&clone)?;
            }
            tolerate_missing(&snapshot, self.zfs.destroy(&snapshot))?;
            debug!("Destroyed snapshot {snapshot}");
        }

        let mountpoint = self.mount_base.join(job);
        match fs::remove_dir(&mountpoint) {
            Ok(()) => debug!("Removed {}", mountpoint.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {e}", mountpoint.display()),
        }

        match fs::remove_file(self.lease_path(job)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.status.remove(&Self::status_name(job))?;
        Ok(())
    }

    fn destroy_clone(&self, clone: &str) -> Result<()> {
        if tolerate_missing(clone, self.zfs.is_mounted(clone))? {
            tolerate_missing(clone, self.zfs.unmount(clone))?;
        }
        tolerate_missing(clone, self.zfs.destroy(clone))?;
        debug!("Destroyed clone {clone}");
        Ok(())
    }

    /// Releases sessions whose owning process no longer exists
    pub fn gc(&self) -> Result<Vec<String>> {
        let dir = self.run_dir.join("snapshots");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            if let Some(job) = path.file_stem().and_then(|s| s.to_str()) {
                jobs.push(job.to_string());
            }
        }
        jobs.sort();

        let mut released = Vec::new();
        for job in jobs {
            match self.lease_owner(&job) {
                Some(pid) if pid_alive(pid) => {
                    debug!("Snapshot session of job {job} is held by live process {pid}");
                }
                owner => {
                    info!(
                        "Releasing orphaned snapshot session of job {job} (owner {})",
                        owner.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                    );
                    self.release(&job)?;
                    released.push(job);
                }
            }
        }
        Ok(released)
    }
}

/// Shared handle on an acquired session.
///
/// Clones share one count; the session is released when the last clone is
/// dropped, whether the job returned, failed, panicked or was cancelled.
#[derive(Clone)]
pub struct SnapshotLease {
    inner: Arc<LeaseInner>,
}

struct LeaseInner {
    manager: SnapshotManager,
    session: SnapshotSession,
    detached: AtomicBool,
}

impl SnapshotLease {
    fn new(manager: SnapshotManager, session: SnapshotSession) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                manager,
                session,
                detached: AtomicBool::new(false),
            }),
        }
    }

    pub fn session(&self) -> &SnapshotSession {
        &self.inner.session
    }

    /// Number of live handles on this session
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Keeps the session after the last handle is gone. Used when another
    /// process releases it with `snapshot release`.
    pub fn detach(self) -> SnapshotSession {
        self.inner.detached.store(true, Ordering::SeqCst);
        self.inner.session.clone()
    }
}

impl fmt::Debug for SnapshotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotLease")
            .field("session", &self.inner.session)
            .field("holders", &self.holders())
            .finish()
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let job = &self.session.job;
        info!("Releasing snapshot session of job {job}");
        if let Err(e) = self.manager.release(job) {
            error!("Failed to release snapshot session of job {job}: {e}");
        }
    }
}
