use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::ResticError;

/// Exclusive advisory lock on `<run_dir>/jobs/<job>.lock`, held until dropped
pub struct JobLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl JobLock {
    pub fn acquire(run_dir: &Path, job: &str) -> Result<Self, ResticError> {
        let dir = run_dir.join("jobs");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{job}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("Locked {}", path.display());
                Ok(Self { _lock: lock, path })
            }
            Err((_, Errno::EAGAIN)) => Err(ResticError::AlreadyRunning(job.to_string())),
            Err((_, errno)) => Err(std::io::Error::from(errno).into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_instance_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = JobLock::acquire(dir.path(), "service-sonarr").unwrap();
        assert!(first.path().ends_with("jobs/service-sonarr.lock"));

        let second = JobLock::acquire(dir.path(), "service-sonarr");
        assert!(matches!(second, Err(ResticError::AlreadyRunning(job)) if job == "service-sonarr"));

        // Other jobs are independent
        let _other = JobLock::acquire(dir.path(), "service-radarr").unwrap();

        drop(first);
        JobLock::acquire(dir.path(), "service-sonarr").unwrap();
    }
}
