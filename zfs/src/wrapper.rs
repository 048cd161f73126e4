use log::debug;
use std::path::PathBuf;
use std::process::Command;

use crate::{Result, ZfsError};

/// The ZFS operations custodian relies on
pub trait ZfsOps: Send + Sync {
    fn dataset_exists(&self, name: &str) -> Result<bool>;

    fn snapshot(&self, snapshot: &str) -> Result<()>;

    /// `zfs clone -o key=value ... <snapshot> <clone>`
    fn clone_snapshot(&self, snapshot: &str, clone: &str, properties: &[(&str, String)]) -> Result<()>;

    fn is_mounted(&self, dataset: &str) -> Result<bool>;

    fn mount(&self, dataset: &str) -> Result<()>;

    fn unmount(&self, dataset: &str) -> Result<()>;

    fn destroy(&self, name: &str) -> Result<()>;

    /// Snapshot names, oldest first. All snapshots on the system when `dataset` is `None`.
    fn list_snapshots(&self, dataset: Option<&str>) -> Result<Vec<String>>;

    /// Datasets cloned from `snapshot`
    fn clones_of(&self, snapshot: &str) -> Result<Vec<String>>;

    /// Mountpoint of a mountable dataset, `None` for `legacy`/`none`
    fn mountpoint(&self, dataset: &str) -> Result<Option<PathBuf>>;

    /// `zfs rollback -r`, discarding later snapshots
    fn rollback(&self, snapshot: &str) -> Result<()>;
}

/// Runs the `zfs` binary
#[derive(Debug, Clone)]
pub struct Zfs {
    binary: String,
}

impl Default for Zfs {
    fn default() -> Self {
        Self::new("zfs")
    }
}

impl Zfs {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        debug!("Running zfs command: {cmd:?}");

        let output = cmd.output().map_err(|source| ZfsError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ZfsError::Command {
                args: args.join(" "),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn lines(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .run(args)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

impl ZfsOps for Zfs {
    fn dataset_exists(&self, name: &str) -> Result<bool> {
        match self.run(&["list", "-H", "-o", "name", name]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        self.run(&["snapshot", snapshot]).map(|_| ())
    }

    fn clone_snapshot(&self, snapshot: &str, clone: &str, properties: &[(&str, String)]) -> Result<()> {
        let props: Vec<String> = properties
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let mut args = vec!["clone"];
        for prop in &props {
            args.push("-o");
            args.push(prop.as_str());
        }
        args.push(snapshot);
        args.push(clone);
        self.run(&args).map(|_| ())
    }

    fn is_mounted(&self, dataset: &str) -> Result<bool> {
        let value = self.run(&["get", "-H", "-o", "value", "mounted", dataset])?;
        Ok(value.trim() == "yes")
    }

    fn mount(&self, dataset: &str) -> Result<()> {
        self.run(&["mount", dataset]).map(|_| ())
    }

    fn unmount(&self, dataset: &str) -> Result<()> {
        self.run(&["unmount", dataset]).map(|_| ())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.run(&["destroy", name]).map(|_| ())
    }

    fn list_snapshots(&self, dataset: Option<&str>) -> Result<Vec<String>> {
        let mut args = vec!["list", "-H", "-t", "snapshot", "-o", "name", "-s", "creation"];
        if let Some(dataset) = dataset {
            args.extend(["-d", "1", dataset]);
        }
        match self.lines(&args) {
            Ok(names) => Ok(names),
            Err(e) if e.is_missing() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn clones_of(&self, snapshot: &str) -> Result<Vec<String>> {
        let value = self.run(&["get", "-H", "-o", "value", "clones", snapshot])?;
        let value = value.trim();
        if value.is_empty() || value == "-" {
            return Ok(Vec::new());
        }
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect())
    }

    fn mountpoint(&self, dataset: &str) -> Result<Option<PathBuf>> {
        let value = self.run(&["get", "-H", "-o", "value", "mountpoint", dataset])?;
        Ok(match value.trim() {
            "" | "-" | "none" | "legacy" => None,
            path => Some(PathBuf::from(path)),
        })
    }

    fn rollback(&self, snapshot: &str) -> Result<()> {
        self.run(&["rollback", "-r", snapshot]).map(|_| ())
    }
}
