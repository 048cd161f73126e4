//! In-memory [`ZfsOps`] for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::wrapper::ZfsOps;
use crate::{Result, ZfsError};

#[derive(Debug, Clone, Default)]
struct Dataset {
    origin: Option<String>,
    mountpoint: Option<PathBuf>,
    mounted: bool,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, Dataset>,
    // creation order
    snapshots: Vec<String>,
    failing: BTreeSet<String>,
    calls: Vec<String>,
}

/// Datasets and snapshots kept in memory. Mounting creates the mountpoint
/// directory on the real filesystem so callers see the clone's path.
#[derive(Debug, Default)]
pub struct FakeZfs {
    state: Mutex<State>,
}

fn missing(op: &str, name: &str) -> ZfsError {
    ZfsError::Command {
        args: format!("{op} {name}"),
        status: Some(1),
        stderr: format!("cannot open '{name}': dataset does not exist"),
    }
}

impl FakeZfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, name: &str, mountpoint: Option<PathBuf>) -> Self {
        self.lock().datasets.insert(
            name.to_string(),
            Dataset {
                origin: None,
                mounted: mountpoint.is_some(),
                mountpoint,
            },
        );
        self
    }

    pub fn with_snapshot(self, snapshot: &str) -> Self {
        self.lock().snapshots.push(snapshot.to_string());
        self
    }

    /// Makes every later call of `op` fail
    pub fn fail_on(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn datasets(&self) -> Vec<String> {
        self.lock().datasets.keys().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.lock().snapshots.clone()
    }

    /// Operations performed so far, as `op target`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enter(&self, op: &str, target: &str) -> Result<std::sync::MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(format!("{op} {target}"));
        if state.failing.contains(op) {
            return Err(ZfsError::Command {
                args: format!("{op} {target}"),
                status: Some(1),
                stderr: format!("injected failure in {op}"),
            });
        }
        Ok(state)
    }
}

impl ZfsOps for FakeZfs {
    fn dataset_exists(&self, name: &str) -> Result<bool> {
        let state = self.enter("list", name)?;
        Ok(state.datasets.contains_key(name))
    }

    fn snapshot(&self, snapshot: &str) -> Result<()> {
        let mut state = self.enter("snapshot", snapshot)?;
        let dataset = snapshot.split('@').next().unwrap_or_default();
        if !state.datasets.contains_key(dataset) {
            return Err(missing("snapshot", dataset));
        }
        if state.snapshots.iter().any(|s| s == snapshot) {
            return Err(ZfsError::Command {
                args: format!("snapshot {snapshot}"),
                status: Some(1),
                stderr: format!("cannot create snapshot '{snapshot}': dataset already exists"),
            });
        }
        state.snapshots.push(snapshot.to_string());
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &str, clone: &str, properties: &[(&str, String)]) -> Result<()> {
        let mut state = self.enter("clone", clone)?;
        if !state.snapshots.iter().any(|s| s == snapshot) {
            return Err(missing("clone", snapshot));
        }
        let mountpoint = properties
            .iter()
            .find(|(key, _)| *key == "mountpoint")
            .map(|(_, value)| PathBuf::from(value));
        let auto = !properties
            .iter()
            .any(|(key, value)| *key == "canmount" && value == "noauto");
        if auto {
            if let Some(path) = &mountpoint {
                fs::create_dir_all(path)?;
            }
        }
        state.datasets.insert(
            clone.to_string(),
            Dataset {
                origin: Some(snapshot.to_string()),
                mountpoint,
                mounted: auto,
            },
        );
        Ok(())
    }

    fn is_mounted(&self, dataset: &str) -> Result<bool> {
        let state = self.enter("get-mounted", dataset)?;
        state
            .datasets
            .get(dataset)
            .map(|d| d.mounted)
            .ok_or_else(|| missing("get", dataset))
    }

    fn mount(&self, dataset: &str) -> Result<()> {
        let mut state = self.enter("mount", dataset)?;
        let entry = state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| missing("mount", dataset))?;
        if let Some(path) = &entry.mountpoint {
            fs::create_dir_all(path)?;
        }
        entry.mounted = true;
        Ok(())
    }

    fn unmount(&self, dataset: &str) -> Result<()> {
        let mut state = self.enter("unmount", dataset)?;
        let entry = state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| missing("unmount", dataset))?;
        if !entry.mounted {
            return Err(ZfsError::Command {
                args: format!("unmount {dataset}"),
                status: Some(1),
                stderr: format!("cannot unmount '{dataset}': not currently mounted"),
            });
        }
        entry.mounted = false;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.enter("destroy", name)?;
        if name.contains('@') {
            if state
                .datasets
                .values()
                .any(|d| d.origin.as_deref() == Some(name))
            {
                return Err(ZfsError::Command {
                    args: format!("destroy {name}"),
                    status: Some(1),
                    stderr: format!("cannot destroy '{name}': snapshot has dependent clones"),
                });
            }
            let before = state.snapshots.len();
            state.snapshots.retain(|s| s != name);
            if state.snapshots.len() == before {
                return Err(missing("destroy", name));
            }
            return Ok(());
        }
        match state.datasets.get(name) {
            None => Err(missing("destroy", name)),
            Some(d) if d.mounted => Err(ZfsError::Command {
                args: format!("destroy {name}"),
                status: Some(1),
                stderr: format!("cannot destroy '{name}': dataset is busy"),
            }),
            Some(_) => {
                state.datasets.remove(name);
                let prefix = format!("{name}@");
                state.snapshots.retain(|s| !s.starts_with(&prefix));
                Ok(())
            }
        }
    }

    fn list_snapshots(&self, dataset: Option<&str>) -> Result<Vec<String>> {
        let state = self.enter("list-snapshots", dataset.unwrap_or("-"))?;
        Ok(match dataset {
            None => state.snapshots.clone(),
            Some(dataset) => {
                let prefix = format!("{dataset}@");
                state
                    .snapshots
                    .iter()
                    .filter(|s| s.starts_with(&prefix))
                    .cloned()
                    .collect()
            }
        })
    }

    fn clones_of(&self, snapshot: &str) -> Result<Vec<String>> {
        let state = self.enter("get-clones", snapshot)?;
        Ok(state
            .datasets
            .iter()
            .filter(|(_, d)| d.origin.as_deref() == Some(snapshot))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn mountpoint(&self, dataset: &str) -> Result<Option<PathBuf>> {
        let state = self.enter("get-mountpoint", dataset)?;
        state
            .datasets
            .get(dataset)
            .map(|d| d.mountpoint.clone())
            .ok_or_else(|| missing("get", dataset))
    }

    fn rollback(&self, snapshot: &str) -> Result<()> {
        let mut state = self.enter("rollback", snapshot)?;
        let position = state
            .snapshots
            .iter()
            .position(|s| s == snapshot)
            .ok_or_else(|| missing("rollback", snapshot))?;
        let prefix = snapshot
            .split('@')
            .next()
            .map(|d| format!("{d}@"))
            .unwrap_or_default();
        let mut index = 0;
        state.snapshots.retain(|s| {
            let keep = index <= position || !s.starts_with(&prefix);
            index += 1;
            keep
        });
        Ok(())
    }
}
