use async_trait::async_trait;
use log::debug;
use std::process::Stdio;

use common::Resources;

use crate::ResticError;

/// A fully described child process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Scheduling priority and memory ceiling for the child
    pub resources: Option<Resources>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Environment value set on this spec
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external commands. Implemented over `tokio::process` for real runs
/// and by a scripted runner in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ResticError>;
}

/// Spawns real processes, wrapped in `ionice`/`nice` when resources are set
#[derive(Debug, Clone)]
pub struct SystemRunner {
    nice: String,
    ionice: String,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new("nice", "ionice")
    }
}

impl SystemRunner {
    pub fn new(nice: impl Into<String>, ionice: impl Into<String>) -> Self {
        Self {
            nice: nice.into(),
            ionice: ionice.into(),
        }
    }

    /// Program and arguments after applying the scheduling wrappers
    pub fn command_line(&self, spec: &CommandSpec) -> Vec<String> {
        let mut line = Vec::new();
        if let Some(resources) = &spec.resources {
            if let Some(class) = resources.io_class.ionice_class() {
                line.extend([self.ionice.clone(), "-c".to_string(), class.to_string()]);
            }
            if resources.nice != 0 {
                line.extend([
                    self.nice.clone(),
                    "-n".to_string(),
                    resources.nice.to_string(),
                ]);
            }
        }
        line.push(spec.program.clone());
        line.extend(spec.args.iter().cloned());
        line
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ResticError> {
        let line = self.command_line(spec);
        let (program, args) = line
            .split_first()
            .ok_or_else(|| ResticError::Output("empty command line".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let memory_limit = spec
            .resources
            .as_ref()
            .and_then(|r| r.memory_max_bytes())
            .transpose()
            .map_err(ResticError::Resources)?;
        if let Some(limit) = memory_limit {
            // SAFETY: setrlimit is async-signal-safe and touches no shared state
            unsafe {
                cmd.pre_exec(move || {
                    nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_AS,
                        limit,
                        limit,
                    )
                    .map_err(std::io::Error::from)
                });
            }
        }

        debug!("Running command: {cmd:?}");
        let output = cmd.output().await.map_err(|source| ResticError::Spawn {
            program: program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::IoClass;

    #[test]
    fn test_command_line_wraps_in_ionice_and_nice() {
        let runner = SystemRunner::default();
        let spec = CommandSpec::new("restic")
            .args(["backup", "/srv"])
            .resources(Resources::default());
        assert_eq!(
            runner.command_line(&spec),
            vec!["ionice", "-c", "3", "nice", "-n", "19", "restic", "backup", "/srv"]
        );

        let spec = CommandSpec::new("restic").arg("check").resources(Resources {
            nice: 0,
            io_class: IoClass::None,
            memory_max: None,
            timeout_secs: None,
        });
        assert_eq!(runner.command_line(&spec), vec!["restic", "check"]);
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::default();
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .env("CUSTODIAN_TEST", "1");
        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_memory_limit_applies_to_child() {
        let runner = SystemRunner::default();
        let spec = CommandSpec::new("sh")
            .args(["-c", "ulimit -v"])
            .resources(Resources {
                nice: 0,
                io_class: IoClass::None,
                memory_max: Some("512M".to_string()),
                timeout_secs: None,
            });
        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        // ulimit -v reports KiB
        assert_eq!(output.stdout.trim(), "524288");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = SystemRunner::default();
        let err = runner
            .run(&CommandSpec::new("/nonexistent/restic"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResticError::Spawn { .. }));
    }
}
