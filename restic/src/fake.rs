//! Scripted [`CommandRunner`] for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::ResticError;

type Handler = Arc<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

#[derive(Clone)]
struct Step {
    handler: Handler,
    delay: Option<Duration>,
}

/// Answers each restic subcommand from a queue of scripted responses. The
/// last response of a queue repeats; unscripted subcommands succeed silently.
#[derive(Default)]
pub struct ScriptedRunner {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn exit(status: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(status),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// First non-flag argument, e.g. `backup` or `cat`
pub fn subcommand(spec: &CommandSpec) -> &str {
    spec.args
        .iter()
        .find(|a| !a.starts_with('-'))
        .map(String::as_str)
        .unwrap_or_default()
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, subcommand: &str, output: CommandOutput) -> &Self {
        self.on_with(subcommand, move |_| output.clone())
    }

    pub fn on_with<F>(&self, subcommand: &str, handler: F) -> &Self
    where
        F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    {
        self.push(subcommand, Arc::new(handler), None)
    }

    pub fn on_delayed(&self, subcommand: &str, delay: Duration, output: CommandOutput) -> &Self {
        self.push(subcommand, Arc::new(move |_| output.clone()), Some(delay))
    }

    fn push(&self, subcommand: &str, handler: Handler, delay: Option<Duration>) -> &Self {
        lock(&self.steps)
            .entry(subcommand.to_string())
            .or_default()
            .push_back(Step { handler, delay });
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, sub: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| subcommand(c) == sub)
            .collect()
    }

    fn next_step(&self, sub: &str) -> Option<Step> {
        let mut steps = lock(&self.steps);
        let queue = steps.get_mut(sub)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ResticError> {
        lock(&self.calls).push(spec.clone());
        let Some(step) = self.next_step(subcommand(spec)) else {
            return Ok(ok(""));
        };
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        Ok((step.handler)(spec))
    }
}
