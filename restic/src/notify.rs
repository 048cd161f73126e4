use async_trait::async_trait;
use log::{debug, error, warn};
use serde::Serialize;
use std::process::Stdio;

use common::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Warning,
    Failure,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Warning => "warning",
            EventStatus::Failure => "failure",
        }
    }
}

/// Outcome of a backup, check or restore test, as handed to notifiers
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// `backup`, `check`, `restore-test` or `preseed`
    pub operation: String,
    /// Job, repository or service the event is about
    pub subject: String,
    pub repository: Option<String>,
    pub status: EventStatus,
    pub message: String,
    pub duration_secs: f64,
}

impl Event {
    pub fn summary(&self) -> String {
        format!(
            "custodian {} of {} {}: {}",
            self.operation,
            self.subject,
            self.status.as_str(),
            self.message
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `event`. Delivery problems are logged, never returned.
    async fn notify(&self, event: &Event);
}

/// Runs `notify.on_success` / `notify.on_failure` with the event in
/// `CUSTODIAN_*` environment variables
#[derive(Debug, Clone, Default)]
pub struct CommandHook {
    on_success: Vec<String>,
    on_failure: Vec<String>,
}

impl CommandHook {
    pub fn new(on_success: Vec<String>, on_failure: Vec<String>) -> Self {
        Self {
            on_success,
            on_failure,
        }
    }

    fn argv_for(&self, status: EventStatus) -> &[String] {
        match status {
            EventStatus::Success | EventStatus::Warning => &self.on_success,
            EventStatus::Failure => &self.on_failure,
        }
    }
}

#[async_trait]
impl Notifier for CommandHook {
    async fn notify(&self, event: &Event) {
        let Some((program, args)) = self.argv_for(event.status).split_first() else {
            return;
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env("CUSTODIAN_OPERATION", &event.operation)
            .env("CUSTODIAN_SUBJECT", &event.subject)
            .env("CUSTODIAN_REPOSITORY", event.repository.as_deref().unwrap_or(""))
            .env("CUSTODIAN_STATUS", event.status.as_str())
            .env("CUSTODIAN_MESSAGE", &event.message)
            .env("CUSTODIAN_DURATION", format!("{:.0}", event.duration_secs))
            .stdin(Stdio::null());

        debug!("Running notification hook: {cmd:?}");
        match cmd.status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("Notification hook {program} exited with {status}"),
            Err(e) => error!("Failed to run notification hook {program}: {e}"),
        }
    }
}

/// Reports warnings and failures to Sentry
#[derive(Debug, Clone, Default)]
pub struct SentryNotifier;

#[async_trait]
impl Notifier for SentryNotifier {
    async fn notify(&self, event: &Event) {
        let level = match event.status {
            EventStatus::Success => return,
            EventStatus::Warning => sentry::Level::Warning,
            EventStatus::Failure => sentry::Level::Error,
        };
        sentry::with_scope(
            |scope| {
                scope.set_tag("operation", &event.operation);
                scope.set_tag("subject", &event.subject);
                if let Some(repository) = &event.repository {
                    scope.set_tag("repository", repository);
                }
            },
            || sentry::capture_message(&event.summary(), level),
        );
    }
}

/// Fans an event out to every configured notifier
#[derive(Default)]
pub struct Notifiers {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut notifiers = Self::new();
        if !config.on_success.is_empty() || !config.on_failure.is_empty() {
            notifiers.push(Box::new(CommandHook::new(
                config.on_success.clone(),
                config.on_failure.clone(),
            )));
        }
        if config.sentry_dsn.is_some() {
            notifiers.push(Box::new(SentryNotifier));
        }
        notifiers
    }

    pub fn push(&mut self, notifier: Box<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for Notifiers {
    async fn notify(&self, event: &Event) {
        for notifier in &self.notifiers {
            notifier.notify(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn event(status: EventStatus) -> Event {
        Event {
            operation: "backup".to_string(),
            subject: "service-sonarr".to_string(),
            repository: Some("nas-primary".to_string()),
            status,
            message: "restic backup failed".to_string(),
            duration_secs: 12.4,
        }
    }

    #[tokio::test]
    async fn test_command_hook_receives_event_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("event");
        let script = format!(
            "echo \"$CUSTODIAN_OPERATION $CUSTODIAN_SUBJECT $CUSTODIAN_REPOSITORY $CUSTODIAN_STATUS $CUSTODIAN_DURATION\" > {}",
            out.display()
        );
        let hook = CommandHook::new(
            vec![],
            vec!["sh".to_string(), "-c".to_string(), script],
        );

        hook.notify(&event(EventStatus::Success)).await;
        assert!(!out.exists());

        hook.notify(&event(EventStatus::Failure)).await;
        assert_eq!(
            fs::read_to_string(&out).unwrap().trim(),
            "backup service-sonarr nas-primary failure 12"
        );
    }

    #[tokio::test]
    async fn test_failing_hook_is_not_fatal() {
        let hook = CommandHook::new(vec!["/nonexistent/hook".to_string()], vec![]);
        hook.notify(&event(EventStatus::Warning)).await;
    }

    #[test]
    fn test_from_config() {
        let config = NotifyConfig {
            on_success: vec![],
            on_failure: vec!["logger".to_string()],
            sentry_dsn: Some("https://key@sentry.example/1".to_string()),
        };
        assert_eq!(Notifiers::from_config(&config).len(), 2);
        assert!(Notifiers::from_config(&NotifyConfig::default()).is_empty());
    }
}
