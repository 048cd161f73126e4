use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{CustodianConfig, Repository, Resources, RetentionPolicy};

use crate::error::{classify, is_missing_repository, EXIT_PARTIAL, EXIT_REPO_MISSING};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::ResticError;

/// Paths, tags and excludes of one `restic backup` call
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub paths: Vec<PathBuf>,
    pub tags: Vec<String>,
    pub exclude: Vec<String>,
}

/// Final `summary` message of `restic backup --json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSummary {
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub dirs_new: u64,
    pub data_added: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
    pub total_duration: f64,
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum BackupMessage {
    Summary(BackupSummary),
    Error {
        error: ErrorDetail,
        #[serde(default)]
        item: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default)]
pub struct BackupOutcome {
    pub summary: Option<BackupSummary>,
    /// Per-item errors restic reported while reading the source
    pub errors: Vec<String>,
    /// restic exited with "some files could not be read"
    pub partial: bool,
}

impl BackupOutcome {
    pub fn error_count(&self) -> u64 {
        if self.partial && self.errors.is_empty() {
            1
        } else {
            self.errors.len() as u64
        }
    }
}

/// An entry of `restic snapshots --json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct LsEntry {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// A file inside a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotFile {
    pub path: String,
    pub size: u64,
}

/// Whether a repository answered `restic cat config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryState {
    Ready,
    Missing,
}

/// restic bound to one repository
#[derive(Clone)]
pub struct Restic {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    repository: Repository,
    cache_dir: Option<PathBuf>,
    resources: Option<Resources>,
}

impl Restic {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, repository: Repository) -> Self {
        Self {
            runner,
            binary: binary.into(),
            repository,
            cache_dir: None,
            resources: None,
        }
    }

    pub fn from_config(config: &CustodianConfig, repository: Repository, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(runner, config.binaries.restic.clone(), repository)
            .with_cache_dir(config.cache_dir.clone())
    }

    pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = Some(cache_dir);
        self
    }

    /// Scheduling and memory limits for the restic process
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    fn spec<I, S>(&self, args: I) -> Result<CommandSpec, ResticError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.repository.password_file.exists() {
            return Err(ResticError::MissingPasswordFile(
                self.repository.password_file.clone(),
            ));
        }

        let mut spec = CommandSpec::new(self.binary.clone())
            .args(args)
            .env("RESTIC_REPOSITORY", self.repository.url.clone())
            .env(
                "RESTIC_PASSWORD_FILE",
                self.repository.password_file.to_string_lossy().into_owned(),
            );
        if let Some(cache_dir) = &self.cache_dir {
            spec = spec.env("RESTIC_CACHE_DIR", cache_dir.to_string_lossy().into_owned());
        }
        if let Some(path) = &self.repository.environment_file {
            for (key, value) in read_environment_file(path)? {
                spec = spec.env(key, value);
            }
        }
        if let Some(resources) = &self.resources {
            spec = spec.resources(resources.clone());
        }
        Ok(spec)
    }

    async fn exec<I, S>(&self, args: I) -> Result<CommandOutput, ResticError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.spec(args)?;
        debug!(
            "restic {} on repository {}",
            spec.args.join(" "),
            self.repository.name
        );
        self.runner.run(&spec).await
    }

    async fn exec_checked<I, S>(&self, command: &str, args: I) -> Result<CommandOutput, ResticError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let output = self.exec(args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(command_error(command, &output))
        }
    }

    /// `restic cat config`: is the repository there and readable
    pub async fn cat_config(&self) -> Result<RepositoryState, ResticError> {
        let output = self.exec(["cat", "config"]).await?;
        if output.success() {
            return Ok(RepositoryState::Ready);
        }
        if output.status == Some(EXIT_REPO_MISSING) || is_missing_repository(&output.stderr) {
            return Ok(RepositoryState::Missing);
        }
        Err(command_error("cat config", &output))
    }

    /// Initialises the repository when it does not exist yet. Returns whether
    /// this call created it. Losing an init race to another host counts as
    /// success.
    pub async fn ensure_initialized(&self) -> Result<bool, ResticError> {
        if self.cat_config().await? == RepositoryState::Ready {
            return Ok(false);
        }

        info!("Initialising restic repository {}", self.repository.name);
        let output = self.exec(["init"]).await?;
        if output.success() {
            return Ok(true);
        }
        if output.stderr.contains("already initialized") || output.stderr.contains("already exists") {
            info!(
                "Repository {} was initialised concurrently",
                self.repository.name
            );
            return Ok(false);
        }
        Err(command_error("init", &output))
    }

    /// `restic backup --json`. Exit code 3 is returned as a partial outcome.
    pub async fn backup(&self, request: &BackupRequest) -> Result<BackupOutcome, ResticError> {
        let mut args = vec!["backup".to_string(), "--json".to_string(), "--exclude-caches".to_string()];
        for tag in &request.tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        for pattern in &request.exclude {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        args.extend(request.paths.iter().map(|p| p.to_string_lossy().into_owned()));

        let output = self.exec(args).await?;
        let partial = output.status == Some(EXIT_PARTIAL);
        if !output.success() && !partial {
            return Err(command_error("backup", &output));
        }

        let mut outcome = parse_backup_output(&output.stdout);
        outcome.partial = partial;
        if partial && outcome.errors.is_empty() {
            outcome
                .errors
                .extend(output.stderr.lines().filter(|l| !l.trim().is_empty()).map(String::from));
        }
        Ok(outcome)
    }

    /// `restic forget --prune` for the snapshots carrying all of `tags`.
    ///
    /// An empty tag list would apply the policy to every snapshot in the
    /// repository, so it is refused.
    pub async fn forget(&self, tags: &[String], policy: &RetentionPolicy) -> Result<(), ResticError> {
        if policy.is_empty() {
            warn!(
                "Retention policy keeps nothing, refusing to prune {}",
                self.repository.name
            );
            return Ok(());
        }
        if tags.is_empty() {
            return Err(ResticError::UntaggedForget(self.repository.name.clone()));
        }
        let mut args = vec![
            "forget".to_string(),
            "--prune".to_string(),
            "--tag".to_string(),
            tags.join(","),
        ];
        args.push("--group-by".to_string());
        args.push("host,tags".to_string());
        args.extend(policy.forget_args());
        self.exec_checked("forget", args).await.map(|_| ())
    }

    /// `restic check`, optionally reading a subset of the pack data
    pub async fn check(&self, read_data_subset: Option<&str>) -> Result<(), ResticError> {
        let mut args = vec!["check".to_string()];
        if let Some(subset) = read_data_subset {
            args.push(format!("--read-data-subset={subset}"));
        }
        self.exec_checked("check", args).await.map(|_| ())
    }

    /// `restic snapshots --json`, oldest first
    pub async fn snapshots(&self, tags: &[String], latest: Option<usize>) -> Result<Vec<SnapshotInfo>, ResticError> {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        if !tags.is_empty() {
            args.push("--tag".to_string());
            args.push(tags.join(","));
        }
        if let Some(n) = latest {
            args.push("--latest".to_string());
            args.push(n.to_string());
        }
        let output = self.exec_checked("snapshots", args).await?;
        let trimmed = output.stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        let mut snapshots: Vec<SnapshotInfo> = serde_json::from_str(trimmed)?;
        snapshots.sort_by(|a, b| a.time.cmp(&b.time));
        Ok(snapshots)
    }

    /// Newest snapshot carrying all of `tags`
    pub async fn latest_snapshot(&self, tags: &[String]) -> Result<Option<SnapshotInfo>, ResticError> {
        Ok(self.snapshots(tags, Some(1)).await?.into_iter().last())
    }

    /// Regular files inside `snapshot`
    pub async fn ls(&self, snapshot: &str) -> Result<Vec<SnapshotFile>, ResticError> {
        let output = self.exec_checked("ls", ["ls", "--json", snapshot]).await?;
        let mut files = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LsEntry>(line) {
                Ok(LsEntry {
                    kind: Some(kind),
                    path: Some(path),
                    size,
                }) if kind == "file" => files.push(SnapshotFile {
                    path,
                    size: size.unwrap_or(0),
                }),
                Ok(_) => {}
                Err(e) => debug!("Skipping unparseable ls line: {e}"),
            }
        }
        Ok(files)
    }

    /// `restic restore <snapshot>[:<subpath>] --target <target> [--include ...]`
    pub async fn restore(
        &self,
        snapshot: &str,
        subpath: Option<&Path>,
        target: &Path,
        includes: &[String],
    ) -> Result<(), ResticError> {
        let source = match subpath {
            Some(sub) => format!("{snapshot}:{}", sub.display()),
            None => snapshot.to_string(),
        };
        let mut args = vec![
            "restore".to_string(),
            source,
            "--target".to_string(),
            target.to_string_lossy().into_owned(),
        ];
        for include in includes {
            args.push("--include".to_string());
            args.push(escape_pattern(include));
        }
        self.exec_checked("restore", args).await.map(|_| ())
    }
}

/// Escapes glob metacharacters so restic matches `path` literally
pub fn escape_pattern(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '\\' | '*' | '?' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn command_error(command: &str, output: &CommandOutput) -> ResticError {
    let message = output
        .stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .last()
        .unwrap_or("no error output")
        .trim()
        .to_string();
    ResticError::Command {
        command: command.to_string(),
        status: output.status,
        kind: classify(output.status, &output.stderr),
        message,
    }
}

fn parse_backup_output(stdout: &str) -> BackupOutcome {
    let mut outcome = BackupOutcome::default();
    for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        match serde_json::from_str::<BackupMessage>(line) {
            Ok(BackupMessage::Summary(summary)) => outcome.summary = Some(summary),
            Ok(BackupMessage::Error { error, item }) => outcome.errors.push(match item {
                Some(item) => format!("{item}: {}", error.message),
                None => error.message,
            }),
            Ok(BackupMessage::Other) => {}
            Err(e) => debug!("Skipping unparseable backup message: {e}"),
        }
    }
    outcome
}

/// Reads `KEY=VALUE` lines, as used by systemd `EnvironmentFile=`
pub fn read_environment_file(path: &Path) -> Result<Vec<(String, String)>, ResticError> {
    let text = fs::read_to_string(path)?;
    let mut vars = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            warn!("Ignoring malformed line in {}", path.display());
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.push((key.trim().to_string(), value.to_string()));
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{exit, ok, ScriptedRunner};
    use crate::test_support::repository;
    use crate::FailureKind;
    use tempfile::TempDir;

    fn restic(dir: &TempDir, runner: Arc<ScriptedRunner>) -> Restic {
        Restic::new(runner, "restic", repository(dir)).with_cache_dir(dir.path().join("cache"))
    }

    const BACKUP_JSON: &str = r#"{"message_type":"status","percent_done":0.5,"total_files":10}
{"message_type":"error","error":{"message":"open /srv/a/locked: permission denied"},"during":"archival","item":"/srv/a/locked"}
{"message_type":"verbose_status","action":"new","item":"/srv/a/b"}
{"message_type":"summary","files_new":3,"files_changed":1,"files_unmodified":6,"dirs_new":1,"data_added":2048,"total_files_processed":10,"total_bytes_processed":40960,"total_duration":1.5,"snapshot_id":"abcdef12"}"#;

    #[tokio::test]
    async fn test_environment_carries_repository() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("env");
        fs::write(
            &env_file,
            "# credentials\nexport AWS_ACCESS_KEY_ID=\"abc\"\nAWS_SECRET_ACCESS_KEY='def'\n\nbogus\n",
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mut repo = repository(&dir);
        repo.environment_file = Some(env_file);
        let restic = Restic::new(runner.clone(), "restic", repo);

        restic.check(Some("5%")).await.unwrap();
        let call = &runner.calls()[0];
        assert_eq!(call.args, vec!["check", "--read-data-subset=5%"]);
        assert_eq!(call.env_value("RESTIC_REPOSITORY"), Some("/mnt/nas/restic"));
        assert_eq!(call.env_value("AWS_ACCESS_KEY_ID"), Some("abc"));
        assert_eq!(call.env_value("AWS_SECRET_ACCESS_KEY"), Some("def"));
        assert_eq!(call.env_value("RESTIC_CACHE_DIR"), None);
    }

    #[tokio::test]
    async fn test_missing_password_file_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let mut repo = repository(&dir);
        repo.password_file = dir.path().join("absent");
        let restic = Restic::new(runner.clone(), "restic", repo);

        let err = restic.cat_config().await.unwrap_err();
        assert!(matches!(err, ResticError::MissingPasswordFile(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_initialized_creates_missing_repository() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("cat", exit(10, "Fatal: repository does not exist"));
        let restic = restic(&dir, runner.clone());

        assert!(restic.ensure_initialized().await.unwrap());
        assert_eq!(runner.calls_to("init").len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_initialized_tolerates_init_race() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on("cat", exit(1, "Is there a repository at the following location?"))
            .on("init", exit(1, "Fatal: create repository at /mnt/nas/restic failed: config file already exists"));
        let restic = restic(&dir, runner.clone());
        assert!(!restic.ensure_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_initialized_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let restic = restic(&dir, runner.clone());
        assert!(!restic.ensure_initialized().await.unwrap());
        assert!(runner.calls_to("init").is_empty());
    }

    #[tokio::test]
    async fn test_wrong_password_is_hard() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("cat", exit(12, "Fatal: wrong password or no key found"));
        let err = restic(&dir, runner).cat_config().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Hard);
    }

    #[tokio::test]
    async fn test_backup_parses_summary_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("backup", exit(3, ""));
        runner.on_with("backup", |_| CommandOutput {
            status: Some(3),
            stdout: BACKUP_JSON.to_string(),
            stderr: "Warning: at least one source file could not be read".to_string(),
        });
        let restic = restic(&dir, runner.clone());
        let request = BackupRequest {
            paths: vec![PathBuf::from("/srv/a")],
            tags: vec!["sonarr".into()],
            exclude: vec!["*.tmp".into()],
        };

        // first scripted response: bare exit 3
        let first = restic.backup(&request).await.unwrap();
        assert!(first.partial);
        assert_eq!(first.error_count(), 1);

        let outcome = restic.backup(&request).await.unwrap();
        assert!(outcome.partial);
        assert_eq!(outcome.errors, vec!["/srv/a/locked: open /srv/a/locked: permission denied"]);
        let summary = outcome.summary.unwrap();
        assert_eq!(summary.total_files_processed, 10);
        assert_eq!(summary.snapshot_id.as_deref(), Some("abcdef12"));

        let call = runner.calls_to("backup").remove(0);
        assert_eq!(
            call.args,
            vec!["backup", "--json", "--exclude-caches", "--tag", "sonarr", "--exclude", "*.tmp", "/srv/a"]
        );
    }

    #[tokio::test]
    async fn test_backup_failure_classified() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("backup", exit(11, "Fatal: unable to create lock in backend"));
        let err = restic(&dir, runner)
            .backup(&BackupRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_forget_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let restic = restic(&dir, runner.clone());
        restic
            .forget(
                &["sonarr".to_string(), "media".to_string()],
                &RetentionPolicy {
                    daily: 7,
                    weekly: 4,
                    monthly: 0,
                    yearly: 1,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            runner.calls()[0].args,
            vec![
                "forget", "--prune", "--tag", "sonarr,media", "--group-by", "host,tags",
                "--keep-daily", "7", "--keep-weekly", "4", "--keep-yearly", "1"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_retention_never_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let empty = RetentionPolicy {
            daily: 0,
            weekly: 0,
            monthly: 0,
            yearly: 0,
        };
        restic(&dir, runner.clone()).forget(&[], &empty).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_forget_without_tags_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let policy = RetentionPolicy {
            daily: 7,
            weekly: 0,
            monthly: 0,
            yearly: 0,
        };
        let err = restic(&dir, runner.clone()).forget(&[], &policy).await.unwrap_err();
        assert!(matches!(err, ResticError::UntaggedForget(ref name) if name == "nas-primary"));
        assert!(runner.calls_to("forget").is_empty());
    }

    #[tokio::test]
    async fn test_restore_includes_are_matched_literally() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let restic = restic(&dir, runner.clone());
        restic
            .restore(
                "abcd",
                None,
                Path::new("/tmp/scratch"),
                &[
                    "/srv/media/Show [2019]/ep?.mkv".to_string(),
                    "/srv/notes/*draft*.md".to_string(),
                    "/srv/plain.txt".to_string(),
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            runner.calls()[0].args[4..],
            [
                "--include",
                r"/srv/media/Show \[2019\]/ep\?.mkv",
                "--include",
                r"/srv/notes/\*draft\*.md",
                "--include",
                "/srv/plain.txt"
            ]
        );
        assert_eq!(escape_pattern(r"C:\x"), r"C:\\x");
    }

    #[tokio::test]
    async fn test_snapshots_and_ls() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner
            .on(
                "snapshots",
                ok(r#"[{"time":"2024-05-02T03:00:00.123+02:00","id":"bbbb","short_id":"bb","hostname":"forge","paths":["/srv"],"tags":["sonarr"]},
                       {"time":"2024-05-01T03:00:00Z","id":"aaaa","short_id":"aa","hostname":"forge","paths":["/srv"]}]"#),
            )
            .on(
                "ls",
                ok("{\"time\":\"2024-05-02T03:00:00Z\",\"struct_type\":\"snapshot\",\"id\":\"bbbb\"}\n\
                    {\"name\":\"srv\",\"type\":\"dir\",\"path\":\"/srv\",\"struct_type\":\"node\"}\n\
                    {\"name\":\"a.db\",\"type\":\"file\",\"path\":\"/srv/a.db\",\"size\":42,\"struct_type\":\"node\"}\n"),
            );
        let restic = restic(&dir, runner.clone());

        let snapshots = restic.snapshots(&[], None).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].id, "aaaa");
        assert_eq!(snapshots[1].tags.as_deref(), Some(&["sonarr".to_string()][..]));

        let files = restic.ls("bbbb").await.unwrap();
        assert_eq!(
            files,
            vec![SnapshotFile {
                path: "/srv/a.db".into(),
                size: 42
            }]
        );
    }

    #[tokio::test]
    async fn test_restore_with_subpath() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let restic = restic(&dir, runner.clone());
        restic
            .restore(
                "latest",
                Some(Path::new("/var/lib/custodian/snapshots/service-sonarr")),
                Path::new("/srv/sonarr"),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(
            runner.calls()[0].args,
            vec![
                "restore",
                "latest:/var/lib/custodian/snapshots/service-sonarr",
                "--target",
                "/srv/sonarr"
            ]
        );
    }
}
