//! Deployment pipeline orchestration.
//!
//! [`Deployer::handle`] takes a raw trigger through configuration check,
//! access guard, webhook interpretation, run lock, environment check,
//! repository synchronization, publish and marker update, then reports the
//! transcript on every exit path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::access::{authorize, token_fingerprint, AccessDecision};
use crate::config::DeployConfig;
use crate::domain::{DeployError, DeploymentRequest, ErrorKind, Result, TriggerRequest};
use crate::ledger::VersionLedger;
use crate::lock::{LockAttempt, RunLock};
use crate::notify::{Notice, Notifier, ReportHeader, SuccessMetadata};
use crate::obs::{self, DeploySpan};
use crate::publish::TreePublisher;
use crate::runner::{probe_tool, CommandRunner, ProcessRunner};
use crate::sync::RepositorySynchronizer;
use crate::transcript::{ChangeSummary, RunOutput};
use crate::webhook::{interpret, select_branch, BranchDecision, Interpretation};

/// Tools that must be installed on the server.
pub const REQUIRED_TOOLS: [&str; 2] = ["git", "rsync"];

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Deployed {
        commit: String,
        files: ChangeSummary,
    },
    /// Nothing to do: event not applicable or branch not allowed.
    NoOp { reason: String },
    /// Another run holds the lock.
    InProgress { holder_run_id: Option<String> },
    Denied { reason: String },
    Misconfigured { problems: Vec<String> },
    /// Malformed payload of a recognised provider event. No stage runs, like
    /// a no-op, but the status is 400 so the provider's delivery log shows
    /// the rejected payload instead of a success.
    InvalidPayload { reason: String },
    Failed { error: String, status: u16 },
}

impl Outcome {
    /// HTTP-equivalent status.
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Deployed { .. } | Outcome::NoOp { .. } => 200,
            Outcome::InProgress { .. } => 409,
            Outcome::Denied { .. } | Outcome::Misconfigured { .. } => 403,
            Outcome::InvalidPayload { .. } => 400,
            Outcome::Failed { status, .. } => *status,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Deployed { .. } => "deployed",
            Outcome::NoOp { .. } => "no_op",
            Outcome::InProgress { .. } => "in_progress",
            Outcome::Denied { .. } => "denied",
            Outcome::Misconfigured { .. } => "misconfigured",
            Outcome::InvalidPayload { .. } => "invalid_payload",
            Outcome::Failed { .. } => "failed",
        }
    }

    /// Deployed or a graceful no-op.
    pub fn is_success(&self) -> bool {
        self.status() == 200
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub run_id: String,
    pub outcome: Outcome,
    pub transcript: RunOutput,
}

impl DeployReport {
    pub fn status(&self) -> u16 {
        self.outcome.status()
    }

    /// Response body for the caller.
    pub fn body(&self) -> String {
        self.transcript.render()
    }
}

/// Runs deployments for one configuration.
pub struct Deployer {
    config: DeployConfig,
    runner: Arc<dyn CommandRunner>,
    notifier: Notifier,
    lock: RunLock,
}

impl Deployer {
    pub fn new(config: DeployConfig, runner: Arc<dyn CommandRunner>, notifier: Notifier) -> Self {
        let lock = RunLock::new(config.lock_file.clone());
        Self {
            config,
            runner,
            notifier,
            lock,
        }
    }

    /// Process runner plus the sinks and extensions named by `config`.
    pub fn from_config(config: DeployConfig) -> Result<Self> {
        let notifier = Notifier::from_config(&config)?;
        Ok(Self::new(config, Arc::new(ProcessRunner), notifier))
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Handle one trigger end to end. Never fails: every error becomes an
    /// [`Outcome`] and is reported.
    pub async fn handle(&self, trigger: TriggerRequest) -> DeployReport {
        let run_id = Uuid::new_v4().to_string();
        let span = DeploySpan::span(&run_id, trigger.branch.as_deref().unwrap_or(""));
        self.handle_run(run_id, trigger).instrument(span).await
    }

    async fn handle_run(&self, run_id: String, trigger: TriggerRequest) -> DeployReport {
        let started = Instant::now();
        let mut out = RunOutput::new(&run_id);
        let mut header = ReportHeader {
            caller_address: trigger.caller_address.clone(),
            branch: trigger.branch.clone().unwrap_or_default(),
            commit: trigger.commit.clone().unwrap_or_default(),
        };

        let (outcome, notice) = self
            .decide(&run_id, &trigger, &mut header, &mut out, started)
            .await;

        self.notifier.report(&mut out, &notice, &header).await;
        obs::emit_deploy_finished(
            &run_id,
            outcome.label(),
            outcome.status(),
            started.elapsed().as_millis() as u64,
        );
        DeployReport {
            run_id,
            outcome,
            transcript: out,
        }
    }

    async fn decide(
        &self,
        run_id: &str,
        trigger: &TriggerRequest,
        header: &mut ReportHeader,
        out: &mut RunOutput,
        started: Instant,
    ) -> (Outcome, Notice) {
        let problems = self.config.problems();
        if !problems.is_empty() {
            out.error("Configuration Error");
            for problem in &problems {
                out.error(problem.clone());
            }
            let notice = Notice::Failure(format!("Configuration Error:\n\n{}", problems.join("\n")));
            return (Outcome::Misconfigured { problems }, notice);
        }

        if let AccessDecision::Deny(reason) =
            authorize(&trigger.caller_address, trigger.supplied_token(), &self.config)
        {
            obs::emit_denied(run_id, &trigger.caller_address, &reason);
            out.error(format!("Access Denied: {reason}"));
            return (
                Outcome::Denied {
                    reason: reason.clone(),
                },
                Notice::Failure(format!("Access Denied: {reason}")),
            );
        }

        let interpretation = match interpret(trigger) {
            Ok(found) => found,
            Err(e) => {
                out.error(e.to_string());
                return (
                    Outcome::InvalidPayload {
                        reason: e.to_string(),
                    },
                    Notice::Quiet,
                );
            }
        };
        match &interpretation {
            Interpretation::Webhook { provider, .. }
            | Interpretation::NotApplicable { provider, .. } => {
                out.note(format!("{} headers detected", provider.name()));
            }
            Interpretation::Manual => {
                out.note("No Bitbucket or GitHub webhook headers detected. Assuming manual trigger.");
                if trigger.branch.is_none() {
                    if let Some(default) = self.config.default_branch() {
                        out.note(format!(
                            "No branch specified, assuming default branch {default}"
                        ));
                    }
                }
            }
        }

        let (branch, event) =
            match select_branch(&interpretation, trigger.branch.as_deref(), &self.config) {
                BranchDecision::Deploy { branch, event } => (branch, event),
                BranchDecision::Rejected(reason) => {
                    out.note(format!("{reason}\n\nDone."));
                    return (Outcome::NoOp { reason }, Notice::Quiet);
                }
            };
        header.branch = branch.clone();

        let request = DeploymentRequest::new(
            branch,
            trigger.commit.clone(),
            event,
            trigger.caller_address.clone(),
            trigger.supplied_token(),
        );
        obs::emit_deploy_started(
            run_id,
            request.caller_address(),
            request.source_event().as_str(),
            &token_fingerprint(request.supplied_token()),
        );

        let guard = match self.lock.try_acquire(run_id) {
            Ok(LockAttempt::Acquired(guard)) => guard,
            Ok(LockAttempt::AlreadyHeld(holder)) => {
                let holder_run_id = holder.map(|h| h.run_id);
                obs::emit_lock_contended(run_id, holder_run_id.as_deref());
                out.error(format!(
                    "File {} detected, another process already running",
                    self.lock.path().display()
                ));
                return (Outcome::InProgress { holder_run_id }, Notice::Quiet);
            }
            Err(e) => return self.failed(e, out),
        };

        let result = self.deploy(run_id, &request, out).await;
        if let Err(e) = guard.release() {
            warn!(error = %e, "failed to release run lock");
        }

        match result {
            Ok((commit, files)) => {
                let elapsed = started.elapsed().as_secs_f64();
                out.note(format!("Done in {elapsed:.3}sec"));
                let metadata = SuccessMetadata {
                    remote: self.config.remote_repository.clone(),
                    branch: request.branch().to_string(),
                    target_directory: self.config.target_dir.clone(),
                    commit: commit.clone(),
                    elapsed_seconds: elapsed,
                };
                info!(commit = %commit, files = files.total, "deployment complete");
                (Outcome::Deployed { commit, files }, Notice::Success(metadata))
            }
            Err(e) => self.failed(e, out),
        }
    }

    fn failed(&self, err: DeployError, out: &mut RunOutput) -> (Outcome, Notice) {
        out.error(err.to_string());
        if err.kind() == ErrorKind::Command {
            out.error(
                "Error encountered! Stopping the script to prevent possible data loss.\n\
                 CHECK THE DATA IN YOUR TARGET DIR!",
            );
        }
        let message = err.to_string();
        (
            Outcome::Failed {
                error: message.clone(),
                status: err.status_code(),
            },
            Notice::Failure(message),
        )
    }

    /// Locked part of the run.
    async fn deploy(
        &self,
        run_id: &str,
        request: &DeploymentRequest,
        out: &mut RunOutput,
    ) -> Result<(String, ChangeSummary)> {
        let stage = Instant::now();
        self.check_environment(out).await?;
        obs::emit_stage(run_id, "environment", stage.elapsed().as_millis() as u64);

        out.note(format!(
            "Deploying : {} ({})\nto        : {}",
            self.config.remote_repository,
            request.branch(),
            self.config.target_dir.display()
        ));

        let stage = Instant::now();
        let ledger = VersionLedger::new(self.config.version_file());
        let mut sync = RepositorySynchronizer::new(self.runner.as_ref(), &self.config);
        let synced = sync.synchronize(request, &ledger, out).await?;
        obs::emit_stage(run_id, "sync", stage.elapsed().as_millis() as u64);

        let stage = Instant::now();
        TreePublisher::new(self.runner.as_ref(), &self.config)
            .publish(
                &self.config.git_dir,
                &self.config.target_dir,
                &synced.deletions,
                out,
            )
            .await?;
        obs::emit_stage(run_id, "publish", stage.elapsed().as_millis() as u64);

        out.note(format!(
            "Update target directory version file to commit {}",
            synced.target
        ));
        ledger.write(&synced.target)?;

        let files = out
            .summary
            .unwrap_or_else(|| ChangeSummary::from(&synced.changes));
        Ok((synced.target, files))
    }

    /// Verify every required tool can be spawned.
    pub async fn check_environment(&self, out: &mut RunOutput) -> Result<()> {
        out.note("Checking the environment ...");
        let cwd: PathBuf = std::env::temp_dir();
        for tool in REQUIRED_TOOLS {
            match probe_tool(self.runner.as_ref(), tool, &cwd, self.config.time_limit()).await {
                Ok(version) => out.note(format!("{tool} : {version}")),
                Err(e) => {
                    if matches!(e, DeployError::Environment { .. }) {
                        out.error(format!(
                            "{tool} not available. It needs to be installed on the server for this script to work."
                        ));
                    }
                    return Err(e);
                }
            }
        }
        out.note("Environment OK.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, CommandSpec};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Pretends to be git and rsync.
    #[derive(Default)]
    struct FakeTools {
        fail_on: Option<&'static str>,
        missing: Option<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for FakeTools {
        async fn run(&self, spec: &CommandSpec, _limit: Duration) -> Result<CommandOutput> {
            if self.missing == Some(spec.program.as_str()) {
                return Err(DeployError::Environment {
                    tool: spec.program.clone(),
                });
            }
            let line = spec.display();
            self.seen.lock().unwrap().push(line.clone());
            let output = if spec.args.iter().any(|a| a == "log") {
                "cccc3333\naaaa1111".to_string()
            } else if spec.args.iter().any(|a| a == "diff") {
                "A\tindex.html\nA\tapp.js".to_string()
            } else {
                String::new()
            };
            let failed = self.fail_on.is_some_and(|f| line.contains(f));
            Ok(CommandOutput {
                exit_code: i32::from(failed),
                output,
                duration_ms: 0,
            })
        }
    }

    fn config(dir: &std::path::Path) -> DeployConfig {
        let git_dir = dir.join("git");
        std::fs::create_dir_all(git_dir.join(".git")).unwrap();
        DeployConfig {
            remote_repository: "https://example.com/site.git".to_string(),
            branches: vec!["main".to_string(), "staging".to_string()],
            access_token: "s3cret".to_string(),
            git_dir,
            target_dir: dir.join("www"),
            lock_file: dir.join("deploy.lock"),
            commands_after_rsync: vec!["touch after-hook".to_string()],
            ..DeployConfig::default()
        }
    }

    fn build(config: DeployConfig, tools: FakeTools) -> (Deployer, Arc<FakeTools>) {
        let tools = Arc::new(tools);
        let runner: Arc<dyn CommandRunner> = tools.clone();
        (Deployer::new(config, runner, Notifier::default()), tools)
    }

    #[tokio::test]
    async fn test_manual_deploy_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let version = cfg.version_file();
        let (deployer, tools) = build(cfg, FakeTools::default());

        let report = deployer
            .handle(TriggerRequest::manual("127.0.0.1", "s3cret"))
            .await;
        assert_eq!(report.status(), 200, "{}", report.body());
        match &report.outcome {
            Outcome::Deployed { commit, files } => {
                assert_eq!(commit, "cccc3333");
                assert_eq!(files.added, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(version).unwrap().trim(), "cccc3333");
        assert!(!deployer.lock().is_held());
        assert!(tools.seen.lock().unwrap().iter().any(|c| c == "touch after-hook"));
    }

    #[tokio::test]
    async fn test_bad_token_is_denied_without_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (deployer, tools) = build(config(dir.path()), FakeTools::default());
        let report = deployer
            .handle(TriggerRequest::manual("127.0.0.1", "wrong"))
            .await;
        assert_eq!(report.status(), 403);
        assert!(matches!(report.outcome, Outcome::Denied { .. }));
        assert!(tools.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_misconfiguration_lists_problems() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.remote_repository.clear();
        cfg.access_token.clear();
        let (deployer, _) = build(cfg, FakeTools::default());
        let report = deployer
            .handle(TriggerRequest::manual("127.0.0.1", ""))
            .await;
        assert_eq!(report.status(), 403);
        match report.outcome {
            Outcome::Misconfigured { problems } => assert_eq!(problems.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_held_lock_is_in_progress_and_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let lock = RunLock::new(cfg.lock_file.clone());
        let _held = lock.try_acquire("other-run").unwrap();
        let (deployer, tools) = build(cfg, FakeTools::default());

        let report = deployer
            .handle(TriggerRequest::manual("127.0.0.1", "s3cret"))
            .await;
        assert_eq!(report.status(), 409);
        assert_eq!(
            report.outcome,
            Outcome::InProgress {
                holder_run_id: Some("other-run".to_string())
            }
        );
        assert!(lock.is_held());
        assert!(tools.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unapplicable_event_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (deployer, tools) = build(config(dir.path()), FakeTools::default());
        let trigger = TriggerRequest::manual("127.0.0.1", "s3cret")
            .with_header("X-GitHub-Event", "issues")
            .with_body("{}");
        let report = deployer.handle(trigger).await;
        assert_eq!(report.status(), 200);
        assert!(matches!(report.outcome, Outcome::NoOp { .. }));
        assert!(tools.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let (deployer, tools) = build(config(dir.path()), FakeTools::default());
        let trigger = TriggerRequest::manual("127.0.0.1", "s3cret")
            .with_header("X-GitHub-Event", "push")
            .with_body("{not json");
        let report = deployer.handle(trigger).await;
        assert_eq!(report.status(), 400);
        assert!(matches!(report.outcome, Outcome::InvalidPayload { .. }));
        assert!(tools.seen.lock().unwrap().is_empty());
        assert!(!deployer.lock().is_held());
        assert!(!deployer.config().version_file().exists());
    }

    #[tokio::test]
    async fn test_critical_failure_stops_before_marker_and_post_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let version = cfg.version_file();
        let tools = FakeTools {
            fail_on: Some("--exclude=.git"),
            ..FakeTools::default()
        };
        let (deployer, tools) = build(cfg, tools);

        let report = deployer
            .handle(TriggerRequest::manual("127.0.0.1", "s3cret"))
            .await;
        assert_eq!(report.status(), 500);
        assert!(report.body().contains("CHECK THE DATA IN YOUR TARGET DIR!"));
        assert!(!version.exists());
        assert!(!tools.seen.lock().unwrap().iter().any(|c| c == "touch after-hook"));
        assert!(!deployer.lock().is_held());
    }

    #[tokio::test]
    async fn test_missing_tool_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let tools = FakeTools {
            missing: Some("rsync"),
            ..FakeTools::default()
        };
        let (deployer, tools) = build(config(dir.path()), tools);
        let report = deployer
            .handle(TriggerRequest::manual("127.0.0.1", "s3cret"))
            .await;
        assert_eq!(report.status(), 500);
        assert!(report.body().contains("rsync not available"));
        assert!(!tools.seen.lock().unwrap().iter().any(|c| c.starts_with("git fetch")));
    }
}
