//! Tree publisher: hooks, rsync mirror and explicit deletions.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::DeployConfig;
use crate::domain::Result;
use crate::runner::{execute, CommandRunner, CommandSpec};
use crate::transcript::RunOutput;

/// What the publisher did to the production directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub hooks_before: usize,
    pub hooks_after: usize,
    /// Paths removed by explicit deletion.
    pub deleted: Vec<PathBuf>,
    /// Deleted paths that were already absent.
    pub already_absent: Vec<PathBuf>,
}

/// Publishes the working tree into the production directory.
pub struct TreePublisher<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a DeployConfig,
}

impl<'a> TreePublisher<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a DeployConfig) -> Self {
        Self { runner, config }
    }

    /// The rsync invocation mirroring `source` into `target`.
    pub fn rsync_command(&self, source: &Path, target: &Path) -> CommandSpec {
        let mut spec = CommandSpec::new("rsync", source)
            .args(self.config.rsync_flags.split_whitespace());
        if self.config.mirror_delete {
            spec = spec.arg("--delete");
        }
        spec.arg(with_trailing_slash(source))
            .arg(with_trailing_slash(target))
            .args(
                self.config
                    .mirror_excludes()
                    .into_iter()
                    .map(|pattern| format!("--exclude={pattern}")),
            )
    }

    /// Run the publish steps in order. Any critical failure stops the
    /// remaining steps.
    pub async fn publish(
        &self,
        source: &Path,
        target: &Path,
        deletions: &[PathBuf],
        out: &mut RunOutput,
    ) -> Result<PublishReport> {
        let limit = self.config.time_limit();
        let mut report = PublishReport::default();

        if !self.config.commands_before_rsync.is_empty() {
            out.note("Running before rsync commands");
            for command in &self.config.commands_before_rsync {
                execute(self.runner, &CommandSpec::shell(command, source), limit, out).await?;
                report.hooks_before += 1;
            }
        }

        tokio::fs::create_dir_all(target).await?;
        execute(self.runner, &self.rsync_command(source, target), limit, out).await?;

        if !deletions.is_empty() {
            out.note("Deleting files removed from repository");
        }
        for path in deletions {
            match remove_path(path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "deleted");
                    report.deleted.push(path.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    out.note(format!("{} already absent", path.display()));
                    report.already_absent.push(path.clone());
                }
                Err(e) => {
                    out.error(format!("cannot delete {}: {e}", path.display()));
                    return Err(e.into());
                }
            }
        }

        if !self.config.commands_after_rsync.is_empty() {
            out.note("Running after rsync commands");
            for command in &self.config.commands_after_rsync {
                execute(self.runner, &CommandSpec::shell(command, target), limit, out).await?;
                report.hooks_after += 1;
            }
        }

        if self.config.cleanup_work_tree {
            out.note("Cleanup work tree");
            let clean = CommandSpec::git(["clean", "-dfx"], source).non_critical();
            execute(self.runner, &clean, limit, out).await?;
        }

        Ok(report)
    }
}

fn with_trailing_slash(path: &Path) -> String {
    let mut text = path.to_string_lossy().into_owned();
    if !text.ends_with('/') {
        text.push('/');
    }
    text
}

/// Remove a file, symlink or (for a deleted submodule) a directory.
async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeployError;
    use crate::runner::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records commands; fails any whose display contains `fail_on`.
    struct Recording {
        fail_on: Option<String>,
        seen: Mutex<Vec<(String, PathBuf)>>,
    }

    impl Recording {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                fail_on: fail_on.map(str::to_string),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for Recording {
        async fn run(&self, spec: &CommandSpec, _limit: Duration) -> Result<CommandOutput> {
            let line = spec.display();
            self.seen.lock().unwrap().push((line.clone(), spec.cwd.clone()));
            let failed = self.fail_on.as_deref().is_some_and(|f| line.contains(f));
            Ok(CommandOutput {
                exit_code: i32::from(failed),
                output: String::new(),
                duration_ms: 0,
            })
        }
    }

    fn config() -> DeployConfig {
        DeployConfig {
            commands_before_rsync: vec!["npm run build".to_string()],
            commands_after_rsync: vec!["php artisan migrate".to_string()],
            exclude: vec!["node_modules".to_string()],
            ..DeployConfig::default()
        }
    }

    #[test]
    fn test_rsync_command_shape() {
        let cfg = config();
        let runner = Recording::new(None);
        let publisher = TreePublisher::new(&runner, &cfg);
        let spec = publisher.rsync_command(Path::new("/srv/git"), Path::new("/srv/www/"));
        assert_eq!(
            spec.display(),
            "rsync -rltgoDzvO /srv/git/ /srv/www/ --exclude=.git --exclude=node_modules"
        );

        let mirrored = DeployConfig {
            mirror_delete: true,
            ..cfg
        };
        let publisher = TreePublisher::new(&runner, &mirrored);
        let spec = publisher.rsync_command(Path::new("/a"), Path::new("/b"));
        assert!(spec.args.contains(&"--delete".to_string()));
    }

    #[tokio::test]
    async fn test_steps_run_in_order_with_hook_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("git");
        let target = dir.path().join("www");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("gone.txt"), "x").unwrap();

        let cfg = DeployConfig {
            cleanup_work_tree: true,
            ..config()
        };
        let runner = Recording::new(None);
        let publisher = TreePublisher::new(&runner, &cfg);
        let mut out = RunOutput::new("r");
        let deletions = vec![target.join("gone.txt"), target.join("never-existed.txt")];
        let report = publisher
            .publish(&source, &target, &deletions, &mut out)
            .await
            .unwrap();

        assert_eq!(report.deleted, vec![target.join("gone.txt")]);
        assert_eq!(report.already_absent, vec![target.join("never-existed.txt")]);
        assert!(!target.join("gone.txt").exists());

        let seen = runner.seen.lock().unwrap().clone();
        let order: Vec<&str> = seen.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(order[0], "npm run build");
        assert!(order[1].starts_with("rsync"));
        assert_eq!(order[2], "php artisan migrate");
        assert_eq!(order[3], "git clean -dfx");
        assert_eq!(seen[0].1, source);
        assert_eq!(seen[2].1, target);
    }

    #[tokio::test]
    async fn test_failed_rsync_skips_deletions_and_post_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("git");
        let target = dir.path().join("www");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("keep.txt"), "x").unwrap();

        let cfg = config();
        let runner = Recording::new(Some("rsync"));
        let publisher = TreePublisher::new(&runner, &cfg);
        let mut out = RunOutput::new("r");
        let err = publisher
            .publish(&source, &target, &[target.join("keep.txt")], &mut out)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::CommandFailed { .. }));
        assert!(target.join("keep.txt").exists());
        assert!(!runner.commands().iter().any(|c| c == "php artisan migrate"));
    }
}
