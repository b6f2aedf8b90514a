//! Repository synchronizer.
//!
//! Drives the long-lived local clone through
//! `NoLocalClone → Cloned → BranchFetched → CommitResolved → DiffComputed`
//! and produces the change set between the published commit and the target.
//! The production directory is never touched here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::{DeployConfig, GIT_METADATA_DIR};
use crate::domain::{ChangeSet, CommitSet, DeployError, DeploymentRequest, Result};
use crate::ledger::VersionLedger;
use crate::runner::{execute, CommandRunner, CommandSpec};
use crate::transcript::RunOutput;

/// Object id of git's empty tree. Diffing from it lists every file as added.
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Synchronizer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NoLocalClone,
    Cloned,
    BranchFetched,
    CommitResolved,
    DiffComputed,
}

/// The local clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryState {
    pub local_path: PathBuf,
    pub remote_url: String,
    /// First entry is the default branch.
    pub allowed_branches: Vec<String>,
    pub current_commit: Option<String>,
}

impl RepositoryState {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            local_path: config.git_dir.clone(),
            remote_url: config.remote_repository.clone(),
            allowed_branches: config.branches.clone(),
            current_commit: None,
        }
    }

    /// Whether a clone exists at `local_path`.
    pub fn has_clone(&self) -> bool {
        self.local_path.join(GIT_METADATA_DIR).exists()
    }
}

/// What the synchronizer decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    /// Full id of the commit now checked out.
    pub target: String,
    /// Marker value found in the production directory, if any.
    pub marker: Option<String>,
    /// Commit the change set is measured from.
    pub baseline: String,
    /// True when the marker was missing or stale and the change set covers
    /// the whole tree.
    pub full_tree: bool,
    pub commits: CommitSet,
    pub changes: ChangeSet,
    /// Deleted paths resolved under the production directory.
    pub deletions: Vec<PathBuf>,
}

/// Clone / fetch / resolve / diff state machine.
pub struct RepositorySynchronizer<'a> {
    runner: &'a dyn CommandRunner,
    repo: RepositoryState,
    target_dir: PathBuf,
    time_limit: Duration,
    state: SyncState,
}

impl<'a> RepositorySynchronizer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &DeployConfig) -> Self {
        let repo = RepositoryState::from_config(config);
        let state = if repo.has_clone() {
            SyncState::Cloned
        } else {
            SyncState::NoLocalClone
        };
        Self {
            runner,
            repo,
            target_dir: config.target_dir.clone(),
            time_limit: config.time_limit(),
            state,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn repository(&self) -> &RepositoryState {
        &self.repo
    }

    /// Run every step for `request`.
    pub async fn synchronize(
        &mut self,
        request: &DeploymentRequest,
        ledger: &VersionLedger,
        out: &mut RunOutput,
    ) -> Result<SyncResult> {
        let branch = request.branch();
        self.ensure_clone(branch, out).await?;
        self.fetch_branch(branch, out).await?;
        let (commits, target) = self
            .resolve_commit(branch, request.requested_commit(), out)
            .await?;
        self.compute_diff(commits, target, ledger, out).await
    }

    async fn git(&self, args: &[&str], out: &mut RunOutput) -> Result<String> {
        let spec = CommandSpec::git(args.iter().copied(), &self.repo.local_path);
        Ok(execute(self.runner, &spec, self.time_limit, out)
            .await?
            .output)
    }

    /// `NoLocalClone → Cloned`.
    pub async fn ensure_clone(&mut self, branch: &str, out: &mut RunOutput) -> Result<()> {
        if self.state >= SyncState::Cloned {
            return Ok(());
        }
        out.note("Git directory not found, cloning repository");
        let (parent, dest) = clone_destination(&self.repo.local_path)?;
        let spec = CommandSpec::git(
            [
                "clone".to_string(),
                "--branch".to_string(),
                branch.to_string(),
                self.repo.remote_url.clone(),
                dest.to_string_lossy().into_owned(),
            ],
            parent,
        );
        execute(self.runner, &spec, self.time_limit, out).await?;
        self.state = SyncState::Cloned;
        Ok(())
    }

    /// `Cloned → BranchFetched`. Fetch always precedes checkout.
    pub async fn fetch_branch(&mut self, branch: &str, out: &mut RunOutput) -> Result<()> {
        out.note("Fetching repository from origin");
        self.git(&["fetch", "--tags", "origin", branch], out).await?;
        out.note(format!("Checkout branch {branch}"));
        self.git(&["checkout", branch], out).await?;
        self.state = SyncState::BranchFetched;
        Ok(())
    }

    /// `BranchFetched → CommitResolved`.
    pub async fn resolve_commit(
        &mut self,
        branch: &str,
        requested: Option<&str>,
        out: &mut RunOutput,
    ) -> Result<(CommitSet, String)> {
        let remote_ref = format!("origin/{branch}");
        let spec = CommandSpec::git(
            ["--no-pager", "log", "--pretty=format:%H", remote_ref.as_str()],
            &self.repo.local_path,
        )
        .non_critical();
        let listing = self.runner.run(&spec, self.time_limit).await?;
        let commits = CommitSet::parse(&listing.output);
        let mut shown = listing.clone();
        shown.output = format!("{} commits on {remote_ref}", commits.len());
        out.record_command(&spec, &shown);

        let newest = commits.newest().ok_or_else(|| DeployError::NoCommits {
            branch: branch.to_string(),
        })?;
        let target = match requested.and_then(|c| commits.resolve(c)) {
            Some(found) => found.to_string(),
            None => {
                out.note(format!(
                    "Passed commit hash is blank or doesn't match existing commits. \
                     Assuming most recent commit in branch: {newest}"
                ));
                newest.to_string()
            }
        };

        out.note(format!("Reset branch to commit {target} in git directory"));
        self.git(&["reset", "--hard", target.as_str()], out).await?;
        out.note("Updating git submodules in git directory");
        self.git(&["submodule", "update", "--init", "--recursive"], out)
            .await?;

        self.repo.current_commit = Some(target.clone());
        self.state = SyncState::CommitResolved;
        Ok((commits, target))
    }

    /// `CommitResolved → DiffComputed`.
    pub async fn compute_diff(
        &mut self,
        commits: CommitSet,
        target: String,
        ledger: &VersionLedger,
        out: &mut RunOutput,
    ) -> Result<SyncResult> {
        let marker = ledger.read()?;
        let oldest = commits
            .oldest()
            .map(str::to_string)
            .unwrap_or_else(|| target.clone());

        let (baseline, full_tree) = match marker.as_deref() {
            Some(found) => match commits.resolve(found) {
                Some(known) => {
                    out.note(format!("Current target directory version is {known}"));
                    (known.to_string(), false)
                }
                None => {
                    out.note(format!(
                        "WARNING: version file commit hash doesn't match existing commits, \
                         assuming oldest commit {oldest}"
                    ));
                    (oldest, true)
                }
            },
            None => {
                out.note("No version file found, assuming current version is oldest commit");
                (oldest, true)
            }
        };

        let from = if full_tree { EMPTY_TREE } else { baseline.as_str() };
        out.note(format!(
            "Get list of files added, modified and deleted from {baseline} to {target}"
        ));
        let listing = self
            .git(
                &[
                    "-c",
                    "core.quotepath=off",
                    "--no-pager",
                    "diff",
                    "--name-status",
                    "--no-renames",
                    from,
                    target.as_str(),
                ],
                out,
            )
            .await?;

        let changes = ChangeSet::from_name_status(&listing);
        let (deletions, refused) = changes.deleted_under(&self.target_dir);
        for path in refused {
            out.error(format!("refusing to delete {path}: outside the target directory"));
        }
        out.set_summary(&changes);

        self.state = SyncState::DiffComputed;
        Ok(SyncResult {
            target,
            marker,
            baseline,
            full_tree,
            commits,
            changes,
            deletions,
        })
    }
}

/// Working directory and absolute destination for `git clone`, creating the
/// parent directory.
fn clone_destination(local_path: &Path) -> Result<(PathBuf, PathBuf)> {
    let parent = match local_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let parent = std::fs::canonicalize(&parent)?;
    let dest = match local_path.file_name() {
        Some(name) => parent.join(name),
        None => local_path.to_path_buf(),
    };
    Ok((parent, dest))
}
