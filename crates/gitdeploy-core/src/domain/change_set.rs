//! Commit lists and name-status change classification.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Shortest abbreviated commit id accepted as a prefix match.
pub const MIN_ABBREV_LEN: usize = 4;

/// Commit ids reachable from a branch, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSet {
    commits: Vec<String>,
}

impl CommitSet {
    pub fn new(commits: Vec<String>) -> Self {
        Self { commits }
    }

    /// Parse `git log --pretty=format:%H` output.
    pub fn parse(log_output: &str) -> Self {
        let commits = log_output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && line.chars().all(|c| c.is_ascii_hexdigit()))
            .map(str::to_string)
            .collect();
        Self { commits }
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn newest(&self) -> Option<&str> {
        self.commits.first().map(String::as_str)
    }

    pub fn oldest(&self) -> Option<&str> {
        self.commits.last().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commits.iter().map(String::as_str)
    }

    /// Resolve `id` to a full commit in this set.
    ///
    /// Accepts an exact id or an unambiguous prefix of at least
    /// [`MIN_ABBREV_LEN`] characters. Ambiguous prefixes resolve to `None`.
    pub fn resolve(&self, id: &str) -> Option<&str> {
        let id = id.trim().to_ascii_lowercase();
        if id.len() < MIN_ABBREV_LEN {
            return None;
        }
        if let Some(exact) = self.iter().find(|c| *c == id) {
            return Some(exact);
        }
        let mut matches = self.iter().filter(|c| c.starts_with(id.as_str()));
        match (matches.next(), matches.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}

/// Added, modified and deleted paths between two commits.
///
/// Every path appears in at most one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    /// Classify `git diff --name-status` output.
    ///
    /// Only `A`, `M` and `D` lines are kept; any other status letter
    /// (renames, copies, type changes) is ignored.
    pub fn from_name_status(output: &str) -> Self {
        let mut set = ChangeSet::default();
        let mut seen: HashSet<&str> = HashSet::new();
        for line in output.lines() {
            let mut parts = line.splitn(2, '\t');
            let (Some(status), Some(path)) = (parts.next(), parts.next()) else {
                continue;
            };
            let path = path.trim();
            if path.is_empty() {
                continue;
            }
            let list = match status.trim() {
                "A" => &mut set.added,
                "M" => &mut set.modified,
                "D" => &mut set.deleted,
                _ => continue,
            };
            if seen.insert(path) {
                list.push(path.to_string());
            }
        }
        set
    }

    pub fn contains(&self, path: &str) -> bool {
        self.added.iter().any(|p| p == path)
            || self.modified.iter().any(|p| p == path)
            || self.deleted.iter().any(|p| p == path)
    }

    /// Number of classified paths.
    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Deleted paths resolved under `target_dir`.
    ///
    /// Returns the resolved paths and the entries refused because they are
    /// absolute or climb out of the target with `..`.
    pub fn deleted_under(&self, target_dir: &Path) -> (Vec<PathBuf>, Vec<String>) {
        let mut resolved = Vec::new();
        let mut refused = Vec::new();
        for path in &self.deleted {
            if is_contained(Path::new(path)) {
                resolved.push(target_dir.join(path));
            } else {
                refused.push(path.clone());
            }
        }
        (resolved, refused)
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
