//! Deployment configuration.
//!
//! Loaded from a TOML file. Every option has a serde default except the
//! handful that must be set explicitly; [`DeployConfig::validate`] reports all
//! missing or invalid settings at once so an operator can fix them in one pass.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::AllowEntry;
use crate::domain::{DeployError, Result};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "GITDEPLOY_CONFIG";

/// Name of the version marker file at the root of the production directory.
pub const VERSION_FILE: &str = "VERSION";

/// Version-control metadata directory, always excluded from the mirror.
pub const GIT_METADATA_DIR: &str = ".git";

/// Default rsync flags: recursive, links, times, group, owner, devices,
/// compress, verbose, omit directory times.
pub const DEFAULT_RSYNC_FLAGS: &str = "-rltgoDzvO";

/// Full deployment configuration for one repository → target mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Remote repository URL (https or ssh).
    #[serde(default)]
    pub remote_repository: String,

    /// Branches allowed to deploy. The first entry is the default branch and
    /// the only one accepted from provider webhooks.
    #[serde(default)]
    pub branches: Vec<String>,

    /// Shared secret callers must present as `t`. Empty denies every request.
    #[serde(default)]
    pub access_token: String,

    /// Caller IP allow-list: literal addresses or CIDR ranges. Empty disables the check.
    #[serde(default)]
    pub ip_allow: Vec<String>,

    /// Where the repository is cloned.
    #[serde(default)]
    pub git_dir: PathBuf,

    /// Production directory the working tree is mirrored into.
    #[serde(default)]
    pub target_dir: PathBuf,

    /// Wall-clock budget for each individual command.
    #[serde(default = "default_time_limit_secs")]
    pub time_limit_secs: u64,

    /// Append-only transcript log.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Address receiving the transcript by email.
    #[serde(default)]
    pub email_notifications: Option<String>,

    /// sendmail-compatible command reading a full message on stdin.
    #[serde(default = "default_sendmail_command")]
    pub sendmail_command: String,

    /// Mirror exclude patterns. `.git` is always added.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    #[serde(default = "default_rsync_flags")]
    pub rsync_flags: String,

    /// Let the mirror delete target files absent from the source. Off by
    /// default: production-only files would be removed.
    #[serde(default)]
    pub mirror_delete: bool,

    /// Shell commands run in the working tree before the mirror.
    #[serde(default)]
    pub commands_before_rsync: Vec<String>,

    /// Shell commands run in the target directory after the mirror.
    #[serde(default)]
    pub commands_after_rsync: Vec<String>,

    /// Run `git clean -dfx` in the working tree after publishing.
    #[serde(default)]
    pub cleanup_work_tree: bool,

    /// Kill-switch: deny every request.
    #[serde(default)]
    pub disabled: bool,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Take the caller address from the first `X-Forwarded-For` entry.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Success/failure callback extensions.
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
}

/// Registration of a callback extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ExtensionKind,
}

/// Built-in extension implementations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtensionKind {
    /// POST a JSON notification to `url`.
    Http {
        url: String,
        #[serde(default = "default_extension_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_time_limit_secs() -> u64 {
    60
}

fn default_sendmail_command() -> String {
    "sendmail -t".to_string()
}

fn default_exclude() -> Vec<String> {
    vec![GIT_METADATA_DIR.to_string()]
}

fn default_rsync_flags() -> String {
    DEFAULT_RSYNC_FLAGS.to_string()
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("deploy.lock")
}

fn default_extension_timeout_secs() -> u64 {
    10
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            remote_repository: String::new(),
            branches: Vec::new(),
            access_token: String::new(),
            ip_allow: Vec::new(),
            git_dir: PathBuf::new(),
            target_dir: PathBuf::new(),
            time_limit_secs: default_time_limit_secs(),
            log_file: None,
            email_notifications: None,
            sendmail_command: default_sendmail_command(),
            exclude: default_exclude(),
            rsync_flags: default_rsync_flags(),
            mirror_delete: false,
            commands_before_rsync: Vec::new(),
            commands_after_rsync: Vec::new(),
            cleanup_work_tree: false,
            disabled: false,
            lock_file: default_lock_file(),
            trust_forwarded_for: false,
            extensions: Vec::new(),
        }
    }
}

impl DeployConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DeployError::Configuration(vec![e.to_string()]))
    }

    /// Load a TOML file and resolve relative `lock_file` / `log_file` against
    /// the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Configuration(vec![format!(
                "cannot read config file {}: {e}",
                path.display()
            )])
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Anchor relative state paths at `base`.
    pub fn resolve_relative_to(&mut self, base: &Path) {
        if self.lock_file.is_relative() {
            self.lock_file = base.join(&self.lock_file);
        }
        if let Some(log) = self.log_file.as_mut() {
            if log.is_relative() {
                *log = base.join(&*log);
            }
        }
    }

    /// Every configuration problem, or an empty list.
    pub fn problems(&self) -> Vec<String> {
        let mut err = Vec::new();
        if self.access_token.is_empty() {
            err.push("access token is not configured".to_string());
        }
        if self.remote_repository.is_empty() {
            err.push("remote repository is not configured".to_string());
        }
        if self.branches.iter().all(|b| b.trim().is_empty()) {
            err.push("branch is not configured".to_string());
        }
        if self.git_dir.as_os_str().is_empty() {
            err.push("git directory is not configured".to_string());
        }
        if self.target_dir.as_os_str().is_empty() {
            err.push("target directory is not configured".to_string());
        }
        if self.time_limit_secs == 0 {
            err.push("time limit must be at least one second".to_string());
        }
        for entry in &self.ip_allow {
            if let Err(reason) = entry.parse::<AllowEntry>() {
                err.push(format!("invalid ip_allow entry '{entry}': {reason}"));
            }
        }
        for ext in &self.extensions {
            match &ext.kind {
                ExtensionKind::Http { url, .. } => {
                    if !(url.starts_with("http://") || url.starts_with("https://")) {
                        err.push(format!("extension '{}' has an invalid url '{url}'", ext.name));
                    }
                }
            }
        }
        err
    }

    /// Fail with [`DeployError::Configuration`] listing every problem.
    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(DeployError::Configuration(problems))
        }
    }

    /// The default branch (first allow-list entry).
    pub fn default_branch(&self) -> Option<&str> {
        self.branches.first().map(String::as_str)
    }

    pub fn is_branch_allowed(&self, branch: &str) -> bool {
        self.branches.iter().any(|b| b == branch)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    /// Path of the version marker.
    pub fn version_file(&self) -> PathBuf {
        self.target_dir.join(VERSION_FILE)
    }

    /// Exclude patterns with `.git` guaranteed first and no duplicates.
    pub fn mirror_excludes(&self) -> Vec<String> {
        let mut out = vec![GIT_METADATA_DIR.to_string()];
        for pattern in &self.exclude {
            if !pattern.is_empty() && !out.contains(pattern) {
                out.push(pattern.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
remote_repository = "git@example.com:acme/site.git"
branches = ["main", "staging"]
access_token = "s3cret"
ip_allow = ["192.168.0.0/16", "::1"]
git_dir = "/srv/site/git"
target_dir = "/srv/site/public"
commands_after_rsync = ["php artisan migrate"]

[[extensions]]
name = "chatops"
kind = "http"
url = "https://hooks.example.com/deploy"
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let config = DeployConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.default_branch(), Some("main"));
        assert_eq!(config.time_limit_secs, 60);
        assert_eq!(config.rsync_flags, DEFAULT_RSYNC_FLAGS);
        assert_eq!(config.exclude, vec![".git"]);
        assert!(!config.mirror_delete);
        assert_eq!(config.extensions.len(), 1);
        assert_eq!(
            config.extensions[0].kind,
            ExtensionKind::Http {
                url: "https://hooks.example.com/deploy".to_string(),
                timeout_secs: 10
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let config = DeployConfig::default();
        let problems = config.problems();
        assert_eq!(problems.len(), 5, "{problems:?}");
        match config.validate() {
            Err(DeployError::Configuration(list)) => assert_eq!(list, problems),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_ip_allow_entry_is_a_problem() {
        let mut config = DeployConfig::from_toml_str(SAMPLE).unwrap();
        config.ip_allow.push("10.0.0.0/33".to_string());
        let problems = config.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("10.0.0.0/33"));
    }

    #[test]
    fn test_mirror_excludes_always_start_with_git() {
        let mut config = DeployConfig::default();
        config.exclude = vec!["node_modules".to_string(), ".git".to_string()];
        assert_eq!(config.mirror_excludes(), vec![".git", "node_modules"]);
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.toml");
        std::fs::write(&path, format!("log_file = \"deploy.log\"\n{SAMPLE}")).unwrap();

        let config = DeployConfig::load(&path).unwrap();
        assert_eq!(config.lock_file, dir.path().join("deploy.lock"));
        assert_eq!(config.log_file, Some(dir.path().join("deploy.log")));
        assert_eq!(config.version_file(), PathBuf::from("/srv/site/public/VERSION"));
    }
}
