//! gitdeploy core library
//!
//! Webhook-triggered deployment of a git repository into a production
//! directory: access guard, webhook interpretation, single-flight run lock,
//! repository synchronization, rsync publishing, version marker and
//! reporting. The binaries in `gitdeploy-cli` and `gitdeployd` are thin
//! shells around [`Deployer`].

pub mod access;
pub mod config;
pub mod domain;
pub mod ledger;
pub mod lock;
pub mod notify;
pub mod obs;
pub mod pipeline;
pub mod publish;
pub mod runner;
pub mod sync;
pub mod telemetry;
pub mod transcript;
pub mod webhook;

pub use access::{authorize, ip_allowed, token_fingerprint, token_matches, AccessDecision, AllowEntry};
pub use config::{DeployConfig, ExtensionConfig, ExtensionKind, CONFIG_ENV, VERSION_FILE};
pub use domain::{
    ChangeSet, CommitSet, DeployError, DeploymentRequest, ErrorKind, Result, SourceEvent,
    TriggerRequest,
};
pub use ledger::VersionLedger;
pub use lock::{LockAttempt, LockHolder, RunLock, RunLockGuard};
pub use notify::{
    DeployExtension, EmailSink, ExtensionRegistry, HttpExtension, LogFileSink, NotificationSink,
    Notice, Notifier, ReportHeader, SuccessMetadata,
};
pub use pipeline::{DeployReport, Deployer, Outcome, REQUIRED_TOOLS};
pub use publish::{PublishReport, TreePublisher};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use sync::{RepositoryState, RepositorySynchronizer, SyncResult, SyncState, EMPTY_TREE};
pub use telemetry::init_tracing;
pub use transcript::{ChangeSummary, RunOutput};
pub use webhook::{interpret, select_branch, BranchDecision, Interpretation, Provider};
