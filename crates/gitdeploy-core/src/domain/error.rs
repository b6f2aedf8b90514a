//! Domain-level error taxonomy for deployments.

/// Coarse classification of a [`DeployError`], used to pick the caller-facing
/// status and decide whether a run counts as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid setting. Detected before the lock is taken.
    Configuration,
    /// Bad token, IP not allowed, or deployments disabled. Detected before the lock.
    Authorization,
    /// Another deployment holds the run lock. Graceful no-op.
    Concurrency,
    /// A required external tool is absent.
    Environment,
    /// A critical command failed or timed out.
    Command,
    /// Malformed webhook payload. Graceful no-op.
    WebhookParse,
}

/// Deployment errors.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("configuration error: {}", .0.join("; "))]
    Configuration(Vec<String>),

    #[error("access denied: {0}")]
    Authorization(String),

    #[error("deployment already in progress (lock held at {0})")]
    AlreadyRunning(String),

    #[error("{tool} not available; it needs to be installed on the server")]
    Environment { tool: String },

    #[error("command `{command}` exited with code {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },

    /// `partial_output` holds whatever the command printed before it was killed.
    #[error("command `{command}` timed out after {limit_secs} seconds")]
    Timeout {
        command: String,
        limit_secs: u64,
        partial_output: String,
    },

    #[error("no commits found on origin/{branch}")]
    NoCommits { branch: String },

    #[error("invalid webhook payload: {0}")]
    WebhookParse(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Configuration(_) => ErrorKind::Configuration,
            DeployError::Authorization(_) => ErrorKind::Authorization,
            DeployError::AlreadyRunning(_) => ErrorKind::Concurrency,
            DeployError::Environment { .. } => ErrorKind::Environment,
            DeployError::WebhookParse(_) => ErrorKind::WebhookParse,
            DeployError::CommandFailed { .. }
            | DeployError::Timeout { .. }
            | DeployError::NoCommits { .. }
            | DeployError::Serialization(_)
            | DeployError::Io(_) => ErrorKind::Command,
        }
    }

    /// HTTP-equivalent status code for the caller.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Configuration | ErrorKind::Authorization => 403,
            ErrorKind::Concurrency => 409,
            ErrorKind::WebhookParse => 400,
            ErrorKind::Environment | ErrorKind::Command => 500,
        }
    }

    /// Whether the run aborted mid-pipeline (as opposed to a graceful refusal).
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Environment | ErrorKind::Command)
    }
}

/// Result type for deployment operations.
pub type Result<T> = std::result::Result<T, DeployError>;
