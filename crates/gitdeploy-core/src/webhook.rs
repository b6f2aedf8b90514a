//! Webhook interpretation: provider payload → (branch, event).
//!
//! Two providers are recognised by header, first match wins:
//! Bitbucket (`X-Event-Key`) and GitHub (`X-GitHub-Event`). A request with
//! neither header is a manual trigger.

use serde_json::Value;

use crate::config::DeployConfig;
use crate::domain::{DeployError, Result, SourceEvent, TriggerRequest};

/// Bitbucket event header.
pub const HEADER_BITBUCKET_EVENT: &str = "x-event-key";
/// GitHub event header.
pub const HEADER_GITHUB_EVENT: &str = "x-github-event";

/// Source-control provider that sent a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Bitbucket,
    GitHub,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Bitbucket => "Bitbucket",
            Provider::GitHub => "GitHub",
        }
    }
}

/// Result of interpreting a trigger's headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    /// A deployable provider event.
    Webhook {
        provider: Provider,
        branch: String,
        event: SourceEvent,
    },
    /// A provider event this agent does not act on.
    NotApplicable { provider: Provider, reason: String },
    /// No provider headers: manual trigger.
    Manual,
}

/// Interpret a trigger. Malformed payloads of recognised events are errors.
pub fn interpret(trigger: &TriggerRequest) -> Result<Interpretation> {
    if let Some(event) = trigger.header(HEADER_BITBUCKET_EVENT) {
        return interpret_bitbucket(event, &trigger.body);
    }
    if let Some(event) = trigger.header(HEADER_GITHUB_EVENT) {
        return interpret_github(event, &trigger.body);
    }
    Ok(Interpretation::Manual)
}

fn not_applicable(provider: Provider) -> Interpretation {
    Interpretation::NotApplicable {
        provider,
        reason: "only push and merged pull request events are processed".to_string(),
    }
}

fn parse_body(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|e| DeployError::WebhookParse(e.to_string()))
}

/// Walk a JSON pointer and require a non-empty string.
fn string_at(payload: &Value, pointer: &str) -> Result<String> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DeployError::WebhookParse(format!("payload has no string at {pointer}")))
}

fn interpret_bitbucket(event: &str, body: &[u8]) -> Result<Interpretation> {
    let provider = Provider::Bitbucket;
    match event {
        "repo:push" => {
            let payload = parse_body(body)?;
            // A deleted branch has no new head.
            if payload.pointer("/push/changes/0/new") == Some(&Value::Null) {
                return Ok(Interpretation::NotApplicable {
                    provider,
                    reason: "push deletes the branch".to_string(),
                });
            }
            Ok(Interpretation::Webhook {
                provider,
                branch: string_at(&payload, "/push/changes/0/new/name")?,
                event: SourceEvent::ProviderPush,
            })
        }
        "pullrequest:fulfilled" => {
            let payload = parse_body(body)?;
            Ok(Interpretation::Webhook {
                provider,
                branch: string_at(&payload, "/pullrequest/destination/branch/name")?,
                event: SourceEvent::ProviderMergedPr,
            })
        }
        _ => Ok(not_applicable(provider)),
    }
}

fn interpret_github(event: &str, body: &[u8]) -> Result<Interpretation> {
    let provider = Provider::GitHub;
    match event {
        "push" => {
            let payload = parse_body(body)?;
            let git_ref = string_at(&payload, "/ref")?;
            match git_ref.strip_prefix("refs/heads/") {
                Some(branch) if !branch.is_empty() => Ok(Interpretation::Webhook {
                    provider,
                    branch: branch.to_string(),
                    event: SourceEvent::ProviderPush,
                }),
                _ => Ok(Interpretation::NotApplicable {
                    provider,
                    reason: format!("{git_ref} is not a branch"),
                }),
            }
        }
        "pull_request" => {
            let payload = parse_body(body)?;
            let closed = payload.get("action").and_then(Value::as_str) == Some("closed");
            let merged = payload
                .pointer("/pull_request/merged")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if closed && merged {
                Ok(Interpretation::Webhook {
                    provider,
                    branch: string_at(&payload, "/pull_request/head/ref")?,
                    event: SourceEvent::ProviderMergedPr,
                })
            } else {
                Ok(not_applicable(provider))
            }
        }
        _ => Ok(not_applicable(provider)),
    }
}

/// Branch decision after interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchDecision {
    /// Proceed with this branch.
    Deploy { branch: String, event: SourceEvent },
    /// Stop without touching anything.
    Rejected(String),
}

/// Apply the branch policy.
///
/// Webhook branches must be the default branch. Manual triggers may name any
/// allowed branch and otherwise get the default.
pub fn select_branch(
    interpretation: &Interpretation,
    requested: Option<&str>,
    config: &DeployConfig,
) -> BranchDecision {
    let Some(default) = config.default_branch() else {
        return BranchDecision::Rejected("branch is not configured".to_string());
    };
    match interpretation {
        Interpretation::Webhook { branch, event, .. } => {
            if branch == default {
                BranchDecision::Deploy {
                    branch: branch.clone(),
                    event: *event,
                }
            } else {
                BranchDecision::Rejected(format!(
                    "branch {branch} not allowed, stopping execution"
                ))
            }
        }
        Interpretation::Manual => match requested {
            Some(branch) if config.is_branch_allowed(branch) => BranchDecision::Deploy {
                branch: branch.to_string(),
                event: SourceEvent::Manual,
            },
            Some(branch) => {
                BranchDecision::Rejected(format!("branch {branch} not allowed, stopping execution"))
            }
            None => BranchDecision::Deploy {
                branch: default.to_string(),
                event: SourceEvent::Manual,
            },
        },
        Interpretation::NotApplicable { reason, .. } => BranchDecision::Rejected(reason.clone()),
    }
}
