//! Inbound triggers and the deployment request derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What caused a deployment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceEvent {
    /// Manual trigger (query parameters or CLI).
    Manual,
    /// Provider push notification.
    ProviderPush,
    /// Provider merged pull request notification.
    ProviderMergedPr,
}

impl SourceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceEvent::Manual => "manual",
            SourceEvent::ProviderPush => "push",
            SourceEvent::ProviderMergedPr => "merged_pull_request",
        }
    }
}

/// Raw trigger as received, before authorization and webhook interpretation.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    /// Peer address of the caller, as text.
    pub caller_address: String,
    /// Access token (`t`).
    pub token: Option<String>,
    /// Requested branch (`b`).
    pub branch: Option<String>,
    /// Requested commit (`c`).
    pub commit: Option<String>,
    /// Request headers with lower-cased names.
    pub headers: BTreeMap<String, String>,
    /// Raw request body.
    pub body: Vec<u8>,
}

impl TriggerRequest {
    /// A manual trigger with no provider headers and an empty body.
    pub fn manual(caller_address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            caller_address: caller_address.into(),
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into()).filter(|b: &String| !b.is_empty());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into()).filter(|c: &String| !c.is_empty());
        self
    }

    /// Add a header; the name is stored lower-cased.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Supplied token, or empty when absent.
    pub fn supplied_token(&self) -> &str {
        self.token.as_deref().unwrap_or("")
    }
}

/// A validated deployment request. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRequest {
    branch: String,
    requested_commit: Option<String>,
    source_event: SourceEvent,
    caller_address: String,
    supplied_token: String,
}

impl DeploymentRequest {
    pub fn new(
        branch: impl Into<String>,
        requested_commit: Option<String>,
        source_event: SourceEvent,
        caller_address: impl Into<String>,
        supplied_token: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            requested_commit: requested_commit.filter(|c| !c.is_empty()),
            source_event,
            caller_address: caller_address.into(),
            supplied_token: supplied_token.into(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn requested_commit(&self) -> Option<&str> {
        self.requested_commit.as_deref()
    }

    pub fn source_event(&self) -> SourceEvent {
        self.source_event
    }

    pub fn caller_address(&self) -> &str {
        &self.caller_address
    }

    pub fn supplied_token(&self) -> &str {
        &self.supplied_token
    }
}
