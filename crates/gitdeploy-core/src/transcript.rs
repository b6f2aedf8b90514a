//! Run transcript: every command and narrative note of one invocation.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ChangeSet;
use crate::runner::{CommandOutput, CommandSpec};

/// A recorded command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub cwd: PathBuf,
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub critical: bool,
}

/// One transcript line group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entry {
    Note { text: String },
    Error { text: String },
    Command(CommandRecord),
}

/// Added / modified / deleted counts of the deployed change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub total: usize,
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl From<&ChangeSet> for ChangeSummary {
    fn from(set: &ChangeSet) -> Self {
        Self {
            total: set.total(),
            added: set.added.len(),
            modified: set.modified.len(),
            deleted: set.deleted.len(),
        }
    }
}

/// Ordered record of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<Entry>,
    pub summary: Option<ChangeSummary>,
}

impl RunOutput {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            entries: Vec::new(),
            summary: None,
        }
    }

    pub fn note(&mut self, text: impl Into<String>) {
        self.entries.push(Entry::Note { text: text.into() });
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.entries.push(Entry::Error { text: text.into() });
    }

    pub fn record_command(&mut self, spec: &CommandSpec, result: &CommandOutput) {
        self.entries.push(Entry::Command(CommandRecord {
            command: spec.display(),
            cwd: spec.cwd.clone(),
            output: result.output.clone(),
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            critical: spec.critical,
        }));
    }

    /// Record the change-set counts and note them.
    pub fn set_summary(&mut self, changes: &ChangeSet) {
        let summary = ChangeSummary::from(changes);
        self.note(format!(
            "Deploying {} files:\n  Added      {}\n  Modified   {}\n  Deleted    {}",
            summary.total, summary.added, summary.modified, summary.deleted
        ));
        self.summary = Some(summary);
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandRecord> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Command(record) => Some(record),
            _ => None,
        })
    }

    pub fn command_count(&self) -> usize {
        self.commands().count()
    }

    /// Whether any recorded command line starts with `prefix`.
    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().any(|c| c.command.starts_with(prefix))
    }

    /// Plain-text rendering.
    pub fn render(&self) -> String {
        let mut text = String::new();
        for entry in &self.entries {
            match entry {
                Entry::Note { text: note } => {
                    text.push('\n');
                    text.push_str(note);
                    text.push('\n');
                }
                Entry::Error { text: msg } => {
                    text.push_str("ERR! ");
                    text.push_str(msg);
                    text.push('\n');
                }
                Entry::Command(record) => {
                    text.push_str("\n$ ");
                    text.push_str(&record.command);
                    text.push('\n');
                    let output = record.output.trim();
                    if !output.is_empty() {
                        text.push_str(output);
                        text.push('\n');
                    }
                    if record.exit_code != 0 {
                        text.push_str(&format!(
                            "{}exit code {}\n",
                            if record.critical { "ERR! " } else { "" },
                            record.exit_code
                        ));
                    }
                }
            }
        }
        text
    }
}
