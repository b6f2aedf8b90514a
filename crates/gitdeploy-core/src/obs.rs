//! Structured observability hooks for the deployment lifecycle.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `DeploySpan` RAII guard
//! - Emission functions for lifecycle events: start, stage, finish, lock
//!   contention and denial
//!
//! Events are emitted at `info!` (`warn!` for denials). Tokens never appear;
//! use [`crate::access::token_fingerprint`] when a request must be correlated.

use tracing::{info, warn};

/// RAII guard entering a span tagged with the run id.
///
/// ```ignore
/// let _span = DeploySpan::enter("0b6c…", "main");
/// // every event below carries run_id and branch
/// ```
pub struct DeploySpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploySpan {
    pub fn enter(run_id: &str, branch: &str) -> Self {
        Self {
            _span: Self::span(run_id, branch).entered(),
        }
    }

    /// The span itself, for `Instrument` on futures that cross threads.
    pub fn span(run_id: &str, branch: &str) -> tracing::Span {
        tracing::info_span!("gitdeploy.run", run_id = %run_id, branch = %branch)
    }
}

/// Emit event: deployment started.
pub fn emit_deploy_started(run_id: &str, caller: &str, source_event: &str, token_fp: &str) {
    info!(
        event = "deploy.started",
        run_id = %run_id,
        caller = %caller,
        source_event = %source_event,
        token_fp = %token_fp,
    );
}

/// Emit event: a pipeline stage completed.
pub fn emit_stage(run_id: &str, stage: &str, duration_ms: u64) {
    info!(event = "deploy.stage", run_id = %run_id, stage = %stage, duration_ms = duration_ms);
}

/// Emit event: deployment finished with its outcome and HTTP-equivalent status.
pub fn emit_deploy_finished(run_id: &str, outcome: &str, status: u16, duration_ms: u64) {
    info!(
        event = "deploy.finished",
        run_id = %run_id,
        outcome = %outcome,
        status = status,
        duration_ms = duration_ms,
    );
}

pub fn emit_lock_contended(run_id: &str, holder_run_id: Option<&str>) {
    info!(
        event = "deploy.lock_contended",
        run_id = %run_id,
        holder_run_id = holder_run_id.unwrap_or("unknown"),
    );
}

pub fn emit_denied(run_id: &str, caller: &str, reason: &str) {
    warn!(event = "deploy.denied", run_id = %run_id, caller = %caller, reason = %reason);
}
