//! Domain models for deployments.
//!
//! - `TriggerRequest` / `DeploymentRequest`: what was asked for
//! - `CommitSet` / `ChangeSet`: what the repository says changed
//! - `DeployError`: the error taxonomy shared by every stage

pub mod change_set;
pub mod error;
pub mod request;

pub use change_set::{ChangeSet, CommitSet};
pub use error::{DeployError, ErrorKind, Result};
pub use request::{DeploymentRequest, SourceEvent, TriggerRequest};
