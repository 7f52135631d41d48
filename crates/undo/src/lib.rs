//! Rewind undo engine.
//!
//! Resolves user-supplied references into workloads, rejects repeated targets,
//! follows pointer objects to the workloads they name and dispatches each
//! rollback through a per-kind [`RollbackStrategy`].
//!
//! Cluster access, printing and the strategies themselves are injected through
//! the traits below so the pipeline can run against in-memory fakes.

#![forbid(unsafe_code)]

use anyhow::Result;
use rewind_core::{DryRunMode, Gvk, ResolveRequest, ResourceHandle, RevisionSelector, UndoError};

pub mod dispatch;
pub mod resolve;
pub mod strategy;

pub use dispatch::{Dispatcher, Outcome, RollbackOutcome, UndoOptions, UndoReport};
pub use resolve::{classify, Classified, ROLLOUT_GROUP, ROLLOUT_KIND};
pub use strategy::StrategyRegistry;

/// One fetched object, or the per-item error raised while fetching it.
pub type Fetched = Result<ResourceHandle, UndoError>;

/// Turns a request into live objects.
///
/// An `Err` means the request could not be resolved at all (unknown type, bad
/// manifest, unreachable cluster) and is fatal for the phase. Failures for single
/// objects are returned inline so the caller can continue with the rest.
#[async_trait::async_trait]
pub trait ResourceSource: Send + Sync {
    async fn resolve(&self, request: &ResolveRequest) -> Result<Vec<Fetched>, UndoError>;
}

/// Confirms the server accepts dry-run mutations for a kind.
#[async_trait::async_trait]
pub trait DryRunVerifier: Send + Sync {
    async fn has_support(&self, gvk: &Gvk) -> Result<()>;
}

/// Rolls one workload kind back to an earlier revision.
#[async_trait::async_trait]
pub trait RollbackStrategy: Send + Sync {
    /// Returns a human readable description of what happened, e.g. `rolled back`.
    async fn rollback(&self, target: &ResourceHandle, revision: RevisionSelector, dry_run: DryRunMode) -> Result<String>;
}

/// Receives one line per outcome, in the order outcomes are produced.
pub trait Printer: Send {
    fn print(&mut self, target: &ResourceHandle, description: &str) -> Result<()>;
}
