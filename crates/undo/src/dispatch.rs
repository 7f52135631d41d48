//! Two-phase rollback pipeline.
//!
//! Phase 1 visits what the user named: workloads are rolled back on the spot,
//! pointer objects only reserve the identity of the workload they name and queue
//! it. Phase 2 fetches the queued workloads and rolls them back. One [`DedupSet`]
//! spans both phases, so a workload reached both ways is attempted once.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use rewind_core::{
    AggregateError, CanonicalIdentity, DedupSet, DryRunMode, ResolveRequest, ResourceHandle, RevisionSelector, UndoError,
    WorkloadRef,
};
use tracing::{debug, info};

use crate::resolve::{classify, Classified};
use crate::{DryRunVerifier, Fetched, Printer, ResourceSource, StrategyRegistry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndoOptions {
    pub revision: RevisionSelector,
    pub dry_run: DryRunMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Strategy ran; carries its description.
    RolledBack(String),
    /// Pointer object; carries the `Kind.version.group/name` it references.
    Referenced(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub identity: CanonicalIdentity,
    pub outcome: Outcome,
}

/// Everything one invocation produced.
#[derive(Debug, Default)]
pub struct UndoReport {
    pub outcomes: Vec<RollbackOutcome>,
    /// Workloads discovered through pointers, in discovery order.
    pub discovered: Vec<WorkloadRef>,
    pub direct_errors: Vec<UndoError>,
    pub indirect_errors: Vec<UndoError>,
}

impl UndoReport {
    pub fn is_success(&self) -> bool {
        self.direct_errors.is_empty() && self.indirect_errors.is_empty()
    }

    pub fn rolled_back(&self) -> impl Iterator<Item = &RollbackOutcome> {
        self.outcomes.iter().filter(|o| matches!(o.outcome, Outcome::RolledBack(_)))
    }

    pub fn errors(&self) -> impl Iterator<Item = &UndoError> {
        self.direct_errors.iter().chain(self.indirect_errors.iter())
    }

    pub fn into_result(self) -> Result<Vec<RollbackOutcome>, AggregateError> {
        match AggregateError::from_phases(self.direct_errors, self.indirect_errors) {
            Some(agg) => Err(agg),
            None => Ok(self.outcomes),
        }
    }
}

/// Orchestrates one `rollout undo` invocation.
pub struct Dispatcher {
    source: Arc<dyn ResourceSource>,
    strategies: Arc<StrategyRegistry>,
    verifier: Arc<dyn DryRunVerifier>,
    options: UndoOptions,
}

/// State of a single run, dropped when it ends.
struct Run<'p> {
    seen: DedupSet,
    printer: &'p mut dyn Printer,
    report: UndoReport,
}

impl Run<'_> {
    fn print(&mut self, handle: &ResourceHandle, description: &str) -> Result<(), UndoError> {
        self.printer
            .print(handle, description)
            .map_err(|e| UndoError::Print { target: handle.display_name(), source: e.into() })
    }
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn ResourceSource>,
        strategies: Arc<StrategyRegistry>,
        verifier: Arc<dyn DryRunVerifier>,
        options: UndoOptions,
    ) -> Self {
        Self { source, strategies, verifier, options }
    }

    /// Run both phases. Only a failure to resolve the initial request is
    /// returned as `Err`; everything else lands in the report.
    pub async fn run(&self, request: &ResolveRequest, printer: &mut dyn Printer) -> Result<UndoReport, UndoError> {
        let mut run = Run { seen: DedupSet::new(), printer, report: UndoReport::default() };
        let pending = self.resolve_direct(request, &mut run).await?;
        if pending.is_empty() {
            debug!("no pointer objects visited; skipping second phase");
        } else {
            self.resolve_indirect(request, pending, &mut run).await;
        }
        Ok(run.report)
    }

    async fn resolve_direct(&self, request: &ResolveRequest, run: &mut Run<'_>) -> Result<Vec<WorkloadRef>, UndoError> {
        let items = self.source.resolve(request).await?;
        debug!(count = items.len(), "phase 1: visiting resolved objects");
        let mut pending = Vec::new();
        for item in items {
            if let Err(e) = self.visit_direct(item, &mut pending, run).await {
                record_error(&e);
                run.report.direct_errors.push(e);
            }
        }
        run.report.discovered = pending.clone();
        Ok(pending)
    }

    async fn visit_direct(&self, item: Fetched, pending: &mut Vec<WorkloadRef>, run: &mut Run<'_>) -> Result<(), UndoError> {
        let handle = item?;
        match classify(&handle)? {
            Classified::Pointer(target) => {
                let identity = target.identity();
                if !run.seen.observe(&identity) {
                    return Err(duplicate(identity));
                }
                let referenced = target.qualified_name();
                info!(pointer = %handle.display_name(), workload = %referenced, "pointer resolved");
                // A pointer whose line could not be printed queues nothing.
                run.print(&handle, &format!("references to {referenced}"))?;
                pending.push(target);
                run.report.outcomes.push(RollbackOutcome { identity, outcome: Outcome::Referenced(referenced) });
                Ok(())
            }
            Classified::Workload(identity) => {
                if !run.seen.observe(&identity) {
                    return Err(duplicate(identity));
                }
                self.roll_back(&handle, identity, run).await
            }
        }
    }

    async fn resolve_indirect(&self, request: &ResolveRequest, pending: Vec<WorkloadRef>, run: &mut Run<'_>) {
        debug!(count = pending.len(), "phase 2: resolving referenced workloads");
        let follow_up = request.for_workloads(pending);
        let items = match self.source.resolve(&follow_up).await {
            Ok(items) => items,
            Err(e) => {
                record_error(&e);
                run.report.indirect_errors.push(e);
                return;
            }
        };
        // Identities were reserved when the pointers were visited.
        for item in items {
            let res = match item {
                Ok(handle) => {
                    let identity = handle.identity();
                    self.roll_back(&handle, identity, run).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                record_error(&e);
                run.report.indirect_errors.push(e);
            }
        }
    }

    /// Runs the strategy and records its outcome. The outcome is recorded
    /// before printing, so a printer failure never hides an applied rollback.
    async fn roll_back(&self, handle: &ResourceHandle, identity: CanonicalIdentity, run: &mut Run<'_>) -> Result<(), UndoError> {
        let strategy = self.strategies.strategy_for(&handle.gvk.group, &handle.gvk.kind)?;
        if self.options.dry_run == DryRunMode::Server {
            self.verifier
                .has_support(&handle.gvk)
                .await
                .map_err(|e| UndoError::DryRunUnsupported { gvk: handle.gvk.clone(), source: e.into() })?;
        }

        counter!("undo_attempts_total", 1u64, "kind" => handle.gvk.kind.clone());
        let t0 = Instant::now();
        let description = strategy
            .rollback(handle, self.options.revision, self.options.dry_run)
            .await
            .map_err(|e| UndoError::StrategyExecution { identity: identity.clone(), source: e.into() })?;
        histogram!("undo_strategy_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("undo_rolled_back_total", 1u64, "kind" => handle.gvk.kind.clone());
        info!(target_id = %identity, revision = self.options.revision.number(), dry_run = ?self.options.dry_run, result = %description, "rollback finished");

        run.report.outcomes.push(RollbackOutcome { identity, outcome: Outcome::RolledBack(description.clone()) });
        run.print(handle, &description)
    }
}

fn duplicate(identity: CanonicalIdentity) -> UndoError {
    counter!("undo_duplicates_total", 1u64);
    UndoError::DuplicateTarget { identity }
}

fn record_error(e: &UndoError) {
    counter!("undo_errors_total", 1u64, "op" => e.operation());
    debug!(op = e.operation(), error = %e.report(), "undo item failed");
}
