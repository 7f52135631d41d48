#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use rewind_core::{
    parse_resource_args, CanonicalIdentity, DryRunMode, Gvk, ResolveRequest, ResourceArg, ResourceHandle, RevisionSelector,
    UndoError,
};
use rewind_undo::{
    DryRunVerifier, Dispatcher, Fetched, Outcome, Printer, ResourceSource, RollbackStrategy, StrategyRegistry, UndoOptions,
    ROLLOUT_GROUP, ROLLOUT_KIND,
};
use serde_json::json;

const NS: &str = "default";

fn deployment(name: &str) -> ResourceHandle {
    ResourceHandle::new(Gvk::new("apps", "v1", "Deployment"), Some(NS.into()), name, json!({"metadata": {"name": name}}))
}

fn cloneset(name: &str) -> ResourceHandle {
    ResourceHandle::new(Gvk::new("apps.kruise.io", "v1alpha1", "CloneSet"), Some(NS.into()), name, json!({"metadata": {"name": name}}))
}

fn rollout(name: &str, api_version: &str, kind: &str, target: &str) -> ResourceHandle {
    ResourceHandle::new(
        Gvk::new(ROLLOUT_GROUP, "v1alpha1", ROLLOUT_KIND),
        Some(NS.into()),
        name,
        json!({"spec": {"objectRef": {"workloadRef": {"apiVersion": api_version, "kind": kind, "name": target}}}}),
    )
}

/// In-memory cluster: `TYPE/NAME` matches the lowercase kind, workload refs match exactly.
#[derive(Default)]
struct FakeCluster {
    objects: Vec<ResourceHandle>,
    requests: Mutex<Vec<ResolveRequest>>,
    fail_follow_up: bool,
}

impl FakeCluster {
    fn with(objects: Vec<ResourceHandle>) -> Arc<Self> {
        Arc::new(Self { objects, ..Default::default() })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ResourceSource for FakeCluster {
    async fn resolve(&self, request: &ResolveRequest) -> Result<Vec<Fetched>, UndoError> {
        let follow_up = !self.requests.lock().unwrap().is_empty();
        self.requests.lock().unwrap().push(request.clone());
        if follow_up && self.fail_follow_up {
            return Err(UndoError::resolution("cluster unreachable"));
        }
        let mut out = Vec::new();
        for arg in &request.args {
            let found = match arg {
                ResourceArg::Typed { resource, name } => self
                    .objects
                    .iter()
                    .find(|h| &h.gvk.kind.to_lowercase() == resource && Some(&h.name) == name.as_ref()),
                ResourceArg::Workload(r) => self.objects.iter().find(|h| h.gvk == r.gvk && h.name == r.name && h.namespace == r.namespace),
            };
            out.push(match found {
                Some(h) => Ok(h.clone()),
                None => Err(UndoError::Fetch { target: format!("{arg:?}"), source: "not found".into() }),
            });
        }
        Ok(out)
    }
}

#[derive(Default)]
struct FakeStrategy {
    calls: Mutex<Vec<(CanonicalIdentity, RevisionSelector, DryRunMode)>>,
    fail_for: Option<&'static str>,
}

impl FakeStrategy {
    fn attempts(&self) -> Vec<CanonicalIdentity> {
        self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
    }
}

#[async_trait::async_trait]
impl RollbackStrategy for FakeStrategy {
    async fn rollback(&self, target: &ResourceHandle, revision: RevisionSelector, dry_run: DryRunMode) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push((target.identity(), revision, dry_run));
        if self.fail_for == Some(target.name.as_str()) {
            anyhow::bail!("no rollout history found for {}", target.name);
        }
        Ok("rolled back".to_string())
    }
}

struct FakeVerifier {
    supported: bool,
}

#[async_trait::async_trait]
impl DryRunVerifier for FakeVerifier {
    async fn has_support(&self, gvk: &Gvk) -> anyhow::Result<()> {
        if self.supported { Ok(()) } else { anyhow::bail!("{gvk} does not support dry-run") }
    }
}

#[derive(Default)]
struct Lines(Vec<String>);

impl Printer for Lines {
    fn print(&mut self, target: &ResourceHandle, description: &str) -> anyhow::Result<()> {
        self.0.push(format!("{} {}", target.display_name(), description));
        Ok(())
    }
}

/// Printer whose output stream is gone.
struct ClosedPipe;

impl Printer for ClosedPipe {
    fn print(&mut self, _target: &ResourceHandle, _description: &str) -> anyhow::Result<()> {
        anyhow::bail!("broken pipe")
    }
}

struct Harness {
    cluster: Arc<FakeCluster>,
    strategy: Arc<FakeStrategy>,
    dispatcher: Dispatcher,
}

fn harness(cluster: Arc<FakeCluster>, strategy: FakeStrategy, supported: bool, options: UndoOptions) -> Harness {
    let strategy = Arc::new(strategy);
    let mut registry = StrategyRegistry::new();
    registry
        .register("apps", "Deployment", strategy.clone())
        .register("apps.kruise.io", "CloneSet", strategy.clone());
    let dispatcher = Dispatcher::new(cluster.clone(), Arc::new(registry), Arc::new(FakeVerifier { supported }), options);
    Harness { cluster, strategy, dispatcher }
}

fn request(args: &[&str]) -> ResolveRequest {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    ResolveRequest { namespace: NS.into(), args: parse_resource_args(&args).unwrap(), ..Default::default() }
}

#[tokio::test]
async fn pointer_is_followed_to_its_workload() {
    let h = harness(
        FakeCluster::with(vec![rollout("abc", "apps.kruise.io/v1alpha1", "CloneSet", "abc"), cloneset("abc")]),
        FakeStrategy::default(),
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["rollout/abc"]), &mut out).await.unwrap();

    assert_eq!(
        out.0,
        vec![
            "rollout.rollouts.kruise.io/abc references to CloneSet.v1alpha1.apps.kruise.io/abc".to_string(),
            "cloneset.apps.kruise.io/abc rolled back".to_string(),
        ]
    );
    assert_eq!(report.discovered.len(), 1);
    assert_eq!(h.strategy.attempts(), vec![cloneset("abc").identity()]);
    assert_eq!(h.cluster.calls(), 2);
    assert!(report.is_success());
    assert!(report.into_result().is_ok());
}

#[tokio::test]
async fn first_phase_only_references_pointer_targets() {
    let cluster = Arc::new(FakeCluster {
        objects: vec![rollout("ro", "apps.kruise.io/v1alpha1", "CloneSet", "web"), cloneset("web")],
        fail_follow_up: true,
        ..Default::default()
    });
    let h = harness(cluster, FakeStrategy::default(), true, UndoOptions::default());
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["rollout/ro"]), &mut out).await.unwrap();

    // Phase 2 could not resolve, so nothing was attempted at all.
    assert!(h.strategy.attempts().is_empty());
    assert_eq!(report.outcomes.len(), 1);
    assert!(matches!(&report.outcomes[0].outcome, Outcome::Referenced(t) if t == "CloneSet.v1alpha1.apps.kruise.io/web"));
    assert!(report.direct_errors.is_empty());
    assert_eq!(report.indirect_errors.len(), 1);
    assert!(matches!(report.indirect_errors[0], UndoError::Resolution(_)));
}

#[tokio::test]
async fn repeated_direct_target_is_rolled_back_once() {
    let h = harness(FakeCluster::with(vec![deployment("abc")]), FakeStrategy::default(), true, UndoOptions::default());
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["deployment/abc", "deployment/abc"]), &mut out).await.unwrap();

    assert_eq!(out.0, vec!["deployment.apps/abc rolled back".to_string()]);
    assert_eq!(h.strategy.attempts().len(), 1);
    assert_eq!(report.direct_errors.len(), 1);
    assert!(matches!(report.direct_errors[0], UndoError::DuplicateTarget { .. }));
    let agg = report.into_result().unwrap_err();
    assert_eq!(agg.len(), 1);
}

#[tokio::test]
async fn target_named_directly_and_through_pointers_is_rolled_back_once() {
    let h = harness(
        FakeCluster::with(vec![
            rollout("r1", "apps.kruise.io/v1alpha1", "CloneSet", "abc"),
            rollout("r2", "apps.kruise.io/v1alpha1", "CloneSet", "abc"),
            cloneset("abc"),
        ]),
        FakeStrategy::default(),
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h
        .dispatcher
        .run(&request(&["rollout/r1", "cloneset/abc", "rollout/r2", "cloneset/abc"]), &mut out)
        .await
        .unwrap();

    // One attempt, three duplicates (N = 4).
    assert_eq!(h.strategy.attempts(), vec![cloneset("abc").identity()]);
    let dups = report.errors().filter(|e| matches!(e, UndoError::DuplicateTarget { .. })).count();
    assert_eq!(dups, 3);
    assert_eq!(report.rolled_back().count(), 1);
}

#[tokio::test]
async fn workload_named_first_rejects_later_pointer() {
    let h = harness(
        FakeCluster::with(vec![cloneset("abc"), rollout("r", "apps.kruise.io/v1alpha1", "CloneSet", "abc")]),
        FakeStrategy::default(),
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["cloneset/abc", "rollout/r"]), &mut out).await.unwrap();

    assert_eq!(h.strategy.attempts().len(), 1);
    assert_eq!(report.direct_errors.len(), 1);
    // The duplicate pointer queues nothing, so no second phase.
    assert!(report.discovered.is_empty());
    assert_eq!(h.cluster.calls(), 1);
}

#[tokio::test]
async fn second_phase_is_skipped_without_pointers() {
    let h = harness(
        FakeCluster::with(vec![deployment("a"), deployment("b")]),
        FakeStrategy::default(),
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["deployment", "a", "b"]), &mut out).await.unwrap();

    assert_eq!(h.cluster.calls(), 1);
    assert_eq!(h.strategy.attempts().len(), 2);
    assert!(report.discovered.is_empty());
    assert!(report.is_success());
}

#[tokio::test]
async fn unset_revision_reaches_strategy_as_previous() {
    let h = harness(FakeCluster::with(vec![deployment("abc")]), FakeStrategy::default(), true, UndoOptions::default());
    let mut out = Lines::default();
    h.dispatcher.run(&request(&["deployment/abc"]), &mut out).await.unwrap();

    let calls = h.strategy.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, RevisionSelector::Previous);
    assert_eq!(calls[0].1.number(), 0);
}

#[tokio::test]
async fn explicit_revision_and_dry_run_are_forwarded() {
    let options = UndoOptions { revision: RevisionSelector::Exact(3), dry_run: DryRunMode::Server };
    let h = harness(FakeCluster::with(vec![deployment("abc")]), FakeStrategy::default(), true, options);
    let mut out = Lines::default();
    h.dispatcher.run(&request(&["deployment/abc"]), &mut out).await.unwrap();

    let calls = h.strategy.calls.lock().unwrap();
    assert_eq!(calls[0].1, RevisionSelector::Exact(3));
    assert_eq!(calls[0].2, DryRunMode::Server);
}

#[tokio::test]
async fn unsupported_server_dry_run_blocks_the_strategy() {
    let options = UndoOptions { dry_run: DryRunMode::Server, ..Default::default() };
    let h = harness(FakeCluster::with(vec![deployment("abc")]), FakeStrategy::default(), false, options);
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["deployment/abc"]), &mut out).await.unwrap();

    assert!(h.strategy.attempts().is_empty());
    assert!(out.0.is_empty());
    assert!(matches!(report.direct_errors.as_slice(), [UndoError::DryRunUnsupported { .. }]));
}

#[tokio::test]
async fn client_dry_run_skips_the_verifier() {
    let options = UndoOptions { dry_run: DryRunMode::Client, ..Default::default() };
    let h = harness(FakeCluster::with(vec![deployment("abc")]), FakeStrategy::default(), false, options);
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["deployment/abc"]), &mut out).await.unwrap();

    assert_eq!(h.strategy.attempts().len(), 1);
    assert!(report.is_success());
}

#[tokio::test]
async fn failures_do_not_stop_the_batch() {
    let strategy = FakeStrategy { fail_for: Some("bad"), ..Default::default() };
    let mut cm = deployment("cm");
    cm.gvk = Gvk::new("", "v1", "ConfigMap");
    let h = harness(
        FakeCluster::with(vec![deployment("bad"), cm, deployment("good"), rollout("broken", "a/b/c", "Deployment", "x")]),
        strategy,
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h
        .dispatcher
        .run(&request(&["deployment/bad", "configmap/cm", "deployment/missing", "rollout/broken", "deployment/good"]), &mut out)
        .await
        .unwrap();

    assert_eq!(out.0, vec!["deployment.apps/good rolled back".to_string()]);
    let ops: Vec<&str> = report.direct_errors.iter().map(|e| e.operation()).collect();
    assert_eq!(ops, vec!["strategy", "no_strategy", "fetch", "invalid_reference"]);
    assert!(report.indirect_errors.is_empty());
}

#[tokio::test]
async fn malformed_pointer_is_reported() {
    let broken = ResourceHandle::new(Gvk::new(ROLLOUT_GROUP, "v1alpha1", ROLLOUT_KIND), Some(NS.into()), "r", json!({"spec": {}}));
    let h = harness(FakeCluster::with(vec![broken]), FakeStrategy::default(), true, UndoOptions::default());
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["rollout/r"]), &mut out).await.unwrap();

    assert!(matches!(report.direct_errors.as_slice(), [UndoError::MalformedPointer { .. }]));
    assert_eq!(h.cluster.calls(), 1);
}

#[tokio::test]
async fn pointer_targets_keep_discovery_order() {
    let h = harness(
        FakeCluster::with(vec![
            rollout("r2", "apps/v1", "Deployment", "second"),
            rollout("r1", "apps/v1", "Deployment", "first"),
            deployment("first"),
            deployment("second"),
        ]),
        FakeStrategy::default(),
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["rollout/r2", "rollout/r1"]), &mut out).await.unwrap();

    let names: Vec<&str> = report.discovered.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["second", "first"]);
    assert_eq!(h.strategy.attempts(), vec![deployment("second").identity(), deployment("first").identity()]);
}

#[tokio::test]
async fn resolution_failure_of_the_request_is_fatal() {
    struct Broken;

    #[async_trait::async_trait]
    impl ResourceSource for Broken {
        async fn resolve(&self, _r: &ResolveRequest) -> Result<Vec<Fetched>, UndoError> {
            Err(UndoError::resolution("the server doesn't have a resource type \"widgets\""))
        }
    }

    let strategy = Arc::new(FakeStrategy::default());
    let mut registry = StrategyRegistry::new();
    registry.register("apps", "Deployment", strategy.clone());
    let dispatcher = Dispatcher::new(Arc::new(Broken), Arc::new(registry), Arc::new(FakeVerifier { supported: true }), UndoOptions::default());
    let mut out = Lines::default();
    let err = dispatcher.run(&request(&["widgets/x"]), &mut out).await.unwrap_err();

    assert!(matches!(err, UndoError::Resolution(_)));
    assert!(strategy.attempts().is_empty());
}

#[tokio::test]
async fn applied_rollback_is_recorded_when_printing_fails() {
    let h = harness(FakeCluster::with(vec![deployment("abc")]), FakeStrategy::default(), true, UndoOptions::default());
    let report = h.dispatcher.run(&request(&["deployment/abc"]), &mut ClosedPipe).await.unwrap();

    assert_eq!(h.strategy.attempts().len(), 1);
    assert_eq!(report.rolled_back().count(), 1);
    assert!(matches!(&report.outcomes[0].outcome, Outcome::RolledBack(d) if d == "rolled back"));
    let ops: Vec<&str> = report.direct_errors.iter().map(|e| e.operation()).collect();
    assert_eq!(ops, vec!["print"]);
}

#[tokio::test]
async fn unprinted_pointer_queues_nothing() {
    let h = harness(
        FakeCluster::with(vec![rollout("r", "apps.kruise.io/v1alpha1", "CloneSet", "abc"), cloneset("abc")]),
        FakeStrategy::default(),
        true,
        UndoOptions::default(),
    );
    let report = h.dispatcher.run(&request(&["rollout/r"]), &mut ClosedPipe).await.unwrap();

    assert!(report.discovered.is_empty());
    assert!(report.outcomes.is_empty());
    assert_eq!(h.cluster.calls(), 1);
    assert!(h.strategy.attempts().is_empty());
    assert!(matches!(report.direct_errors.as_slice(), [UndoError::Print { .. }]));
}

#[tokio::test]
async fn missing_pointer_target_does_not_stop_the_others() {
    let h = harness(
        FakeCluster::with(vec![
            rollout("r1", "apps/v1", "Deployment", "gone"),
            rollout("r2", "apps/v1", "Deployment", "web"),
            deployment("web"),
        ]),
        FakeStrategy::default(),
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["rollout/r1", "rollout/r2"]), &mut out).await.unwrap();

    assert!(report.direct_errors.is_empty());
    assert!(matches!(report.indirect_errors.as_slice(), [UndoError::Fetch { .. }]));
    assert_eq!(h.strategy.attempts(), vec![deployment("web").identity()]);
    assert_eq!(out.0.last().map(String::as_str), Some("deployment.apps/web rolled back"));
    assert!(!report.is_success());
}

#[tokio::test]
async fn strategy_failure_behind_a_pointer_is_a_second_phase_error() {
    let strategy = FakeStrategy { fail_for: Some("bad"), ..Default::default() };
    let h = harness(
        FakeCluster::with(vec![rollout("r", "apps/v1", "Deployment", "bad"), deployment("bad")]),
        strategy,
        true,
        UndoOptions::default(),
    );
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["rollout/r"]), &mut out).await.unwrap();

    assert!(report.direct_errors.is_empty());
    let ops: Vec<&str> = report.indirect_errors.iter().map(|e| e.operation()).collect();
    assert_eq!(ops, vec!["strategy"]);
    assert_eq!(report.rolled_back().count(), 0);
}

#[tokio::test]
async fn server_dry_run_gate_applies_to_pointer_targets() {
    let options = UndoOptions { dry_run: DryRunMode::Server, ..Default::default() };
    let h = harness(
        FakeCluster::with(vec![rollout("r", "apps.kruise.io/v1alpha1", "CloneSet", "abc"), cloneset("abc")]),
        FakeStrategy::default(),
        false,
        options,
    );
    let mut out = Lines::default();
    let report = h.dispatcher.run(&request(&["rollout/r"]), &mut out).await.unwrap();

    assert!(h.strategy.attempts().is_empty());
    assert_eq!(out.0, vec!["rollout.rollouts.kruise.io/r references to CloneSet.v1alpha1.apps.kruise.io/abc".to_string()]);
    assert!(report.direct_errors.is_empty());
    assert!(matches!(report.indirect_errors.as_slice(), [UndoError::DryRunUnsupported { .. }]));
}
