//! Rewind Ops: rollback strategies for the workload kinds the tool supports.
//!
//! Deployments are rolled back from their owned ReplicaSets; everything else
//! keeps its history in ControllerRevisions.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{api::PatchParams, Client};
use rewind_core::{DryRunMode, RevisionSelector};
use rewind_undo::StrategyRegistry;
use serde_json::{Map, Value as Json};

pub mod deployment;
pub mod history;

pub use deployment::DeploymentRollback;
pub use history::{HistoryRollback, PatchStyle};

pub const ROLLED_BACK: &str = "rolled back";

/// Label added by the Deployment controller; differs per ReplicaSet.
pub const TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Deployment annotations that are never copied from a ReplicaSet.
pub const ANNOTATIONS_TO_SKIP: &[&str] = &[
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
    "deployment.kubernetes.io/revision-history",
    "deployment.kubernetes.io/desired-replicas",
    "deployment.kubernetes.io/max-replicas",
    "deprecated.deployment.rollback.to",
];

/// Registry with a strategy for every supported `(group, kind)`.
pub fn default_registry(client: Client) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry
        .register("apps", "Deployment", Arc::new(DeploymentRollback::new(client.clone())))
        .register("apps", "DaemonSet", Arc::new(HistoryRollback::new(client.clone(), PatchStyle::Strategic)))
        .register("apps", "StatefulSet", Arc::new(HistoryRollback::new(client.clone(), PatchStyle::Strategic)))
        .register("apps.kruise.io", "CloneSet", Arc::new(HistoryRollback::new(client.clone(), PatchStyle::Merge)))
        .register("apps.kruise.io", "StatefulSet", Arc::new(HistoryRollback::new(client.clone(), PatchStyle::Merge)))
        .register("apps.kruise.io", "DaemonSet", Arc::new(HistoryRollback::new(client, PatchStyle::Merge)));
    registry
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RevisionError {
    #[error("no previous revision")]
    NoPrevious,
    #[error("unable to find specified revision {0} in history")]
    NotFound(i64),
}

/// Pick the entry for `selector` out of `(revision, item)` pairs.
///
/// `Previous` is the second highest revision. Duplicate revision numbers keep
/// the first entry seen.
pub fn select_revision<T>(history: Vec<(i64, T)>, selector: RevisionSelector) -> Result<(i64, T), RevisionError> {
    match selector {
        RevisionSelector::Exact(wanted) => {
            history.into_iter().find(|(rev, _)| *rev == wanted).ok_or(RevisionError::NotFound(wanted))
        }
        RevisionSelector::Previous => {
            let mut sorted = history;
            sorted.sort_by(|a, b| b.0.cmp(&a.0));
            sorted.dedup_by_key(|(rev, _)| *rev);
            sorted.into_iter().nth(1).ok_or(RevisionError::NoPrevious)
        }
    }
}

/// Render a label selector as a list-call query string.
pub fn label_selector(selector: &LabelSelector) -> Result<String> {
    let mut parts = Vec::new();
    for (k, v) in selector.match_labels.iter().flatten() {
        parts.push(format!("{k}={v}"));
    }
    for req in selector.match_expressions.iter().flatten() {
        let values = req.values.clone().unwrap_or_default().join(",");
        let part = match req.operator.as_str() {
            "In" => format!("{} in ({values})", req.key),
            "NotIn" => format!("{} notin ({values})", req.key),
            "Exists" => req.key.clone(),
            "DoesNotExist" => format!("!{}", req.key),
            other => return Err(anyhow!("{other:?} is not a valid label selector operator")),
        };
        parts.push(part);
    }
    if parts.is_empty() {
        return Err(anyhow!("empty selector would match every object"));
    }
    Ok(parts.join(","))
}

pub fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.controller == Some(true) && o.uid == uid)
}

/// Drop the controller hash label so templates from different ReplicaSets compare equal.
pub fn strip_template_hash(template: &mut Json) {
    if let Some(labels) = template.pointer_mut("/metadata/labels").and_then(Json::as_object_mut) {
        labels.remove(TEMPLATE_HASH_LABEL);
    }
}

pub fn templates_equal(live: &Json, candidate: &Json) -> bool {
    let (mut a, mut b) = (live.clone(), candidate.clone());
    strip_template_hash(&mut a);
    strip_template_hash(&mut b);
    a == b
}

/// Annotations for a rolled-back Deployment: skip-listed keys keep their
/// current value, everything else comes from the ReplicaSet.
pub fn rollback_annotations(current: &BTreeMap<String, String>, from_rs: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = ANNOTATIONS_TO_SKIP
        .iter()
        .filter_map(|k| current.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect();
    for (k, v) in from_rs {
        if !ANNOTATIONS_TO_SKIP.contains(&k.as_str()) {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// JSON merge patch (RFC 7386) turning `from` into `to`. Removed keys map to `null`.
pub fn merge_patch_diff(from: &Json, to: &Json) -> Json {
    match (from, to) {
        (Json::Object(a), Json::Object(b)) => {
            let mut patch = Map::new();
            for (k, old) in a {
                match b.get(k) {
                    None => {
                        patch.insert(k.clone(), Json::Null);
                    }
                    Some(new) if new != old => {
                        patch.insert(k.clone(), merge_patch_diff(old, new));
                    }
                    Some(_) => {}
                }
            }
            for (k, new) in b {
                if !a.contains_key(k) {
                    patch.insert(k.clone(), new.clone());
                }
            }
            Json::Object(patch)
        }
        _ => to.clone(),
    }
}

/// YAML shown instead of patching in client dry-run mode.
pub fn render_template(template: &Json) -> Result<String> {
    Ok(serde_yaml::to_string(template)?)
}

pub fn patch_params(dry_run: DryRunMode) -> PatchParams {
    match dry_run {
        DryRunMode::Server => PatchParams::default().dry_run(),
        _ => PatchParams::default(),
    }
}

pub fn skipped(revision: i64) -> String {
    format!("skipped rollback (current template already matches revision {revision})")
}

/// `metadata.{namespace,name,uid}` of a live object.
pub(crate) fn object_coordinates(object: &Json) -> Result<(String, String, String)> {
    let field = |f: &str| {
        object
            .pointer(&format!("/metadata/{f}"))
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("object has no metadata.{f}"))
    };
    Ok((field("namespace")?, field("name")?, field("uid")?))
}
