//! Classification of visited objects into workloads and pointers.

use rewind_core::{CanonicalIdentity, Gvk, ResourceHandle, UndoError, WorkloadRef};
use serde_json::Value as Json;

/// Pointer kind: a Kruise `Rollout` names the workload it drives.
pub const ROLLOUT_GROUP: &str = "rollouts.kruise.io";
pub const ROLLOUT_KIND: &str = "Rollout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Rolled back directly; carries the handle's own identity.
    Workload(CanonicalIdentity),
    /// Only points at a workload elsewhere.
    Pointer(WorkloadRef),
}

pub fn is_pointer(gvk: &Gvk) -> bool {
    gvk.group == ROLLOUT_GROUP && gvk.kind == ROLLOUT_KIND
}

pub fn classify(handle: &ResourceHandle) -> Result<Classified, UndoError> {
    if is_pointer(&handle.gvk) {
        workload_ref(handle).map(Classified::Pointer)
    } else {
        Ok(Classified::Workload(handle.identity()))
    }
}

/// Extract the referenced workload from a `Rollout`.
///
/// v1alpha1 keeps it under `spec.objectRef.workloadRef`, v1beta1 under
/// `spec.workloadRef`.
pub fn workload_ref(handle: &ResourceHandle) -> Result<WorkloadRef, UndoError> {
    let malformed = |reason: &str| UndoError::MalformedPointer {
        kind: handle.gvk.kind.clone(),
        name: handle.name.clone(),
        reason: reason.to_string(),
    };
    if handle.object.is_null() {
        return Err(malformed("object not found"));
    }
    let spec = handle.object.get("spec").ok_or_else(|| malformed("missing spec"))?;
    let wref = spec
        .get("objectRef")
        .and_then(|o| o.get("workloadRef"))
        .or_else(|| spec.get("workloadRef"))
        .filter(|v| v.is_object())
        .ok_or_else(|| malformed("unsupported version of Rollout: no workloadRef"))?;

    let field = |name: &str| wref.get(name).and_then(Json::as_str).filter(|s| !s.is_empty());
    let api_version = field("apiVersion").ok_or_else(|| malformed("workloadRef.apiVersion is missing"))?;
    let kind = field("kind").ok_or_else(|| malformed("workloadRef.kind is missing"))?;
    let name = field("name").ok_or_else(|| malformed("workloadRef.name is missing"))?;

    let gvk = Gvk::from_api_version(api_version, kind)?;
    Ok(WorkloadRef { gvk, namespace: handle.namespace.clone(), name: name.to_string() })
}
