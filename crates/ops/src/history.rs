//! Rollback for kinds whose history lives in ControllerRevisions.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::{
    api::apps::v1::ControllerRevision,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{
    api::{Api, ListParams, Patch},
    core::{DynamicObject, GroupVersionKind},
    discovery::ApiResource,
    Client,
};
use rewind_core::{DryRunMode, ResourceHandle, RevisionSelector};
use rewind_kubehub::with_deadline;
use rewind_undo::RollbackStrategy;
use serde_json::{json, Value as Json};
use tracing::{debug, info};

use crate::{
    is_controlled_by, label_selector, merge_patch_diff, object_coordinates, patch_params, render_template,
    select_revision, skipped, templates_equal, RevisionError, ROLLED_BACK,
};

/// How the stored revision is sent back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStyle {
    /// Revision data as-is; built-in kinds understand its `$patch` directives.
    Strategic,
    /// Merge patch diffed against the live template; custom resources reject strategic merge.
    Merge,
}

pub struct HistoryRollback {
    client: Client,
    style: PatchStyle,
}

impl HistoryRollback {
    pub fn new(client: Client, style: PatchStyle) -> Self {
        Self { client, style }
    }
}

#[async_trait]
impl RollbackStrategy for HistoryRollback {
    async fn rollback(&self, target: &ResourceHandle, revision: RevisionSelector, dry_run: DryRunMode) -> Result<String> {
        let (ns, name, uid) = object_coordinates(&target.object)?;
        let selector: LabelSelector = target
            .object
            .pointer("/spec/selector")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("decoding spec.selector")?
            .ok_or_else(|| anyhow!("{} {name:?} has no selector", target.gvk.kind))?;

        let revisions: Api<ControllerRevision> = Api::namespaced(self.client.clone(), &ns);
        let lp = ListParams::default().labels(&label_selector(&selector)?);
        let listed = with_deadline("list controllerrevisions", revisions.list(&lp)).await?;
        let history: Vec<(i64, ControllerRevision)> = listed
            .items
            .into_iter()
            .filter(|cr| is_controlled_by(&cr.metadata, &uid))
            .map(|cr| (cr.revision, cr))
            .collect();
        debug!(kind = %target.gvk.kind, workload = %name, revisions = history.len(), "collected controller revisions");

        let (rev, cr) = select_revision(history, revision).map_err(|e| match e {
            RevisionError::NoPrevious => anyhow!("no last revision to roll back to"),
            other => anyhow!(other),
        })?;
        let data = cr.data.map(|raw| raw.0).ok_or_else(|| anyhow!("revision {rev} carries no data"))?;
        let wanted = revision_template(&data).ok_or_else(|| anyhow!("revision {rev} has no spec.template"))?;
        let live = target.object.pointer("/spec/template").cloned().unwrap_or(Json::Null);

        if templates_equal(&live, &wanted) {
            info!(kind = %target.gvk.kind, workload = %name, revision = rev, "template already matches");
            return Ok(skipped(rev));
        }
        if dry_run == DryRunMode::Client {
            return render_template(&wanted);
        }

        let patch = match self.style {
            PatchStyle::Strategic => Patch::Strategic(data),
            PatchStyle::Merge => Patch::Merge(json!({ "spec": { "template": merge_patch_diff(&live, &wanted) } })),
        };
        let gvk = GroupVersionKind::gvk(&target.gvk.group, &target.gvk.version, &target.gvk.kind);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &ns, &ApiResource::from_gvk(&gvk));
        with_deadline("patch workload", api.patch(&name, &patch_params(dry_run), &patch)).await?;
        info!(kind = %target.gvk.kind, workload = %name, revision = rev, "pod template restored");
        Ok(ROLLED_BACK.to_string())
    }
}

/// `spec.template` of stored revision data, without its `$patch` directive.
fn revision_template(data: &Json) -> Option<Json> {
    let mut template = data.pointer("/spec/template")?.clone();
    if let Some(obj) = template.as_object_mut() {
        obj.remove("$patch");
    }
    Some(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_template_drops_patch_directive() {
        let data = json!({"spec": {"template": {"$patch": "replace", "spec": {"containers": [{"image": "x:1"}]}}}});
        assert_eq!(revision_template(&data), Some(json!({"spec": {"containers": [{"image": "x:1"}]}})));
        assert_eq!(revision_template(&json!({"spec": {}})), None);
    }

    #[test]
    fn stored_template_matching_live_is_detected() {
        let live = json!({"metadata": {"labels": {"app": "db"}}, "spec": {"containers": [{"image": "db:2"}]}});
        let data = json!({"spec": {"template": {"$patch": "replace", "metadata": {"labels": {"app": "db"}}, "spec": {"containers": [{"image": "db:2"}]}}}});
        let wanted = revision_template(&data).unwrap();
        assert!(templates_equal(&live, &wanted));
    }

    #[test]
    fn merge_patch_targets_only_the_template() {
        let live = json!({"spec": {"containers": [{"image": "db:2"}]}, "metadata": {"annotations": {"x": "1"}}});
        let wanted = json!({"spec": {"containers": [{"image": "db:1"}]}});
        let body = json!({ "spec": { "template": merge_patch_diff(&live, &wanted) } });
        assert_eq!(body, json!({"spec": {"template": {"metadata": null, "spec": {"containers": [{"image": "db:1"}]}}}}));
    }
}
