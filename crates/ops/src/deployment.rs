use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use kube::{
    api::{Api, ListParams, Patch},
    Client,
};
use rewind_core::{DryRunMode, ResourceHandle, RevisionSelector};
use rewind_kubehub::with_deadline;
use rewind_undo::RollbackStrategy;
use serde_json::{json, Value as Json};
use tracing::{debug, info};

use crate::{
    is_controlled_by, label_selector, patch_params, render_template, rollback_annotations, select_revision, skipped,
    strip_template_hash, templates_equal, RevisionError, ROLLED_BACK,
};

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Restores a Deployment's pod template from one of its ReplicaSets.
pub struct DeploymentRollback {
    client: Client,
}

impl DeploymentRollback {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RollbackStrategy for DeploymentRollback {
    async fn rollback(&self, target: &ResourceHandle, revision: RevisionSelector, dry_run: DryRunMode) -> Result<String> {
        let deploy: Deployment = serde_json::from_value(target.object.clone()).context("decoding deployment")?;
        let name = deploy.metadata.name.clone().unwrap_or_else(|| target.name.clone());
        let ns = target.namespace.as_deref().ok_or_else(|| anyhow!("deployment {name:?} has no namespace"))?;
        let uid = deploy.metadata.uid.clone().ok_or_else(|| anyhow!("deployment {name:?} has no uid"))?;
        let spec = deploy.spec.as_ref().ok_or_else(|| anyhow!("deployment {name:?} has no spec"))?;
        if spec.paused == Some(true) {
            return Err(anyhow!(
                "you cannot rollback a paused deployment; resume it first with 'rewindctl rollout resume deployment/{name}' and try again"
            ));
        }

        let selector = label_selector(&spec.selector)?;
        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), ns);
        let owned = with_deadline("list replicasets", replica_sets.list(&ListParams::default().labels(&selector))).await?;
        let history = replica_set_history(owned.items, &uid);
        debug!(deployment = %name, revisions = history.len(), "collected replicaset history");

        let (rev, rs) = select_revision(history, revision).map_err(|e| match e {
            RevisionError::NoPrevious => anyhow!("no rollout history found for deployment {name:?}"),
            other => anyhow!(other),
        })?;

        let mut wanted = rs
            .spec
            .as_ref()
            .and_then(|s| s.template.as_ref())
            .map(serde_json::to_value)
            .transpose()?
            .ok_or_else(|| anyhow!("replicaset for revision {rev} has no pod template"))?;
        strip_template_hash(&mut wanted);
        let live = serde_json::to_value(&spec.template)?;
        if templates_equal(&live, &wanted) {
            info!(deployment = %name, revision = rev, "template already matches");
            return Ok(skipped(rev));
        }
        if dry_run == DryRunMode::Client {
            return render_template(&wanted);
        }

        let current = deploy.metadata.annotations.clone().unwrap_or_default();
        let from_rs = rs.metadata.annotations.clone().unwrap_or_default();
        let patch = deployment_patch(wanted, &rollback_annotations(&current, &from_rs));
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        with_deadline("patch deployment", api.patch(&name, &patch_params(dry_run), &Patch::Strategic(&patch))).await?;
        info!(deployment = %name, revision = rev, "pod template restored");
        Ok(ROLLED_BACK.to_string())
    }
}

/// Owned ReplicaSets keyed by their revision annotation. Unparseable ones are ignored.
fn replica_set_history(items: Vec<ReplicaSet>, owner_uid: &str) -> Vec<(i64, ReplicaSet)> {
    items
        .into_iter()
        .filter(|rs| is_controlled_by(&rs.metadata, owner_uid))
        .filter_map(|rs| {
            let rev = rs.metadata.annotations.as_ref()?.get(REVISION_ANNOTATION)?.parse::<i64>().ok()?;
            Some((rev, rs))
        })
        .collect()
}

/// Strategic merge patch replacing both the pod template and the annotations wholesale.
fn deployment_patch(mut template: Json, annotations: &std::collections::BTreeMap<String, String>) -> Json {
    if let Some(obj) = template.as_object_mut() {
        obj.insert("$patch".into(), json!("replace"));
    }
    let mut annotations = json!(annotations);
    if let Some(obj) = annotations.as_object_mut() {
        obj.insert("$patch".into(), json!("replace"));
    }
    json!({
        "metadata": { "annotations": annotations },
        "spec": { "template": template },
    })
}
