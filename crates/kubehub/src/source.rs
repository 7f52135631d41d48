//! Resource source backed by the API server.
//!
//! Requests are first turned into a plan against the discovery catalog, then
//! every planned target is read from the server. Manifests only contribute
//! coordinates; the live object is always what gets rolled back.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{Api, ListParams},
    core::{DynamicObject, TypeMeta},
    Client,
};
use rewind_core::{ResolveRequest, ResourceArg, ResourceHandle, UndoError};
use rewind_undo::{Fetched, ResourceSource};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::manifest::{self, ManifestRef};
use crate::{shared_catalog, with_deadline, KindResolutionError, ResourceCatalog, ServedResource};

pub struct KubeSource {
    client: Client,
    catalog: Arc<OnceCell<ResourceCatalog>>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    One { resource: ServedResource, namespace: Option<String>, name: String },
    All { resource: ServedResource, namespace: Option<String> },
}

impl Target {
    fn label(&self) -> String {
        match self {
            Target::One { resource, name, .. } => format!("{}/{}", type_label(resource), name),
            Target::All { resource, .. } => type_label(resource),
        }
    }
}

/// `deployment.apps`, or `configmap` for the core group.
fn type_label(resource: &ServedResource) -> String {
    let kind = resource.api_resource.kind.to_lowercase();
    if resource.api_resource.group.is_empty() {
        kind
    } else {
        format!("{}.{}", kind, resource.api_resource.group)
    }
}

impl KubeSource {
    pub fn new(client: Client, catalog: Arc<OnceCell<ResourceCatalog>>) -> Self {
        Self { client, catalog }
    }

    fn api(&self, resource: &ServedResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if resource.namespaced => Api::namespaced_with(self.client.clone(), ns, &resource.api_resource),
            _ => Api::all_with(self.client.clone(), &resource.api_resource),
        }
    }

    async fn fetch(&self, target: Target, out: &mut Vec<Fetched>) {
        let label = target.label();
        match target {
            Target::One { resource, namespace, name } => {
                let api = self.api(&resource, namespace.as_deref());
                let res = with_deadline(&format!("get {label}"), api.get(&name)).await;
                out.push(res.map_err(|e| fetch_error(&label, e)).and_then(|obj| to_handle(&resource, namespace, obj)));
            }
            Target::All { resource, namespace } => {
                let api = self.api(&resource, namespace.as_deref());
                match with_deadline(&format!("list {label}"), api.list(&ListParams::default())).await {
                    Ok(list) => {
                        debug!(resource = %label, count = list.items.len(), "listed objects");
                        out.extend(list.items.into_iter().map(|obj| to_handle(&resource, namespace.clone(), obj)));
                    }
                    Err(e) => out.push(Err(fetch_error(&label, e))),
                }
            }
        }
    }
}

#[async_trait]
impl ResourceSource for KubeSource {
    async fn resolve(&self, request: &ResolveRequest) -> Result<Vec<Fetched>, UndoError> {
        let manifests = manifest::load(&request.filenames, request.recursive).map_err(|e| UndoError::Resolution(e.into()))?;
        let catalog = shared_catalog(&self.client, &self.catalog).await.map_err(|e| UndoError::Resolution(e.into()))?;
        let planned = plan(catalog, request, &manifests)?;
        debug!(targets = planned.len(), "resolve plan ready");

        let mut out = Vec::with_capacity(planned.len());
        for target in planned {
            match target {
                Ok(target) => self.fetch(target, &mut out).await,
                Err(e) => out.push(Err(e)),
            }
        }
        Ok(out)
    }
}

fn fetch_error(label: &str, e: anyhow::Error) -> UndoError {
    UndoError::Fetch { target: label.to_string(), source: e.into() }
}

fn to_handle(resource: &ServedResource, namespace: Option<String>, mut obj: DynamicObject) -> Fetched {
    let ar = &resource.api_resource;
    obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    obj.metadata.managed_fields = None;
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = if resource.namespaced { obj.metadata.namespace.clone().or(namespace) } else { None };
    let label = format!("{}/{}", type_label(resource), name);
    let object = serde_json::to_value(&obj).map_err(|e| UndoError::Fetch { target: label, source: e.into() })?;
    Ok(ResourceHandle::new(resource.gvk(), namespace, name, object))
}

/// Turn a request into targets. Unknown types, bad manifests and namespace
/// conflicts fail the whole request; a pointer naming a kind the server does
/// not serve only fails that item.
pub(crate) fn plan(
    catalog: &ResourceCatalog,
    request: &ResolveRequest,
    manifests: &[ManifestRef],
) -> Result<Vec<Result<Target, UndoError>>, UndoError> {
    if request.is_empty() {
        return Err(UndoError::resolution("required resource not specified"));
    }
    let scoped = |resource: &ServedResource, ns: Option<&str>| {
        resource.namespaced.then(|| ns.unwrap_or(&request.namespace).to_string())
    };

    let mut out = Vec::new();
    for arg in &request.args {
        match arg {
            ResourceArg::Typed { resource, name } => {
                let resource = catalog.resolve_type(resource).map_err(|e| UndoError::Resolution(e.into()))?.clone();
                let namespace = scoped(&resource, None);
                out.push(Ok(match name {
                    Some(name) => Target::One { resource, namespace, name: name.clone() },
                    None => Target::All { resource, namespace },
                }));
            }
            ResourceArg::Workload(r) => match catalog.find(&r.gvk) {
                Some(resource) => out.push(Ok(Target::One {
                    namespace: scoped(resource, r.namespace.as_deref()),
                    resource: resource.clone(),
                    name: r.name.clone(),
                })),
                None => out.push(Err(UndoError::Fetch {
                    target: r.qualified_name(),
                    source: KindResolutionError::NotServed(r.gvk.clone()).into(),
                })),
            },
        }
    }

    for m in manifests {
        if let Some(ns) = &m.namespace {
            if request.enforce_namespace && *ns != request.namespace {
                return Err(UndoError::resolution(format!(
                    "the namespace from the provided object {ns:?} does not match the namespace {:?}. You must pass '--namespace={ns}' to perform this operation.",
                    request.namespace
                )));
            }
        }
        let resource = catalog
            .find(&m.gvk)
            .ok_or_else(|| UndoError::Resolution(KindResolutionError::NotServed(m.gvk.clone()).into()))?
            .clone();
        let namespace = scoped(&resource, m.namespace.as_deref());
        out.push(Ok(Target::One { resource, namespace, name: m.name.clone() }));
    }
    Ok(out)
}
