//! Served resources and the mapping from user-typed resource names to them.

use kube::{
    discovery::{ApiResource, Discovery, Scope},
    Client,
};
use rewind_core::{BoxError, Gvk};
use thiserror::Error;
use tracing::debug;

use crate::with_deadline;

#[derive(Debug, Error)]
pub enum KindResolutionError {
    #[error("the server doesn't have a resource type {0:?}")]
    UnknownType(String),

    #[error("the server doesn't serve {0}")]
    NotServed(Gvk),

    #[error("API discovery failed")]
    Discovery(#[source] BoxError),
}

/// Short names of the workload kinds this tool knows about. Discovery does not
/// report them, so they are kept here.
const SHORT_NAMES: &[(&str, &str, &str)] = &[
    ("deploy", "apps", "deployments"),
    ("ds", "apps", "daemonsets"),
    ("sts", "apps", "statefulsets"),
    ("rs", "apps", "replicasets"),
    ("asts", "apps.kruise.io", "statefulsets"),
    ("ads", "apps.kruise.io", "daemonsets"),
    ("clone", "apps.kruise.io", "clonesets"),
    ("ro", "rollouts.kruise.io", "rollouts"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ServedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
    /// Served at the group's preferred version.
    pub preferred: bool,
    pub verbs: Vec<String>,
}

impl ServedResource {
    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.api_resource.group, &self.api_resource.version, &self.api_resource.kind)
    }

    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    fn matches_name(&self, name: &str) -> bool {
        self.api_resource.plural == name || self.api_resource.kind.to_lowercase() == name
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    entries: Vec<ServedResource>,
}

impl ResourceCatalog {
    pub async fn discover(client: Client) -> Result<Self, KindResolutionError> {
        let discovery = with_deadline("API discovery", Discovery::new(client).run())
            .await
            .map_err(|e| KindResolutionError::Discovery(e.into()))?;
        let mut entries = Vec::new();
        for group in discovery.groups() {
            let preferred = group.preferred_version_or_latest().to_string();
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    entries.push(ServedResource {
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                        preferred: version == preferred,
                        verbs: caps.operations.clone(),
                        api_resource: ar,
                    });
                }
            }
        }
        debug!(count = entries.len(), "discovered served resources");
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<ServedResource>) -> Self {
        Self { entries }
    }

    /// Exact lookup, any served version.
    pub fn find(&self, gvk: &Gvk) -> Option<&ServedResource> {
        self.entries.iter().find(|e| {
            e.api_resource.group == gvk.group && e.api_resource.version == gvk.version && e.api_resource.kind == gvk.kind
        })
    }

    fn preferred(&self) -> impl Iterator<Item = &ServedResource> {
        self.entries.iter().filter(|e| e.preferred)
    }

    /// Resolve a user-typed resource: short name, kind, plural, `resource.group`
    /// or `Kind.version.group`. Bare names prefer built-in groups.
    pub fn resolve_type(&self, input: &str) -> Result<&ServedResource, KindResolutionError> {
        let needle = input.to_lowercase();
        if let Some((_, group, plural)) = SHORT_NAMES.iter().find(|(short, _, _)| *short == needle) {
            if let Some(e) = self.preferred().find(|e| e.api_resource.group == *group && e.api_resource.plural == *plural) {
                return Ok(e);
            }
        }
        if let Some((name, rest)) = needle.split_once('.') {
            if let Some((version, group)) = rest.split_once('.') {
                let exact = self
                    .entries
                    .iter()
                    .find(|e| e.api_resource.version == version && e.api_resource.group == group && e.matches_name(name));
                if let Some(e) = exact {
                    return Ok(e);
                }
            }
            if let Some(e) = self.preferred().find(|e| e.api_resource.group == rest && e.matches_name(name)) {
                return Ok(e);
            }
        }
        self.preferred()
            .filter(|e| e.matches_name(&needle))
            .min_by_key(|e| (group_rank(&e.api_resource.group), e.api_resource.group.clone()))
            .ok_or_else(|| KindResolutionError::UnknownType(input.to_string()))
    }
}

fn group_rank(group: &str) -> u8 {
    if group.is_empty() {
        0
    } else if !group.contains('.') {
        1
    } else if group.ends_with(".k8s.io") {
        2
    } else {
        3
    }
}
