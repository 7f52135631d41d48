//! Resource arguments and the request handed to a resource source.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{UndoError, WorkloadRef};

/// One target as named on the command line or discovered through a pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceArg {
    /// `TYPE/NAME`, or `TYPE` alone to select every object of the type.
    Typed { resource: String, name: Option<String> },
    /// Exact coordinates, as found in a pointer object.
    Workload(WorkloadRef),
}

/// Everything a resource source needs to produce handles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Namespace used for objects that do not carry one.
    pub namespace: String,
    /// Reject manifests whose namespace differs from `namespace`.
    pub enforce_namespace: bool,
    pub args: Vec<ResourceArg>,
    pub filenames: Vec<PathBuf>,
    pub recursive: bool,
}

impl ResolveRequest {
    /// Follow-up request for workloads discovered through pointers.
    pub fn for_workloads(&self, refs: Vec<WorkloadRef>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            enforce_namespace: false,
            args: refs.into_iter().map(ResourceArg::Workload).collect(),
            filenames: Vec::new(),
            recursive: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.filenames.is_empty()
    }
}

/// Parse positional arguments: either all `TYPE/NAME`, or `TYPE[,TYPE...] [NAME...]`.
pub fn parse_resource_args(args: &[String]) -> Result<Vec<ResourceArg>, UndoError> {
    if args.is_empty() {
        return Ok(Vec::new());
    }
    if args.iter().any(|a| a.contains('/')) {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            let Some((resource, name)) = arg.split_once('/') else {
                return Err(UndoError::resolution(format!(
                    "there is no need to specify a resource type as a separate argument when passing arguments in resource/name form (e.g. 'rewindctl rollout undo resource/<name>' instead of 'rewindctl rollout undo resource resource/<name>'), got {arg:?}"
                )));
            };
            if name.contains('/') {
                return Err(UndoError::resolution(format!("arguments in resource/name form may not have more than one slash: {arg:?}")));
            }
            if resource.is_empty() || name.is_empty() {
                return Err(UndoError::resolution(format!("arguments in resource/name form must have a single resource and name: {arg:?}")));
            }
            out.push(ResourceArg::Typed { resource: resource.to_string(), name: Some(name.to_string()) });
        }
        return Ok(out);
    }

    let types: Vec<&str> = args[0].split(',').collect();
    if types.iter().any(|t| t.is_empty()) {
        return Err(UndoError::resolution(format!("invalid resource type list {:?}", args[0])));
    }
    let names = &args[1..];
    let mut out = Vec::new();
    for t in types {
        if names.is_empty() {
            out.push(ResourceArg::Typed { resource: t.to_string(), name: None });
        }
        for n in names {
            out.push(ResourceArg::Typed { resource: t.to_string(), name: Some(n.clone()) });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> { v.iter().map(|x| x.to_string()).collect() }

    fn typed(r: &str, n: Option<&str>) -> ResourceArg {
        ResourceArg::Typed { resource: r.to_string(), name: n.map(str::to_string) }
    }

    #[test]
    fn slash_form() {
        let got = parse_resource_args(&s(&["deployment/abc", "cloneset/x"])).unwrap();
        assert_eq!(got, vec![typed("deployment", Some("abc")), typed("cloneset", Some("x"))]);
    }

    #[test]
    fn type_then_names() {
        let got = parse_resource_args(&s(&["deploy,ds", "a", "b"])).unwrap();
        assert_eq!(
            got,
            vec![typed("deploy", Some("a")), typed("deploy", Some("b")), typed("ds", Some("a")), typed("ds", Some("b"))]
        );
    }

    #[test]
    fn bare_type_selects_all() {
        assert_eq!(parse_resource_args(&s(&["deployment"])).unwrap(), vec![typed("deployment", None)]);
    }

    #[test]
    fn mixed_forms_are_rejected() {
        assert!(parse_resource_args(&s(&["deployment", "deployment/abc"])).is_err());
        assert!(parse_resource_args(&s(&["a/b/c"])).is_err());
        assert!(parse_resource_args(&s(&["/abc"])).is_err());
        assert!(parse_resource_args(&s(&["deploy,", "x"])).is_err());
    }

    #[test]
    fn follow_up_request_keeps_namespace_only() {
        let req = ResolveRequest {
            namespace: "prod".into(),
            enforce_namespace: true,
            args: vec![typed("rollout", Some("r"))],
            filenames: vec![PathBuf::from("x.yaml")],
            recursive: true,
        };
        let r = WorkloadRef { gvk: crate::Gvk::new("apps", "v1", "Deployment"), namespace: Some("prod".into()), name: "w".into() };
        let next = req.for_workloads(vec![r.clone()]);
        assert_eq!(next.namespace, "prod");
        assert!(next.filenames.is_empty());
        assert_eq!(next.args, vec![ResourceArg::Workload(r)]);
    }
}
