//! Rewind core types: workload coordinates, canonical identities and error kinds.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod args;
pub mod error;
pub mod identity;

pub use args::{parse_resource_args, ResolveRequest, ResourceArg};
pub use error::{AggregateError, BoxError, UndoError};
pub use identity::{CanonicalIdentity, DedupSet};

/// Group/Version/Kind triple. The core group is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an `apiVersion` string (`v1`, `apps/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, UndoError> {
        let (group, version) = parse_group_version(api_version)?;
        Ok(Self { group, version, kind: kind.to_string() })
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Split an `apiVersion` into `(group, version)`.
///
/// Accepts `version` (core group) and `group/version`; anything with more than one
/// `/` or an empty version is rejected.
pub fn parse_group_version(api_version: &str) -> Result<(String, String), UndoError> {
    let invalid = |reason: &str| UndoError::InvalidReference { api_version: api_version.to_string(), reason: reason.to_string() };
    if api_version.is_empty() {
        return Err(invalid("apiVersion is empty"));
    }
    let parts: Vec<&str> = api_version.split('/').collect();
    let (group, version) = match parts.as_slice() {
        [version] => ("", *version),
        [group, version] => (*group, *version),
        _ => return Err(invalid("unexpected GroupVersion string")),
    };
    if version.is_empty() {
        return Err(invalid("version is empty"));
    }
    Ok((group.to_string(), version.to_string()))
}

/// One live object returned by a resource source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub gvk: Gvk,
    pub namespace: Option<String>,
    pub name: String,
    /// The object as last read from the server.
    pub object: serde_json::Value,
}

impl ResourceHandle {
    pub fn new(gvk: Gvk, namespace: Option<String>, name: impl Into<String>, object: serde_json::Value) -> Self {
        Self { gvk, namespace, name: name.into(), object }
    }

    pub fn identity(&self) -> CanonicalIdentity {
        CanonicalIdentity::new(&self.gvk, self.namespace.as_deref(), &self.name)
    }

    /// `kind.group/name` the way kubectl's name printer renders it, e.g. `deployment.apps/abc`.
    pub fn display_name(&self) -> String {
        let kind = self.gvk.kind.to_lowercase();
        if self.gvk.group.is_empty() {
            format!("{}/{}", kind, self.name)
        } else {
            format!("{}.{}/{}", kind, self.gvk.group, self.name)
        }
    }
}

/// A workload named by a pointer object (e.g. a Kruise `Rollout`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub gvk: Gvk,
    /// Namespace of the pointer object; references never cross namespaces.
    pub namespace: Option<String>,
    pub name: String,
}

impl WorkloadRef {
    pub fn identity(&self) -> CanonicalIdentity {
        CanonicalIdentity::new(&self.gvk, self.namespace.as_deref(), &self.name)
    }

    /// `Kind.version.group/name`, e.g. `CloneSet.v1alpha1.apps.kruise.io/abc`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}/{}", self.gvk.kind, self.gvk.version, self.gvk.group, self.name)
    }
}

/// Which revision to roll back to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionSelector {
    /// The revision before the current one (`--to-revision=0`).
    #[default]
    Previous,
    Exact(i64),
}

impl RevisionSelector {
    pub fn from_flag(value: i64) -> Result<Self, UndoError> {
        match value {
            0 => Ok(Self::Previous),
            v if v > 0 => Ok(Self::Exact(v)),
            v => Err(UndoError::resolution(format!("--to-revision must be >= 0, got {v}"))),
        }
    }

    /// Wire value: `0` for the previous revision.
    pub fn number(&self) -> i64 {
        match self { Self::Previous => 0, Self::Exact(v) => *v }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DryRunMode {
    #[default]
    None,
    Client,
    Server,
}

impl DryRunMode {
    /// Suffix appended to printed operations.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Client => " (dry run)",
            Self::Server => " (server dry run)",
        }
    }
}

impl std::str::FromStr for DryRunMode {
    type Err = UndoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(Self::None),
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            other => Err(UndoError::resolution(format!("invalid dry-run value {other:?} (expect none, client or server)"))),
        }
    }
}
