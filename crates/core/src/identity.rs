//! Canonical identities and the per-invocation dedup set.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::Gvk;

/// Dedup key for a workload: `group/version/kind/namespace/name`.
///
/// Never used to address the API. None of the components of a valid object
/// contain `/`, so the concatenation is injective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalIdentity(String);

impl CanonicalIdentity {
    pub fn new(gvk: &Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self(format!("{}/{}/{}/{}/{}", gvk.group, gvk.version, gvk.kind, namespace.unwrap_or(""), name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CanonicalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identities already scheduled in one invocation. Only grows.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: HashSet<CanonicalIdentity>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `identity`; returns `true` only the first time it is seen.
    pub fn observe(&mut self, identity: &CanonicalIdentity) -> bool {
        if self.seen.contains(identity) {
            return false;
        }
        self.seen.insert(identity.clone())
    }

    pub fn contains(&self, identity: &CanonicalIdentity) -> bool {
        self.seen.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
