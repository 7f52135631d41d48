//! Error kinds raised while resolving and rolling back targets.

use std::error::Error as StdError;

use crate::{CanonicalIdentity, Gvk};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum UndoError {
    #[error("{kind} {name:?} does not point to a workload: {reason}")]
    MalformedPointer { kind: String, name: String, reason: String },

    #[error("invalid workload reference apiVersion {api_version:?}: {reason}")]
    InvalidReference { api_version: String, reason: String },

    #[error("{identity} is targeted more than once; only its first occurrence is rolled back")]
    DuplicateTarget { identity: CanonicalIdentity },

    #[error("no rollback strategy for {kind} (group {group:?})")]
    NoStrategy { group: String, kind: String },

    #[error("server dry-run is not supported for {gvk}")]
    DryRunUnsupported {
        gvk: Gvk,
        #[source]
        source: BoxError,
    },

    #[error("rolling back {identity}")]
    StrategyExecution {
        identity: CanonicalIdentity,
        #[source]
        source: BoxError,
    },

    #[error("fetching {target}")]
    Fetch {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("printing {target}")]
    Print {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("resolving resources")]
    Resolution(#[source] BoxError),
}

impl UndoError {
    pub fn resolution(msg: impl std::fmt::Display) -> Self {
        Self::Resolution(msg.to_string().into())
    }

    /// Short operation label used for logs and metrics.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::MalformedPointer { .. } => "malformed_pointer",
            Self::InvalidReference { .. } => "invalid_reference",
            Self::DuplicateTarget { .. } => "duplicate_target",
            Self::NoStrategy { .. } => "no_strategy",
            Self::DryRunUnsupported { .. } => "dry_run_unsupported",
            Self::StrategyExecution { .. } => "strategy",
            Self::Fetch { .. } => "fetch",
            Self::Print { .. } => "print",
            Self::Resolution(_) => "resolution",
        }
    }

    /// Message with the full source chain, `outer: inner: root`.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut cur = self.source();
        while let Some(e) = cur {
            out.push_str(": ");
            out.push_str(&e.to_string());
            cur = e.source();
        }
        out
    }
}

/// Per-phase failures of one invocation.
///
/// Only built when at least one phase actually failed.
#[derive(Debug)]
pub struct AggregateError {
    pub direct: Vec<UndoError>,
    pub indirect: Vec<UndoError>,
}

impl AggregateError {
    pub fn from_phases(direct: Vec<UndoError>, indirect: Vec<UndoError>) -> Option<Self> {
        let agg = Self { direct, indirect };
        (!agg.is_empty()).then_some(agg)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UndoError> {
        self.direct.iter().chain(self.indirect.iter())
    }

    pub fn len(&self) -> usize {
        self.direct.len() + self.indirect.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines: Vec<String> = self.iter().map(UndoError::report).collect();
        f.write_str(&lines.join("\n"))
    }
}

impl StdError for AggregateError {}
