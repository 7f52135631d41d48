use std::collections::HashMap;
use std::sync::Arc;

use rewind_core::UndoError;

use crate::RollbackStrategy;

/// Rollback strategies keyed by `(group, kind)`.
#[derive(Default, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<(String, String), Arc<dyn RollbackStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `strategy` for `(group, kind)`, replacing any previous entry.
    pub fn register(&mut self, group: &str, kind: &str, strategy: Arc<dyn RollbackStrategy>) -> &mut Self {
        self.strategies.insert((group.to_string(), kind.to_string()), strategy);
        self
    }

    pub fn strategy_for(&self, group: &str, kind: &str) -> Result<Arc<dyn RollbackStrategy>, UndoError> {
        self.strategies
            .get(&(group.to_string(), kind.to_string()))
            .cloned()
            .ok_or_else(|| UndoError::NoStrategy { group: group.to_string(), kind: kind.to_string() })
    }

    pub fn kinds(&self) -> Vec<(String, String)> {
        let mut out: Vec<_> = self.strategies.keys().cloned().collect();
        out.sort();
        out
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry").field("kinds", &self.kinds()).finish()
    }
}
