//! Per-run variable cache
//!
//! Maps `(step index, variable)` to the value a step produced. A step's
//! iterations write into a staging area that later steps cannot see; only
//! `commit` publishes the values, once, when the step completes. A cancelled
//! or failed step is discarded, so nothing partial is ever readable.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("Step {step} never produced variable '{variable}'")]
    NotFound { step: usize, variable: String },

    #[error("Step {0} has already been committed")]
    AlreadyCommitted(usize),
}

/// Committed and staged values of one run
#[derive(Debug, Default)]
pub struct Cache {
    committed: BTreeMap<usize, BTreeMap<String, JsonValue>>,
    staged: BTreeMap<usize, BTreeMap<String, JsonValue>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a cache from committed values saved by a suspended run
    pub fn restore(committed: BTreeMap<usize, BTreeMap<String, JsonValue>>) -> Self {
        Self {
            committed,
            staged: BTreeMap::new(),
        }
    }

    /// Stages a tentative value for a running step
    ///
    /// A repeated iteration overwrites the value staged by the previous one.
    pub fn put(&mut self, step: usize, variable: impl Into<String>, value: JsonValue) -> Result<(), CacheError> {
        if self.committed.contains_key(&step) {
            return Err(CacheError::AlreadyCommitted(step));
        }
        self.staged
            .entry(step)
            .or_default()
            .insert(variable.into(), value);
        Ok(())
    }

    /// Publishes everything staged for `step`
    ///
    /// A step with nothing staged still commits, as an empty set of variables.
    pub fn commit(&mut self, step: usize) -> Result<(), CacheError> {
        if self.committed.contains_key(&step) {
            return Err(CacheError::AlreadyCommitted(step));
        }
        let values = self.staged.remove(&step).unwrap_or_default();
        self.committed.insert(step, values);
        Ok(())
    }

    /// Drops every staged value of every step
    pub fn discard_all(&mut self) {
        self.staged.clear();
    }

    /// Reads a committed value
    pub fn get(&self, step: usize, variable: &str) -> Result<&JsonValue, CacheError> {
        self.committed
            .get(&step)
            .and_then(|vars| vars.get(variable))
            .ok_or_else(|| CacheError::NotFound {
                step,
                variable: variable.to_string(),
            })
    }

    pub fn is_committed(&self, step: usize) -> bool {
        self.committed.contains_key(&step)
    }

    pub fn has_staged(&self) -> bool {
        self.staged.values().any(|vars| !vars.is_empty())
    }

    /// Committed variable names per step, for state snapshots
    pub fn summary(&self) -> BTreeMap<usize, Vec<String>> {
        self.committed
            .iter()
            .map(|(step, vars)| (*step, vars.keys().cloned().collect()))
            .collect()
    }

    /// Copy of every committed value
    pub fn snapshot(&self) -> BTreeMap<usize, BTreeMap<String, JsonValue>> {
        self.committed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_staged_values_are_invisible() {
        let mut cache = Cache::new();
        cache.put(0, "sum", json!(3)).unwrap();

        assert_eq!(
            cache.get(0, "sum"),
            Err(CacheError::NotFound {
                step: 0,
                variable: "sum".to_string()
            })
        );

        cache.commit(0).unwrap();
        assert_eq!(cache.get(0, "sum").unwrap(), &json!(3));
    }

    #[test]
    fn test_repeat_overwrites_tentative_value() {
        let mut cache = Cache::new();
        cache.put(0, "sum", json!(1)).unwrap();
        cache.put(0, "sum", json!(2)).unwrap();
        cache.commit(0).unwrap();

        assert_eq!(cache.get(0, "sum").unwrap(), &json!(2));
    }

    #[test]
    fn test_committed_step_is_write_once() {
        let mut cache = Cache::new();
        cache.put(0, "sum", json!(1)).unwrap();
        cache.commit(0).unwrap();

        assert_eq!(cache.put(0, "sum", json!(9)), Err(CacheError::AlreadyCommitted(0)));
        assert_eq!(cache.commit(0), Err(CacheError::AlreadyCommitted(0)));
        assert_eq!(cache.get(0, "sum").unwrap(), &json!(1));
    }

    #[test]
    fn test_discard_leaves_no_partial_data() {
        let mut cache = Cache::new();
        cache.put(0, "sum", json!(1)).unwrap();
        cache.commit(0).unwrap();
        cache.put(1, "sum", json!(5)).unwrap();
        assert!(cache.has_staged());

        cache.discard_all();

        assert!(!cache.has_staged());
        assert!(cache.get(1, "sum").is_err());
        assert_eq!(cache.summary(), BTreeMap::from([(0, vec!["sum".to_string()])]));
    }

    #[test]
    fn test_restore_from_snapshot() {
        let mut cache = Cache::new();
        cache.put(0, "sum", json!(3)).unwrap();
        cache.commit(0).unwrap();

        let restored = Cache::restore(cache.snapshot());
        assert!(restored.is_committed(0));
        assert_eq!(restored.get(0, "sum").unwrap(), &json!(3));
    }
}
