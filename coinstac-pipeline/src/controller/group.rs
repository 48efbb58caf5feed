//! Group synchronisation for decentralized steps
//!
//! The aggregator keeps one shared counter per step. Contributions are keyed
//! by `(username, counter)`: a contribution below the shared counter is stale
//! and dropped, one above it is kept for a later round, and the counter only
//! moves once every expected participant has contributed at its current value.

use coinstac_core::dto::transport::GroupStepState;
use std::collections::{BTreeMap, BTreeSet};

/// What happened to a recorded contribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    Counted,
    /// Counter below the group's current counter
    Stale,
    /// Same participant already contributed at this counter
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSync {
    state: GroupStepState,
    received: BTreeMap<u32, BTreeSet<String>>,
}

impl GroupSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes from saved counters
    ///
    /// Contributions themselves are not saved: participants resend for the
    /// current counter when they resume.
    pub fn from_state(state: GroupStepState) -> Self {
        Self {
            state,
            received: BTreeMap::new(),
        }
    }

    /// The shared counter
    pub fn step(&self) -> u32 {
        self.state.step
    }

    pub fn state(&self) -> &GroupStepState {
        &self.state
    }

    pub fn record(&mut self, username: &str, counter: u32) -> Contribution {
        if counter < self.state.step {
            return Contribution::Stale;
        }

        if !self
            .received
            .entry(counter)
            .or_default()
            .insert(username.to_string())
        {
            return Contribution::Duplicate;
        }

        let latest = self
            .state
            .user_step
            .entry(username.to_string())
            .or_insert(counter);
        *latest = (*latest).max(counter);

        Contribution::Counted
    }

    /// Expected participants without a contribution at the current counter
    pub fn missing(&self, expected: &[String]) -> Vec<String> {
        let current = self.received.get(&self.state.step);
        expected
            .iter()
            .filter(|user| !current.is_some_and(|users| users.contains(*user)))
            .cloned()
            .collect()
    }

    /// Whether anybody contributed at the current counter
    pub fn has_contributions(&self) -> bool {
        self.received
            .get(&self.state.step)
            .is_some_and(|users| !users.is_empty())
    }

    /// Every expected participant is present, they all match and they are
    /// all at the group's latest counter
    pub fn is_ready(&self, expected: &[String]) -> bool {
        !expected.is_empty() && self.missing(expected).is_empty()
    }

    /// Moves the shared counter forward by one
    pub fn bump(&mut self) {
        self.state.step += 1;
        let step = self.state.step;
        self.received.retain(|counter, _| *counter >= step);
    }
}
