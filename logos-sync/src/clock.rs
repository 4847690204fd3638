//! Vector clocks for causal ordering of operations without a sequencer.
//!
//! Each participant owns one component. A participant increments its own
//! component before emitting an operation, and every received clock is
//! folded in with a pointwise maximum. Components never decrease.
//!
//! Reference: Kleppmann, Chapter 5 — Detecting Concurrent Writes

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::model::UserId;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Both clocks carry identical knowledge.
    Equal,
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Neither dominates; the edits are concurrent.
    Concurrent,
}

/// Map from participant id to a monotonically non-decreasing counter.
///
/// Missing entries read as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<UserId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh clock for a participant joining a room: `{user: 0}`.
    pub fn for_participant(user_id: UserId) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(user_id, 0);
        Self { entries }
    }

    pub fn get(&self, user_id: &UserId) -> u64 {
        self.entries.get(user_id).copied().unwrap_or(0)
    }

    /// Bump the given participant's component and return the new value.
    pub fn increment(&mut self, user_id: UserId) -> u64 {
        let counter = self.entries.entry(user_id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Fold `other` into `self` with a pointwise maximum.
    ///
    /// Idempotent and commutative; never lowers a component.
    pub fn merge(&mut self, other: &VectorClock) {
        for (user_id, &remote) in &other.entries {
            let local = self.entries.entry(*user_id).or_insert(0);
            if remote > *local {
                *local = remote;
            }
        }
    }

    /// Componentwise `self >= other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(user_id, &count)| self.get(user_id) >= count)
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// Equality follows causal knowledge, so `{a: 1}` equals `{a: 1, b: 0}`.
impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            CausalOrder::Equal => Some(Ordering::Equal),
            CausalOrder::Before => Some(Ordering::Less),
            CausalOrder::After => Some(Ordering::Greater),
            CausalOrder::Concurrent => None,
        }
    }
}

impl FromIterator<(UserId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (UserId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
