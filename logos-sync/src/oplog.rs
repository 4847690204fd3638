//! Causal operation log: the local vector clock plus per-target tracking
//! used to surface concurrent edits.
//!
//! ```text
//! send:    prepare() ── increment own component ── stamp copy ──► store ──► broadcast
//! receive: receive() ── merge (pointwise max) ── conflict check ──► observers
//! history: absorb_history() ── merge each clock, no conflict reports ──► observers
//! ```
//!
//! The log is a read projection; the store's append-only history is the
//! source of truth. It establishes a causal partial order only: two
//! operations with incomparable clocks on the same target are both kept
//! and reported, never resolved here.

use serde_json::Value;
use std::collections::HashMap;

use crate::clock::{CausalOrder, VectorClock};
use crate::model::{now_millis, ElementId, NewOperation, Operation, RoomId, UserId};

/// Outcome of applying a remote operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    /// The previously known operation on the same target, when its clock
    /// is concurrent with the incoming one.
    pub conflict: Option<Operation>,
}

pub struct OperationLog {
    local_user_id: UserId,
    clock: VectorClock,
    last_by_target: HashMap<(String, ElementId), Operation>,
}

impl OperationLog {
    /// New log with clock `{local: 0}`.
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            clock: VectorClock::for_participant(local_user_id),
            last_by_target: HashMap::new(),
        }
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Stamp a new local operation.
    ///
    /// The own clock component is bumped here, synchronously, so emission
    /// order within one client always follows call order.
    pub fn prepare(
        &mut self,
        room_id: RoomId,
        operation_type: impl Into<String>,
        target_type: impl Into<String>,
        target_id: Option<ElementId>,
        data: Value,
    ) -> NewOperation {
        self.clock.increment(self.local_user_id);
        NewOperation {
            room_id,
            user_id: self.local_user_id,
            operation_type: operation_type.into(),
            target_type: target_type.into(),
            target_id,
            data,
            vector_clock: self.clock.clone(),
            client_timestamp: now_millis(),
        }
    }

    /// Remember a persisted local operation for conflict detection.
    pub fn record_local(&mut self, operation: &Operation) {
        if let Some(key) = operation.target_key() {
            self.last_by_target.insert(key, operation.clone());
        }
    }

    /// Merge a remote operation's clock and check it against the last
    /// known operation on its target.
    pub fn receive(&mut self, operation: &Operation) -> Receipt {
        self.clock.merge(&operation.vector_clock);

        let conflict = match operation.target_key() {
            Some(key) => self.track_target(key, operation),
            None => None,
        };
        Receipt { conflict }
    }

    /// Merge clocks from a history page without reporting conflicts.
    pub fn absorb_history(&mut self, operations: &[Operation]) {
        for operation in operations {
            self.clock.merge(&operation.vector_clock);
            if let Some(key) = operation.target_key() {
                self.track_target(key, operation);
            }
        }
    }

    fn track_target(&mut self, key: (String, ElementId), incoming: &Operation) -> Option<Operation> {
        let (replace, conflict) = match self.last_by_target.get(&key) {
            None => (true, None),
            Some(known) if known.id == incoming.id => (false, None),
            Some(known) => match incoming.vector_clock.compare(&known.vector_clock) {
                CausalOrder::Before | CausalOrder::Equal => (false, None),
                CausalOrder::After => (true, None),
                CausalOrder::Concurrent => (true, Some(known.clone())),
            },
        };
        if replace {
            self.last_by_target.insert(key, incoming.clone());
        }
        conflict
    }

    pub fn clear(&mut self) {
        self.clock.clear();
        self.last_by_target.clear();
    }
}
