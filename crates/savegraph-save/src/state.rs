//! Per-node save state machine.
//!
//! ```text
//! Unresolved -> Resolving -> Inserting -> AssociationsPending -> Reconciled
//!                         \-> Updating  -/
//!                         \-> Skipped
//! ```
//!
//! `IdentityFailed`, `LockFailed` and `DissociationBlocked` are terminal
//! failure states; `Skipped` marks a node that matched nothing and was left
//! alone (an `UPDATE_ONLY` miss or an unchecked dangling reference).

use std::fmt;

/// Where a node is in its save lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unresolved,
    Resolving,
    Inserting,
    Updating,
    AssociationsPending,
    Reconciled,
    Skipped,
    IdentityFailed,
    LockFailed,
    DissociationBlocked,
}

impl NodeState {
    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::{
            AssociationsPending, DissociationBlocked, IdentityFailed, Inserting, LockFailed,
            Reconciled, Resolving, Skipped, Unresolved, Updating,
        };
        matches!(
            (self, next),
            (Unresolved, Resolving | IdentityFailed)
                | (Resolving, Inserting | Updating | Skipped | IdentityFailed)
                | (Inserting | Updating, AssociationsPending | LockFailed)
                | (AssociationsPending, Reconciled | DissociationBlocked)
        )
    }

    /// Whether no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Reconciled
                | NodeState::Skipped
                | NodeState::IdentityFailed
                | NodeState::LockFailed
                | NodeState::DissociationBlocked
        )
    }

    /// Whether the node's row exists after its own statement ran.
    pub const fn has_row(self) -> bool {
        matches!(self, NodeState::AssociationsPending | NodeState::Reconciled)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Unresolved => "unresolved",
            NodeState::Resolving => "resolving",
            NodeState::Inserting => "inserting",
            NodeState::Updating => "updating",
            NodeState::AssociationsPending => "associations pending",
            NodeState::Reconciled => "reconciled",
            NodeState::Skipped => "skipped",
            NodeState::IdentityFailed => "identity failed",
            NodeState::LockFailed => "lock failed",
            NodeState::DissociationBlocked => "dissociation blocked",
        };
        f.write_str(name)
    }
}

/// States of one sibling batch, indexed like the batch.
#[derive(Debug, Clone)]
pub(crate) struct BatchStates {
    entity: &'static str,
    states: Vec<NodeState>,
}

impl BatchStates {
    pub(crate) fn new(entity: &'static str, len: usize) -> Self {
        Self {
            entity,
            states: vec![NodeState::Unresolved; len],
        }
    }

    pub(crate) fn get(&self, index: usize) -> NodeState {
        self.states[index]
    }

    /// Move one node forward. Illegal transitions are ignored and logged.
    pub(crate) fn advance(&mut self, index: usize, next: NodeState) {
        let current = self.states[index];
        if current.can_transition_to(next) {
            tracing::trace!(entity = self.entity, index, from = %current, to = %next, "Node state");
            self.states[index] = next;
        } else {
            tracing::warn!(entity = self.entity, index, from = %current, to = %next, "Illegal node transition");
        }
    }

    /// Move every node currently in `from` to `next`.
    pub(crate) fn advance_all(&mut self, from: NodeState, next: NodeState) {
        for index in 0..self.states.len() {
            if self.states[index] == from {
                self.advance(index, next);
            }
        }
    }

    pub(crate) fn into_vec(self) -> Vec<NodeState> {
        self.states
    }
}
