//! Errors raised while shaping or patching a service tree.

use crate::model::EntityKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("{kind} record is not a JSON object")]
    NotAnObject { kind: EntityKind },

    #[error("{kind} record has no string id")]
    MissingId { kind: EntityKind },

    #[error("{kind} {id} has no parent reference ({foreign_key})")]
    MissingParent {
        kind: EntityKind,
        id: String,
        foreign_key: String,
    },

    #[error("field {key} of {kind} is not an array")]
    InvalidCollection { kind: EntityKind, key: String },

    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: EntityKind, id: String },

    #[error("duplicate name {name:?} in {key}")]
    DuplicateName { key: String, name: String },

    #[error("{kind} {id} is named {name:?}, already used by sibling {existing}")]
    NameConflict {
        kind: EntityKind,
        id: String,
        existing: String,
        name: String,
    },

    #[error("ancestor {kind} {id} not found in tree")]
    AncestorNotFound { kind: EntityKind, id: String },

    #[error("{kind} {id} not found in tree")]
    NodeNotFound { kind: EntityKind, id: String },

    #[error("{kind} is not part of this tree")]
    UnknownKind { kind: EntityKind },

    #[error("record {id} is not the tree root {root}")]
    RootMismatch { id: String, root: String },
}

impl TreeError {
    /// True when the cached tree no longer matches the store and should be refetched.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::AncestorNotFound { .. })
    }
}
