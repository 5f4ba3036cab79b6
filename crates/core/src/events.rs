use serde::{Deserialize, Serialize};

use crate::domain::changelog::{EntityKind, Operation};

/// Published by the config repository after every committed mutation; the
/// sync coordinator computes the invalidation closure from it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub kind: EntityKind,
    pub id: String,
    pub operation: Operation,
}

impl MutationEvent {
    pub fn new(kind: EntityKind, id: impl Into<String>, operation: Operation) -> Self {
        Self { kind, id: id.into(), operation }
    }
}
