use thiserror::Error;

use crate::domain::changelog::EntityKind;
use crate::slots::{PromptSlot, PromptType};

/// Caller-facing error taxonomy for mutations and resolution. Integrity and
/// validation failures are surfaced synchronously, never auto-corrected.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{kind:?} `{id}` was not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("slot `{slot}` references nonexistent template `{id}`")]
    DanglingReference { slot: PromptSlot, id: String },
    #[error("slot `{slot}` expects a `{expected}` template, but `{id}` is `{actual}`")]
    TypeMismatch { slot: PromptSlot, expected: PromptType, actual: PromptType, id: String },
    #[error("agent config `{agent_id}` has no active role_definition template")]
    RequiredSlotMissing { agent_id: String },
    #[error("uniqueness violation: {0}")]
    UniquenessViolation(String),
    #[error("delete blocked by referential integrity: {0}")]
    ReferentialIntegrity(String),
    #[error("stale revision {expected} for `{id}`; reread and retry")]
    Conflict { id: String, expected: i64 },
    #[error("slot `{slot}` references inactive template `{id}`")]
    InactiveReference { slot: PromptSlot, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ConfigError {
    /// True when the failure describes a misconfigured-but-existing entity,
    /// as opposed to an unknown identifier.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::DanglingReference { .. }
                | Self::TypeMismatch { .. }
                | Self::RequiredSlotMissing { .. }
                | Self::InactiveReference { .. }
        )
    }
}
