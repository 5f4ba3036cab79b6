use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use persona_core::domain::agent::{AgentConfig, AgentConfigId};
use persona_core::domain::changelog::{ChangeLogEntry, EntityKind};
use persona_core::domain::llm::{LlmConfig, LlmConfigId};
use persona_core::domain::profile::{AgentProfile, ProfileId};
use persona_core::domain::template::{PromptTemplate, TemplateId};
use persona_core::slots::PromptType;

pub mod agent;
pub mod changelog;
pub mod llm;
pub mod memory;
pub mod profile;
pub mod template;

pub use agent::SqlAgentConfigStore;
pub use changelog::SqlChangeLogStore;
pub use llm::SqlLlmConfigStore;
pub use memory::InMemoryStore;
pub use profile::SqlProfileStore;
pub use template::SqlTemplateStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
}

/// Map an insert failure, surfacing unique-index hits as their own variant so
/// the repository layer can report a `UniquenessViolation` to callers.
pub(crate) fn map_insert_error(error: sqlx::Error, what: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_error) = error {
        if db_error.is_unique_violation() {
            return RepositoryError::UniqueViolation(what.to_string());
        }
    }
    RepositoryError::Database(error)
}

/// Result of deleting a template under restrict/set-null semantics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateDeleteOutcome {
    NotFound,
    /// At least one agent config holds this template in its required
    /// role_definition slot.
    BlockedByRequiredReference { referencing_agents: i64 },
    /// Deleted; optional references were cleared on the listed agent configs
    /// inside the same transaction.
    Deleted { cleared_agents: Vec<AgentConfigId> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmDeleteOutcome {
    NotFound,
    BlockedByReference { referencing_agents: i64 },
    Deleted,
}

/// Result of an optimistic-concurrency update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    StaleRevision,
    Missing,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn insert(&self, template: PromptTemplate) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &TemplateId) -> Result<Option<PromptTemplate>, RepositoryError>;
    async fn find_by_name_version(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<PromptTemplate>, RepositoryError>;
    async fn latest_version(&self, name: &str) -> Result<Option<i64>, RepositoryError>;
    async fn latest_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PromptTemplate>, RepositoryError>;
    async fn list_by_type(
        &self,
        prompt_type: PromptType,
        active_only: bool,
    ) -> Result<Vec<PromptTemplate>, RepositoryError>;
    async fn set_active(
        &self,
        id: &TemplateId,
        active: bool,
        updated_by: Option<&str>,
    ) -> Result<bool, RepositoryError>;
    async fn delete(&self, id: &TemplateId) -> Result<TemplateDeleteOutcome, RepositoryError>;
}

#[async_trait]
pub trait LlmConfigStore: Send + Sync {
    async fn insert(&self, config: LlmConfig) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &LlmConfigId) -> Result<Option<LlmConfig>, RepositoryError>;
    async fn find_by_name(&self, name: &str) -> Result<Option<LlmConfig>, RepositoryError>;
    async fn update(&self, config: LlmConfig) -> Result<bool, RepositoryError>;
    async fn delete(&self, id: &LlmConfigId) -> Result<LlmDeleteOutcome, RepositoryError>;
}

#[async_trait]
pub trait AgentConfigStore: Send + Sync {
    async fn insert(&self, config: AgentConfig) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &AgentConfigId)
        -> Result<Option<AgentConfig>, RepositoryError>;
    async fn find_by_name(&self, name: &str) -> Result<Option<AgentConfig>, RepositoryError>;
    async fn list(&self) -> Result<Vec<AgentConfig>, RepositoryError>;
    /// Persist `config` only if the stored revision still equals
    /// `expected_revision`. `config.revision` must already carry the bumped
    /// value.
    async fn update_with_revision(
        &self,
        config: &AgentConfig,
        expected_revision: i64,
    ) -> Result<UpdateOutcome, RepositoryError>;
    async fn delete(&self, id: &AgentConfigId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn insert(&self, profile: AgentProfile) -> Result<(), RepositoryError>;
    async fn find_by_id(&self, id: &ProfileId) -> Result<Option<AgentProfile>, RepositoryError>;
    async fn find_by_agent(
        &self,
        agent_config_id: &AgentConfigId,
    ) -> Result<Option<AgentProfile>, RepositoryError>;
    async fn update(&self, profile: AgentProfile) -> Result<bool, RepositoryError>;
    async fn delete(&self, id: &ProfileId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    /// The only write path; entries are immutable once appended.
    async fn append(&self, entry: ChangeLogEntry) -> Result<(), RepositoryError>;
    async fn query(
        &self,
        config_type: EntityKind,
        config_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<ChangeLogEntry>, RepositoryError>;
}
