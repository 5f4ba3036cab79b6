use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PromptTemplate,
    LlmConfig,
    AgentConfig,
    AgentProfile,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptTemplate => "prompt_template",
            Self::LlmConfig => "llm_config",
            Self::AgentConfig => "agent_config",
            Self::AgentProfile => "agent_profile",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "prompt_template" => Ok(Self::PromptTemplate),
            "llm_config" => Ok(Self::LlmConfig),
            "agent_config" => Ok(Self::AgentConfig),
            "agent_profile" => Ok(Self::AgentProfile),
            other => Err(ConfigError::Validation(format!("unknown entity kind `{other}`"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(ConfigError::Validation(format!("unknown operation `{other}`"))),
        }
    }
}

/// Caller identity and intent accompanying a mutation, recorded verbatim in
/// the change log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationContext {
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl MutationContext {
    pub fn by(actor: impl Into<String>) -> Self {
        Self { actor: Some(actor.into()), ..Self::default() }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Append-only record of one mutation. Entries are written once and never
/// updated or deleted; rollback reapplies an old snapshot as a new mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub id: String,
    pub config_type: EntityKind,
    pub config_id: String,
    pub operation: Operation,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub change_reason: Option<String>,
    pub actor: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChangeLogEntry {
    pub fn record(
        config_type: EntityKind,
        config_id: impl Into<String>,
        operation: Operation,
        old_values: Option<serde_json::Value>,
        new_values: Option<serde_json::Value>,
        context: &MutationContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config_type,
            config_id: config_id.into(),
            operation,
            old_values,
            new_values,
            change_reason: context.reason.clone(),
            actor: context.actor.clone(),
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            created_at: Utc::now(),
        }
    }
}
