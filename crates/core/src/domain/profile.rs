use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::AgentConfigId;
use crate::domain::template::TemplateId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub String);

/// Display metadata for one agent config. At most one profile exists per
/// config; the owning reference is unique in the system of record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: ProfileId,
    pub agent_config_id: AgentConfigId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub language: String,
    pub communication_style_id: Option<TemplateId>,
    pub personality_tags: BTreeSet<String>,
    pub expertise_domains: serde_json::Value,
    pub max_context_length: Option<i64>,
    pub is_public: bool,
    pub custom_metadata: serde_json::Value,
    pub is_usable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
