use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::llm::LlmConfigId;
use crate::domain::template::TemplateId;
use crate::errors::ConfigError;
use crate::slots::PromptSlot;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentConfigId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStrategy {
    Auto,
    Required,
    Disabled,
}

impl ToolCallStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Required => "required",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for ToolCallStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolCallStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "auto" => Ok(Self::Auto),
            "required" => Ok(Self::Required),
            "disabled" => Ok(Self::Disabled),
            other => {
                Err(ConfigError::Validation(format!("unknown tool_call_strategy `{other}`")))
            }
        }
    }
}

/// Composite agent configuration. Slots hold references, never embedded
/// content, so component versions evolve independently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentConfigId,
    pub name: String,
    pub agent_type: String,
    pub role_definition_id: TemplateId,
    pub reasoning_framework_id: Option<TemplateId>,
    pub retrieval_strategy_id: Option<TemplateId>,
    pub safety_policy_id: Option<TemplateId>,
    pub process_guide_id: Option<TemplateId>,
    pub llm_config_id: LlmConfigId,
    pub enabled_tools: BTreeSet<String>,
    pub tool_call_strategy: ToolCallStrategy,
    pub max_iterations: i64,
    pub timeout_secs: i64,
    pub extra_params: serde_json::Value,
    pub description: Option<String>,
    pub is_usable: bool,
    /// Optimistic concurrency marker; bumped on every successful update.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The four optional template slots owned by an agent config, in assembly
/// order. The communication style slot lives on the profile.
pub const OPTIONAL_AGENT_SLOTS: [PromptSlot; 4] = [
    PromptSlot::SafetyPolicy,
    PromptSlot::ReasoningFramework,
    PromptSlot::RetrievalStrategy,
    PromptSlot::ProcessGuide,
];

impl AgentConfig {
    pub fn optional_slot(&self, slot: PromptSlot) -> Option<&TemplateId> {
        match slot {
            PromptSlot::ReasoningFramework => self.reasoning_framework_id.as_ref(),
            PromptSlot::RetrievalStrategy => self.retrieval_strategy_id.as_ref(),
            PromptSlot::SafetyPolicy => self.safety_policy_id.as_ref(),
            PromptSlot::ProcessGuide => self.process_guide_id.as_ref(),
            PromptSlot::RoleDefinition | PromptSlot::CommunicationStyle => None,
        }
    }

    pub fn clear_optional_slot(&mut self, slot: PromptSlot) {
        match slot {
            PromptSlot::ReasoningFramework => self.reasoning_framework_id = None,
            PromptSlot::RetrievalStrategy => self.retrieval_strategy_id = None,
            PromptSlot::SafetyPolicy => self.safety_policy_id = None,
            PromptSlot::ProcessGuide => self.process_guide_id = None,
            PromptSlot::RoleDefinition | PromptSlot::CommunicationStyle => {}
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Partial update for `update_agent_config`. Outer `None` leaves a field
/// untouched; for nullable slots the inner option distinguishes "set" from
/// "clear".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentConfigPatch {
    pub name: Option<String>,
    pub agent_type: Option<String>,
    pub role_definition_id: Option<TemplateId>,
    pub reasoning_framework_id: Option<Option<TemplateId>>,
    pub retrieval_strategy_id: Option<Option<TemplateId>>,
    pub safety_policy_id: Option<Option<TemplateId>>,
    pub process_guide_id: Option<Option<TemplateId>>,
    pub llm_config_id: Option<LlmConfigId>,
    pub enabled_tools: Option<BTreeSet<String>>,
    pub tool_call_strategy: Option<ToolCallStrategy>,
    pub max_iterations: Option<i64>,
    pub timeout_secs: Option<i64>,
    pub extra_params: Option<serde_json::Value>,
    pub description: Option<Option<String>>,
    pub is_usable: Option<bool>,
}

impl AgentConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The optional slot assignments this patch changes, as (slot, new value).
    pub fn changed_optional_slots(&self) -> Vec<(PromptSlot, Option<&TemplateId>)> {
        let mut changed = Vec::new();
        if let Some(value) = &self.safety_policy_id {
            changed.push((PromptSlot::SafetyPolicy, value.as_ref()));
        }
        if let Some(value) = &self.reasoning_framework_id {
            changed.push((PromptSlot::ReasoningFramework, value.as_ref()));
        }
        if let Some(value) = &self.retrieval_strategy_id {
            changed.push((PromptSlot::RetrievalStrategy, value.as_ref()));
        }
        if let Some(value) = &self.process_guide_id {
            changed.push((PromptSlot::ProcessGuide, value.as_ref()));
        }
        changed
    }

    /// Produce the post-patch state of `current` without persisting it.
    pub fn apply_to(&self, current: &AgentConfig) -> AgentConfig {
        let mut next = current.clone();
        if let Some(name) = &self.name {
            next.name = name.clone();
        }
        if let Some(agent_type) = &self.agent_type {
            next.agent_type = agent_type.clone();
        }
        if let Some(role) = &self.role_definition_id {
            next.role_definition_id = role.clone();
        }
        if let Some(value) = &self.reasoning_framework_id {
            next.reasoning_framework_id = value.clone();
        }
        if let Some(value) = &self.retrieval_strategy_id {
            next.retrieval_strategy_id = value.clone();
        }
        if let Some(value) = &self.safety_policy_id {
            next.safety_policy_id = value.clone();
        }
        if let Some(value) = &self.process_guide_id {
            next.process_guide_id = value.clone();
        }
        if let Some(llm) = &self.llm_config_id {
            next.llm_config_id = llm.clone();
        }
        if let Some(tools) = &self.enabled_tools {
            next.enabled_tools = tools.clone();
        }
        if let Some(strategy) = self.tool_call_strategy {
            next.tool_call_strategy = strategy;
        }
        if let Some(max_iterations) = self.max_iterations {
            next.max_iterations = max_iterations;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            next.timeout_secs = timeout_secs;
        }
        if let Some(extra) = &self.extra_params {
            next.extra_params = extra.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(is_usable) = self.is_usable {
            next.is_usable = is_usable;
        }
        next
    }
}
