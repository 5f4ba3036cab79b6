use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Closed set of prompt component roles. The stored tag is authoritative;
/// the engine never re-derives a type from template content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    RoleDefinition,
    ReasoningFramework,
    CommunicationStyle,
    RetrievalStrategy,
    SafetyPolicy,
    ProcessGuide,
}

impl PromptType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoleDefinition => "role_definition",
            Self::ReasoningFramework => "reasoning_framework",
            Self::CommunicationStyle => "communication_style",
            Self::RetrievalStrategy => "retrieval_strategy",
            Self::SafetyPolicy => "safety_policy",
            Self::ProcessGuide => "process_guide",
        }
    }
}

impl fmt::Display for PromptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PromptType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "role_definition" => Ok(Self::RoleDefinition),
            "reasoning_framework" => Ok(Self::ReasoningFramework),
            "communication_style" => Ok(Self::CommunicationStyle),
            "retrieval_strategy" => Ok(Self::RetrievalStrategy),
            "safety_policy" => Ok(Self::SafetyPolicy),
            "process_guide" => Ok(Self::ProcessGuide),
            other => Err(ConfigError::Validation(format!("unknown prompt_type `{other}`"))),
        }
    }
}

/// Named reference slot on a composite configuration. Declared in assembly
/// order: role anchors identity, safety constrains everything after it, and
/// communication style comes last so tone can never override policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSlot {
    RoleDefinition,
    SafetyPolicy,
    ReasoningFramework,
    RetrievalStrategy,
    ProcessGuide,
    CommunicationStyle,
}

impl PromptSlot {
    pub const SECTION_ORDER: [PromptSlot; 6] = [
        PromptSlot::RoleDefinition,
        PromptSlot::SafetyPolicy,
        PromptSlot::ReasoningFramework,
        PromptSlot::RetrievalStrategy,
        PromptSlot::ProcessGuide,
        PromptSlot::CommunicationStyle,
    ];

    /// Slot-to-type matching table. A slot only ever accepts a template whose
    /// stored `prompt_type` equals this value.
    pub fn expected_type(self) -> PromptType {
        match self {
            Self::RoleDefinition => PromptType::RoleDefinition,
            Self::SafetyPolicy => PromptType::SafetyPolicy,
            Self::ReasoningFramework => PromptType::ReasoningFramework,
            Self::RetrievalStrategy => PromptType::RetrievalStrategy,
            Self::ProcessGuide => PromptType::ProcessGuide,
            Self::CommunicationStyle => PromptType::CommunicationStyle,
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Self::RoleDefinition)
    }

    pub fn as_str(self) -> &'static str {
        self.expected_type().as_str()
    }

    /// Column carrying this slot's reference in the system of record.
    pub fn column(self) -> &'static str {
        match self {
            Self::RoleDefinition => "role_definition_id",
            Self::SafetyPolicy => "safety_policy_id",
            Self::ReasoningFramework => "reasoning_framework_id",
            Self::RetrievalStrategy => "retrieval_strategy_id",
            Self::ProcessGuide => "process_guide_id",
            Self::CommunicationStyle => "communication_style_id",
        }
    }

    /// Header prepended to this slot's section in the compiled prompt. The
    /// role definition opens the prompt and carries no header.
    pub fn section_header(self) -> Option<&'static str> {
        match self {
            Self::RoleDefinition => None,
            Self::SafetyPolicy => Some("Safety constraints:"),
            Self::ReasoningFramework => Some("Reasoning approach:"),
            Self::RetrievalStrategy => Some("Knowledge retrieval strategy:"),
            Self::ProcessGuide => Some("Working process:"),
            Self::CommunicationStyle => Some("Communication style:"),
        }
    }
}

impl fmt::Display for PromptSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
