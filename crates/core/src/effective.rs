use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentConfig, AgentConfigId, ToolCallStrategy};
use crate::domain::llm::LlmParameters;
use crate::domain::template::{PromptTemplate, TemplateId};
use crate::slots::PromptSlot;

/// One assembled prompt section: a slot filled by a specific template
/// version. Sections keep the component's identity so downstream cache
/// busting can track exactly which versions went in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptSection {
    pub slot: PromptSlot,
    pub template_id: TemplateId,
    pub template_name: String,
    pub version: i64,
    pub content: String,
}

/// Fully assembled behavioral configuration for one agent, ready for the
/// serving layer. Section order is fixed; absent optional sections are
/// omitted, never reordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub agent_config_id: AgentConfigId,
    pub agent_name: String,
    pub sections: Vec<PromptSection>,
    pub llm: LlmParameters,
    pub enabled_tools: BTreeSet<String>,
    pub tool_call_strategy: ToolCallStrategy,
    pub max_iterations: i64,
    pub timeout_secs: i64,
    /// blake3 over every included component version plus runtime parameters;
    /// doubles as the cache key suffix and the downstream cache-busting tag.
    pub content_hash: String,
}

/// Assemble sections in fixed precedence from whatever components resolved.
/// `components` may arrive in any order and with any subset of optional
/// slots; the role definition must be present (the resolver enforces that
/// before calling in).
pub fn assemble(
    agent: &AgentConfig,
    components: Vec<(PromptSlot, PromptTemplate)>,
    llm: LlmParameters,
) -> EffectiveConfig {
    let mut by_slot: BTreeMap<usize, PromptSection> = BTreeMap::new();
    for (slot, template) in components {
        let position = PromptSlot::SECTION_ORDER
            .iter()
            .position(|candidate| *candidate == slot)
            .unwrap_or(PromptSlot::SECTION_ORDER.len());
        by_slot.insert(
            position,
            PromptSection {
                slot,
                template_id: template.id.clone(),
                template_name: template.name.clone(),
                version: template.version,
                content: template.template.clone(),
            },
        );
    }
    let sections: Vec<PromptSection> = by_slot.into_values().collect();

    let content_hash = content_hash(agent, &sections, &llm);

    EffectiveConfig {
        agent_config_id: agent.id.clone(),
        agent_name: agent.name.clone(),
        sections,
        llm,
        enabled_tools: agent.enabled_tools.clone(),
        tool_call_strategy: agent.tool_call_strategy,
        max_iterations: agent.max_iterations,
        timeout_secs: agent.timeout_secs,
        content_hash,
    }
}

fn content_hash(agent: &AgentConfig, sections: &[PromptSection], llm: &LlmParameters) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(agent.id.0.as_bytes());
    for section in sections {
        hasher.update(section.slot.as_str().as_bytes());
        hasher.update(section.template_id.0.as_bytes());
        hasher.update(section.version.to_le_bytes().as_slice());
        hasher.update(section.content.as_bytes());
    }
    hasher.update(llm.llm_config_id.0.as_bytes());
    hasher.update(llm.model_name.as_bytes());
    hasher.update(llm.llm_type.as_bytes());
    hasher.update(llm.temperature.to_le_bytes().as_slice());
    hasher.update(llm.max_tokens.unwrap_or(-1).to_le_bytes().as_slice());
    hasher.update(llm.extra_params.to_string().as_bytes());
    for tool in &agent.enabled_tools {
        hasher.update(tool.as_bytes());
    }
    hasher.update(agent.tool_call_strategy.as_str().as_bytes());
    hasher.update(agent.max_iterations.to_le_bytes().as_slice());
    hasher.update(agent.timeout_secs.to_le_bytes().as_slice());
    hasher.finalize().to_hex().to_string()
}

/// Plain `{name}` placeholder replacement. Unknown placeholders pass through
/// untouched.
pub fn substitute_variables(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    for (name, value) in variables {
        result = result.replace(&format!("{{{name}}}"), value);
    }
    result
}

impl EffectiveConfig {
    /// Join the ordered sections into one prompt string. Each optional
    /// section is introduced by its header; the role definition opens the
    /// prompt bare.
    pub fn compiled_prompt(&self, variables: &BTreeMap<String, String>) -> String {
        let mut parts = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            let content = substitute_variables(&section.content, variables);
            match section.slot.section_header() {
                Some(header) => parts.push(format!("{header}\n{content}")),
                None => parts.push(content),
            }
        }
        parts.join("\n\n")
    }
}
