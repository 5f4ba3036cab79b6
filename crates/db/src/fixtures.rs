//! Demo dataset for local development and integration tests.

use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;

use persona_core::domain::agent::{AgentConfig, AgentConfigId, ToolCallStrategy};
use persona_core::domain::llm::{LlmConfig, LlmConfigId};
use persona_core::domain::profile::{AgentProfile, ProfileId};
use persona_core::domain::template::{PromptTemplate, TemplateId};
use persona_core::slots::PromptType;

use crate::repositories::{
    AgentConfigStore, LlmConfigStore, ProfileStore, RepositoryError, SqlAgentConfigStore,
    SqlLlmConfigStore, SqlProfileStore, SqlTemplateStore, TemplateStore,
};
use crate::DbPool;

const DEMO_ROLE: &str = "You are {agent_name}, a knowledgeable support assistant for \
{product_name}. Answer questions accurately, admit uncertainty, and keep responses \
focused on the user's problem.";

const DEMO_RETRIEVAL: &str = "Before answering, search the knowledge base for documents \
relevant to the user's question. Prefer recent documents over older ones. Cite the \
source of any retrieved fact you use. If no relevant document exists, say so instead \
of guessing.";

const DEMO_SAFETY: &str = "Never reveal credentials, internal URLs, or customer data \
belonging to other accounts. Decline requests that fall outside product support.";

/// Identifiers of the seeded rows, for tests and demos to reference.
#[derive(Clone, Debug)]
pub struct DemoDataset {
    pub role_template_id: TemplateId,
    pub retrieval_template_id: TemplateId,
    pub safety_template_id: TemplateId,
    pub llm_config_id: LlmConfigId,
    pub agent_config_id: AgentConfigId,
    pub profile_id: ProfileId,
}

fn template(name: &str, content: &str, kind: PromptType) -> PromptTemplate {
    let now = Utc::now();
    PromptTemplate {
        id: TemplateId(Uuid::new_v4().to_string()),
        name: name.to_string(),
        version: 1,
        template: content.to_string(),
        description: None,
        category: "demo".to_string(),
        variables: serde_json::json!({}),
        prompt_type: kind,
        usage_guidance: None,
        is_required: kind == PromptType::RoleDefinition,
        is_active: true,
        created_by: Some("seed".to_string()),
        updated_by: None,
        created_at: now,
        updated_at: now,
    }
}

/// Insert a small, fully wired dataset: three templates, one llm config, one
/// agent config and its profile. Idempotence is not attempted; call once per
/// fresh database.
pub async fn seed_demo_dataset(pool: &DbPool) -> Result<DemoDataset, RepositoryError> {
    let templates = SqlTemplateStore::new(pool.clone());
    let llm_configs = SqlLlmConfigStore::new(pool.clone());
    let agents = SqlAgentConfigStore::new(pool.clone());
    let profiles = SqlProfileStore::new(pool.clone());

    let role = template("demo_support_role", DEMO_ROLE, PromptType::RoleDefinition);
    let retrieval =
        template("demo_retrieval_strategy", DEMO_RETRIEVAL, PromptType::RetrievalStrategy);
    let safety = template("demo_safety_policy", DEMO_SAFETY, PromptType::SafetyPolicy);
    templates.insert(role.clone()).await?;
    templates.insert(retrieval.clone()).await?;
    templates.insert(safety.clone()).await?;

    let now = Utc::now();
    let llm = LlmConfig {
        id: LlmConfigId(Uuid::new_v4().to_string()),
        name: "demo-default".to_string(),
        llm_type: "openai".to_string(),
        model_name: "gpt-4o-mini".to_string(),
        temperature: 0.3,
        max_tokens: Some(4096),
        api_key: None,
        base_url: None,
        timeout_secs: 30,
        max_retries: 2,
        extra_params: serde_json::json!({}),
        description: Some("seeded demo model".to_string()),
        is_usable: true,
        created_at: now,
        updated_at: now,
    };
    llm_configs.insert(llm.clone()).await?;

    let agent = AgentConfig {
        id: AgentConfigId(Uuid::new_v4().to_string()),
        name: "demo-support-bot".to_string(),
        agent_type: "support".to_string(),
        role_definition_id: role.id.clone(),
        reasoning_framework_id: None,
        retrieval_strategy_id: Some(retrieval.id.clone()),
        safety_policy_id: Some(safety.id.clone()),
        process_guide_id: None,
        llm_config_id: llm.id.clone(),
        enabled_tools: BTreeSet::from(["kb_search".to_string()]),
        tool_call_strategy: ToolCallStrategy::Auto,
        max_iterations: 10,
        timeout_secs: 120,
        extra_params: serde_json::json!({}),
        description: Some("seeded demo agent".to_string()),
        is_usable: true,
        revision: 1,
        created_at: now,
        updated_at: now,
    };
    agents.insert(agent.clone()).await?;

    let profile = AgentProfile {
        id: ProfileId(Uuid::new_v4().to_string()),
        agent_config_id: agent.id.clone(),
        display_name: "Demo Support Bot".to_string(),
        avatar_url: None,
        language: "en".to_string(),
        communication_style_id: None,
        personality_tags: BTreeSet::from(["helpful".to_string(), "precise".to_string()]),
        expertise_domains: serde_json::json!(["product support"]),
        max_context_length: None,
        is_public: true,
        custom_metadata: serde_json::json!({}),
        is_usable: true,
        created_at: now,
        updated_at: now,
    };
    profiles.insert(profile.clone()).await?;

    Ok(DemoDataset {
        role_template_id: role.id,
        retrieval_template_id: retrieval.id,
        safety_template_id: safety.id,
        llm_config_id: llm.id,
        agent_config_id: agent.id,
        profile_id: profile.id,
    })
}

#[cfg(test)]
mod tests {
    use persona_core::slots::PromptType;

    use crate::repositories::{SqlTemplateStore, TemplateStore};
    use crate::{connect_with, migrations, PoolSettings};

    use super::seed_demo_dataset;

    #[tokio::test]
    async fn seed_produces_a_fully_wired_dataset() {
        let pool = connect_with("sqlite::memory:", &PoolSettings::single_connection()).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let dataset = seed_demo_dataset(&pool).await.expect("seed");

        let templates = SqlTemplateStore::new(pool.clone());
        let role = templates
            .find_by_id(&dataset.role_template_id)
            .await
            .expect("find")
            .expect("role exists");
        assert_eq!(role.prompt_type, PromptType::RoleDefinition);
        assert!(role.is_required);
    }
}
