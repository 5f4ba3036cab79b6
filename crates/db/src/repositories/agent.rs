use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::Row;

use persona_core::domain::agent::{AgentConfig, AgentConfigId, ToolCallStrategy};
use persona_core::domain::llm::LlmConfigId;
use persona_core::domain::template::TemplateId;

use super::{map_insert_error, AgentConfigStore, RepositoryError, UpdateOutcome};
use crate::DbPool;

pub struct SqlAgentConfigStore {
    pool: DbPool,
}

impl SqlAgentConfigStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const AGENT_COLUMNS: &str = "id, name, agent_type, role_definition_id, reasoning_framework_id,
        retrieval_strategy_id, safety_policy_id, process_guide_id, llm_config_id, enabled_tools,
        tool_call_strategy, max_iterations, timeout, extra_params, description, is_usable,
        revision, created_at, updated_at";

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{raw}`: {e}")))
}

fn row_to_agent_config(row: &sqlx::sqlite::SqliteRow) -> Result<AgentConfig, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let agent_type: String =
        row.try_get("agent_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let role_definition_id: String =
        row.try_get("role_definition_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let reasoning_framework_id: Option<String> = row
        .try_get("reasoning_framework_id")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let retrieval_strategy_id: Option<String> = row
        .try_get("retrieval_strategy_id")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let safety_policy_id: Option<String> =
        row.try_get("safety_policy_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let process_guide_id: Option<String> =
        row.try_get("process_guide_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let llm_config_id: String =
        row.try_get("llm_config_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let enabled_tools_raw: String =
        row.try_get("enabled_tools").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tool_call_strategy_raw: String =
        row.try_get("tool_call_strategy").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let max_iterations: i64 =
        row.try_get("max_iterations").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let timeout: i64 =
        row.try_get("timeout").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let extra_params_raw: String =
        row.try_get("extra_params").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let description: Option<String> =
        row.try_get("description").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_usable: bool =
        row.try_get("is_usable").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let revision: i64 =
        row.try_get("revision").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let enabled_tools: BTreeSet<String> = serde_json::from_str::<Vec<String>>(&enabled_tools_raw)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?
        .into_iter()
        .collect();
    let tool_call_strategy: ToolCallStrategy = tool_call_strategy_raw.parse().map_err(|_| {
        RepositoryError::Decode(format!("unknown tool_call_strategy `{tool_call_strategy_raw}`"))
    })?;
    let extra_params: serde_json::Value = serde_json::from_str(&extra_params_raw)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(AgentConfig {
        id: AgentConfigId(id),
        name,
        agent_type,
        role_definition_id: TemplateId(role_definition_id),
        reasoning_framework_id: reasoning_framework_id.map(TemplateId),
        retrieval_strategy_id: retrieval_strategy_id.map(TemplateId),
        safety_policy_id: safety_policy_id.map(TemplateId),
        process_guide_id: process_guide_id.map(TemplateId),
        llm_config_id: LlmConfigId(llm_config_id),
        enabled_tools,
        tool_call_strategy,
        max_iterations,
        timeout_secs: timeout,
        extra_params,
        description,
        is_usable,
        revision,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn tools_json(tools: &BTreeSet<String>) -> String {
    serde_json::to_string(&tools.iter().collect::<Vec<_>>()).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait::async_trait]
impl AgentConfigStore for SqlAgentConfigStore {
    async fn insert(&self, config: AgentConfig) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_configs (id, name, agent_type, role_definition_id,
                                        reasoning_framework_id, retrieval_strategy_id,
                                        safety_policy_id, process_guide_id, llm_config_id,
                                        enabled_tools, tool_call_strategy, max_iterations,
                                        timeout, extra_params, description, is_usable,
                                        revision, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.id.0)
        .bind(&config.name)
        .bind(&config.agent_type)
        .bind(&config.role_definition_id.0)
        .bind(config.reasoning_framework_id.as_ref().map(|t| t.0.clone()))
        .bind(config.retrieval_strategy_id.as_ref().map(|t| t.0.clone()))
        .bind(config.safety_policy_id.as_ref().map(|t| t.0.clone()))
        .bind(config.process_guide_id.as_ref().map(|t| t.0.clone()))
        .bind(&config.llm_config_id.0)
        .bind(tools_json(&config.enabled_tools))
        .bind(config.tool_call_strategy.as_str())
        .bind(config.max_iterations)
        .bind(config.timeout_secs)
        .bind(config.extra_params.to_string())
        .bind(&config.description)
        .bind(config.is_usable)
        .bind(config.revision)
        .bind(config.created_at.to_rfc3339())
        .bind(config.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &format!("agent config `{}`", config.name)))?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &AgentConfigId,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agent_configs WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_agent_config(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<AgentConfig>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agent_configs WHERE name = ?"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_agent_config(r)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<AgentConfig>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> =
            sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agent_configs ORDER BY name"))
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(row_to_agent_config).collect::<Result<Vec<_>, _>>()
    }

    async fn update_with_revision(
        &self,
        config: &AgentConfig,
        expected_revision: i64,
    ) -> Result<UpdateOutcome, RepositoryError> {
        let result = sqlx::query(
            "UPDATE agent_configs
             SET name = ?, agent_type = ?, role_definition_id = ?, reasoning_framework_id = ?,
                 retrieval_strategy_id = ?, safety_policy_id = ?, process_guide_id = ?,
                 llm_config_id = ?, enabled_tools = ?, tool_call_strategy = ?,
                 max_iterations = ?, timeout = ?, extra_params = ?, description = ?,
                 is_usable = ?, revision = ?, updated_at = ?
             WHERE id = ? AND revision = ?",
        )
        .bind(&config.name)
        .bind(&config.agent_type)
        .bind(&config.role_definition_id.0)
        .bind(config.reasoning_framework_id.as_ref().map(|t| t.0.clone()))
        .bind(config.retrieval_strategy_id.as_ref().map(|t| t.0.clone()))
        .bind(config.safety_policy_id.as_ref().map(|t| t.0.clone()))
        .bind(config.process_guide_id.as_ref().map(|t| t.0.clone()))
        .bind(&config.llm_config_id.0)
        .bind(tools_json(&config.enabled_tools))
        .bind(config.tool_call_strategy.as_str())
        .bind(config.max_iterations)
        .bind(config.timeout_secs)
        .bind(config.extra_params.to_string())
        .bind(&config.description)
        .bind(config.is_usable)
        .bind(config.revision)
        .bind(config.updated_at.to_rfc3339())
        .bind(&config.id.0)
        .bind(expected_revision)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &format!("agent config `{}`", config.name)))?;

        if result.rows_affected() > 0 {
            return Ok(UpdateOutcome::Updated);
        }

        let exists = sqlx::query("SELECT 1 AS present FROM agent_configs WHERE id = ?")
            .bind(&config.id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() { UpdateOutcome::StaleRevision } else { UpdateOutcome::Missing })
    }

    async fn delete(&self, id: &AgentConfigId) -> Result<bool, RepositoryError> {
        // agent_profiles rows go with it via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM agent_configs WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
