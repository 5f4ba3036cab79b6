use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::Row;

use persona_core::domain::agent::AgentConfigId;
use persona_core::domain::template::{PromptTemplate, TemplateId};
use persona_core::slots::{PromptSlot, PromptType};

use super::{map_insert_error, RepositoryError, TemplateDeleteOutcome, TemplateStore};
use crate::DbPool;

pub struct SqlTemplateStore {
    pool: DbPool,
}

impl SqlTemplateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const TEMPLATE_COLUMNS: &str = "id, name, version, template, description, category, variables,
        prompt_type, usage_guidance, is_required, is_active, created_by, updated_by,
        created_at, updated_at";

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{raw}`: {e}")))
}

fn row_to_template(row: &sqlx::sqlite::SqliteRow) -> Result<PromptTemplate, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let version: i64 =
        row.try_get("version").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let template: String =
        row.try_get("template").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let description: Option<String> =
        row.try_get("description").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let category: String =
        row.try_get("category").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let variables_raw: String =
        row.try_get("variables").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let prompt_type_raw: String =
        row.try_get("prompt_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let usage_guidance: Option<String> =
        row.try_get("usage_guidance").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_required: bool =
        row.try_get("is_required").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_active: bool =
        row.try_get("is_active").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_by: Option<String> =
        row.try_get("created_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_by: Option<String> =
        row.try_get("updated_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let prompt_type: PromptType =
        prompt_type_raw.parse().map_err(|_| {
            RepositoryError::Decode(format!("unknown prompt_type `{prompt_type_raw}`"))
        })?;
    let variables: serde_json::Value = serde_json::from_str(&variables_raw)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(PromptTemplate {
        id: TemplateId(id),
        name,
        version,
        template,
        description,
        category,
        variables,
        prompt_type,
        usage_guidance,
        is_required,
        is_active,
        created_by,
        updated_by,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl TemplateStore for SqlTemplateStore {
    async fn insert(&self, template: PromptTemplate) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO prompt_templates (id, name, version, template, description, category,
                                           variables, prompt_type, usage_guidance, is_required,
                                           is_active, created_by, updated_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&template.id.0)
        .bind(&template.name)
        .bind(template.version)
        .bind(&template.template)
        .bind(&template.description)
        .bind(&template.category)
        .bind(template.variables.to_string())
        .bind(template.prompt_type.as_str())
        .bind(&template.usage_guidance)
        .bind(template.is_required)
        .bind(template.is_active)
        .bind(&template.created_by)
        .bind(&template.updated_by)
        .bind(template.created_at.to_rfc3339())
        .bind(template.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_insert_error(
                e,
                &format!("prompt template ({}, v{})", template.name, template.version),
            )
        })?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &TemplateId,
    ) -> Result<Option<PromptTemplate>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM prompt_templates WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_template(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_name_version(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<PromptTemplate>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM prompt_templates WHERE name = ? AND version = ?"
        ))
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_template(r)?)),
            None => Ok(None),
        }
    }

    async fn latest_version(&self, name: &str) -> Result<Option<i64>, RepositoryError> {
        let row = sqlx::query("SELECT MAX(version) AS version FROM prompt_templates WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        let version: Option<i64> =
            row.try_get("version").map_err(|e| RepositoryError::Decode(e.to_string()))?;
        Ok(version)
    }

    async fn latest_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PromptTemplate>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM prompt_templates
             WHERE name = ? AND is_active = 1
             ORDER BY version DESC
             LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_template(r)?)),
            None => Ok(None),
        }
    }

    async fn list_by_type(
        &self,
        prompt_type: PromptType,
        active_only: bool,
    ) -> Result<Vec<PromptTemplate>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = if active_only {
            sqlx::query(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM prompt_templates
                 WHERE prompt_type = ? AND is_active = 1
                 ORDER BY name, version"
            ))
            .bind(prompt_type.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM prompt_templates
                 WHERE prompt_type = ?
                 ORDER BY name, version"
            ))
            .bind(prompt_type.as_str())
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_template).collect::<Result<Vec<_>, _>>()
    }

    async fn set_active(
        &self,
        id: &TemplateId,
        active: bool,
        updated_by: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE prompt_templates
             SET is_active = ?, updated_by = COALESCE(?, updated_by), updated_at = ?
             WHERE id = ?",
        )
        .bind(active)
        .bind(updated_by)
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &TemplateId) -> Result<TemplateDeleteOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 AS present FROM prompt_templates WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(TemplateDeleteOutcome::NotFound);
        }

        let referencing_agents: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM agent_configs WHERE role_definition_id = ?",
        )
        .bind(&id.0)
        .fetch_one(&mut *tx)
        .await?
        .try_get("count")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        if referencing_agents > 0 {
            tx.rollback().await?;
            return Ok(TemplateDeleteOutcome::BlockedByRequiredReference { referencing_agents });
        }

        // Set-null pass over every optional slot, collecting the affected
        // agent configs so the caller can invalidate them.
        let now = Utc::now().to_rfc3339();
        let mut cleared: BTreeSet<String> = BTreeSet::new();
        for slot in [
            PromptSlot::ReasoningFramework,
            PromptSlot::RetrievalStrategy,
            PromptSlot::SafetyPolicy,
            PromptSlot::ProcessGuide,
        ] {
            let column = slot.column();
            let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
                "UPDATE agent_configs
                 SET {column} = NULL, revision = revision + 1, updated_at = ?
                 WHERE {column} = ?
                 RETURNING id"
            ))
            .bind(&now)
            .bind(&id.0)
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let agent_id: String =
                    row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
                cleared.insert(agent_id);
            }
        }

        let profile_rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "UPDATE agent_profiles
             SET communication_style_id = NULL, updated_at = ?
             WHERE communication_style_id = ?
             RETURNING agent_config_id",
        )
        .bind(&now)
        .bind(&id.0)
        .fetch_all(&mut *tx)
        .await?;
        for row in profile_rows {
            let agent_id: String = row
                .try_get("agent_config_id")
                .map_err(|e| RepositoryError::Decode(e.to_string()))?;
            cleared.insert(agent_id);
        }

        sqlx::query("DELETE FROM prompt_templates WHERE id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(TemplateDeleteOutcome::Deleted {
            cleared_agents: cleared.into_iter().map(AgentConfigId).collect(),
        })
    }
}
