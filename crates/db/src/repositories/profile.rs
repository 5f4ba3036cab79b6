use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::Row;

use persona_core::domain::agent::AgentConfigId;
use persona_core::domain::profile::{AgentProfile, ProfileId};
use persona_core::domain::template::TemplateId;

use super::{map_insert_error, ProfileStore, RepositoryError};
use crate::DbPool;

pub struct SqlProfileStore {
    pool: DbPool,
}

impl SqlProfileStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const PROFILE_COLUMNS: &str = "id, agent_config_id, display_name, avatar_url, language,
        communication_style_id, personality_tags, expertise_domains, max_context_length,
        is_public, custom_metadata, is_usable, created_at, updated_at";

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{raw}`: {e}")))
}

fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<AgentProfile, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let agent_config_id: String =
        row.try_get("agent_config_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let display_name: String =
        row.try_get("display_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let avatar_url: Option<String> =
        row.try_get("avatar_url").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let language: String =
        row.try_get("language").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let communication_style_id: Option<String> = row
        .try_get("communication_style_id")
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let personality_tags_raw: String =
        row.try_get("personality_tags").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let expertise_domains_raw: String =
        row.try_get("expertise_domains").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let max_context_length: Option<i64> =
        row.try_get("max_context_length").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_public: bool =
        row.try_get("is_public").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let custom_metadata_raw: String =
        row.try_get("custom_metadata").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_usable: bool =
        row.try_get("is_usable").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let personality_tags: BTreeSet<String> =
        serde_json::from_str::<Vec<String>>(&personality_tags_raw)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?
            .into_iter()
            .collect();
    let expertise_domains: serde_json::Value = serde_json::from_str(&expertise_domains_raw)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let custom_metadata: serde_json::Value = serde_json::from_str(&custom_metadata_raw)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(AgentProfile {
        id: ProfileId(id),
        agent_config_id: AgentConfigId(agent_config_id),
        display_name,
        avatar_url,
        language,
        communication_style_id: communication_style_id.map(TemplateId),
        personality_tags,
        expertise_domains,
        max_context_length,
        is_public,
        custom_metadata,
        is_usable,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn tags_json(tags: &BTreeSet<String>) -> String {
    serde_json::to_string(&tags.iter().collect::<Vec<_>>()).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait::async_trait]
impl ProfileStore for SqlProfileStore {
    async fn insert(&self, profile: AgentProfile) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_profiles (id, agent_config_id, display_name, avatar_url, language,
                                         communication_style_id, personality_tags,
                                         expertise_domains, max_context_length, is_public,
                                         custom_metadata, is_usable, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&profile.id.0)
        .bind(&profile.agent_config_id.0)
        .bind(&profile.display_name)
        .bind(&profile.avatar_url)
        .bind(&profile.language)
        .bind(profile.communication_style_id.as_ref().map(|t| t.0.clone()))
        .bind(tags_json(&profile.personality_tags))
        .bind(profile.expertise_domains.to_string())
        .bind(profile.max_context_length)
        .bind(profile.is_public)
        .bind(profile.custom_metadata.to_string())
        .bind(profile.is_usable)
        .bind(profile.created_at.to_rfc3339())
        .bind(profile.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            map_insert_error(e, &format!("profile for agent `{}`", profile.agent_config_id.0))
        })?;

        Ok(())
    }

    async fn find_by_id(&self, id: &ProfileId) -> Result<Option<AgentProfile>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {PROFILE_COLUMNS} FROM agent_profiles WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_profile(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_agent(
        &self,
        agent_config_id: &AgentConfigId,
    ) -> Result<Option<AgentProfile>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM agent_profiles WHERE agent_config_id = ?"
        ))
        .bind(&agent_config_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_profile(r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, profile: AgentProfile) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE agent_profiles
             SET display_name = ?, avatar_url = ?, language = ?, communication_style_id = ?,
                 personality_tags = ?, expertise_domains = ?, max_context_length = ?,
                 is_public = ?, custom_metadata = ?, is_usable = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&profile.display_name)
        .bind(&profile.avatar_url)
        .bind(&profile.language)
        .bind(profile.communication_style_id.as_ref().map(|t| t.0.clone()))
        .bind(tags_json(&profile.personality_tags))
        .bind(profile.expertise_domains.to_string())
        .bind(profile.max_context_length)
        .bind(profile.is_public)
        .bind(profile.custom_metadata.to_string())
        .bind(profile.is_usable)
        .bind(profile.updated_at.to_rfc3339())
        .bind(&profile.id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &ProfileId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM agent_profiles WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
