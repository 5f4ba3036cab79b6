use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::Row;

use persona_core::domain::llm::{LlmConfig, LlmConfigId};

use super::{map_insert_error, LlmConfigStore, LlmDeleteOutcome, RepositoryError};
use crate::DbPool;

pub struct SqlLlmConfigStore {
    pool: DbPool,
}

impl SqlLlmConfigStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const LLM_COLUMNS: &str = "id, name, llm_type, model_name, temperature, max_tokens, api_key,
        base_url, timeout, max_retries, extra_params, description, is_usable,
        created_at, updated_at";

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{raw}`: {e}")))
}

fn row_to_llm_config(row: &sqlx::sqlite::SqliteRow) -> Result<LlmConfig, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let llm_type: String =
        row.try_get("llm_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let model_name: String =
        row.try_get("model_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let temperature: f64 =
        row.try_get("temperature").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let max_tokens: Option<i64> =
        row.try_get("max_tokens").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let api_key: Option<String> =
        row.try_get("api_key").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let base_url: Option<String> =
        row.try_get("base_url").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let timeout: i64 =
        row.try_get("timeout").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let max_retries: i64 =
        row.try_get("max_retries").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let extra_params_raw: String =
        row.try_get("extra_params").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let description: Option<String> =
        row.try_get("description").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let is_usable: bool =
        row.try_get("is_usable").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let extra_params: serde_json::Value = serde_json::from_str(&extra_params_raw)
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(LlmConfig {
        id: LlmConfigId(id),
        name,
        llm_type,
        model_name,
        temperature,
        max_tokens,
        api_key: api_key.map(SecretString::from),
        base_url,
        timeout_secs: timeout,
        max_retries,
        extra_params,
        description,
        is_usable,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[async_trait::async_trait]
impl LlmConfigStore for SqlLlmConfigStore {
    async fn insert(&self, config: LlmConfig) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO llm_configs (id, name, llm_type, model_name, temperature, max_tokens,
                                      api_key, base_url, timeout, max_retries, extra_params,
                                      description, is_usable, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.id.0)
        .bind(&config.name)
        .bind(&config.llm_type)
        .bind(&config.model_name)
        .bind(config.temperature)
        .bind(config.max_tokens)
        .bind(config.api_key.as_ref().map(|key| key.expose_secret().to_string()))
        .bind(&config.base_url)
        .bind(config.timeout_secs)
        .bind(config.max_retries)
        .bind(config.extra_params.to_string())
        .bind(&config.description)
        .bind(config.is_usable)
        .bind(config.created_at.to_rfc3339())
        .bind(config.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &format!("llm config `{}`", config.name)))?;

        Ok(())
    }

    async fn find_by_id(&self, id: &LlmConfigId) -> Result<Option<LlmConfig>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LLM_COLUMNS} FROM llm_configs WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_llm_config(r)?)),
            None => Ok(None),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<LlmConfig>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LLM_COLUMNS} FROM llm_configs WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_llm_config(r)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, config: LlmConfig) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE llm_configs
             SET name = ?, llm_type = ?, model_name = ?, temperature = ?, max_tokens = ?,
                 api_key = ?, base_url = ?, timeout = ?, max_retries = ?, extra_params = ?,
                 description = ?, is_usable = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&config.name)
        .bind(&config.llm_type)
        .bind(&config.model_name)
        .bind(config.temperature)
        .bind(config.max_tokens)
        .bind(config.api_key.as_ref().map(|key| key.expose_secret().to_string()))
        .bind(&config.base_url)
        .bind(config.timeout_secs)
        .bind(config.max_retries)
        .bind(config.extra_params.to_string())
        .bind(&config.description)
        .bind(config.is_usable)
        .bind(config.updated_at.to_rfc3339())
        .bind(&config.id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &format!("llm config `{}`", config.name)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &LlmConfigId) -> Result<LlmDeleteOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 AS present FROM llm_configs WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Ok(LlmDeleteOutcome::NotFound);
        }

        let referencing_agents: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM agent_configs WHERE llm_config_id = ?")
                .bind(&id.0)
                .fetch_one(&mut *tx)
                .await?
                .try_get("count")
                .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        if referencing_agents > 0 {
            tx.rollback().await?;
            return Ok(LlmDeleteOutcome::BlockedByReference { referencing_agents });
        }

        sqlx::query("DELETE FROM llm_configs WHERE id = ?").bind(&id.0).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(LlmDeleteOutcome::Deleted)
    }
}
