use chrono::{DateTime, Utc};
use sqlx::Row;

use persona_core::domain::changelog::{ChangeLogEntry, EntityKind, Operation};

use super::{ChangeLogStore, RepositoryError};
use crate::DbPool;

pub struct SqlChangeLogStore {
    pool: DbPool,
}

impl SqlChangeLogStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const LOG_COLUMNS: &str = "id, config_type, config_id, operation, old_values, new_values,
        change_reason, actor, ip_address, user_agent, created_at";

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp `{raw}`: {e}")))
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>, RepositoryError> {
    match raw {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| RepositoryError::Decode(e.to_string())),
        None => Ok(None),
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<ChangeLogEntry, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let config_type_raw: String =
        row.try_get("config_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let config_id: String =
        row.try_get("config_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let operation_raw: String =
        row.try_get("operation").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let old_values_raw: Option<String> =
        row.try_get("old_values").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let new_values_raw: Option<String> =
        row.try_get("new_values").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let change_reason: Option<String> =
        row.try_get("change_reason").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor: Option<String> =
        row.try_get("actor").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let ip_address: Option<String> =
        row.try_get("ip_address").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let user_agent: Option<String> =
        row.try_get("user_agent").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let config_type: EntityKind = config_type_raw
        .parse()
        .map_err(|_| RepositoryError::Decode(format!("unknown config_type `{config_type_raw}`")))?;
    let operation: Operation = operation_raw
        .parse()
        .map_err(|_| RepositoryError::Decode(format!("unknown operation `{operation_raw}`")))?;

    Ok(ChangeLogEntry {
        id,
        config_type,
        config_id,
        operation,
        old_values: parse_json(old_values_raw)?,
        new_values: parse_json(new_values_raw)?,
        change_reason,
        actor,
        ip_address,
        user_agent,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait::async_trait]
impl ChangeLogStore for SqlChangeLogStore {
    async fn append(&self, entry: ChangeLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO config_change_logs (id, config_type, config_id, operation, old_values,
                                             new_values, change_reason, actor, ip_address,
                                             user_agent, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(entry.config_type.as_str())
        .bind(&entry.config_id)
        .bind(entry.operation.as_str())
        .bind(entry.old_values.as_ref().map(|v| v.to_string()))
        .bind(entry.new_values.as_ref().map(|v| v.to_string()))
        .bind(&entry.change_reason)
        .bind(&entry.actor)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(
        &self,
        config_type: EntityKind,
        config_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<ChangeLogEntry>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = if let Some((from, to)) = range {
            sqlx::query(&format!(
                "SELECT {LOG_COLUMNS} FROM config_change_logs
                 WHERE config_type = ? AND config_id = ? AND created_at >= ? AND created_at <= ?
                 ORDER BY created_at DESC, id DESC"
            ))
            .bind(config_type.as_str())
            .bind(config_id)
            .bind(from.to_rfc3339())
            .bind(to.to_rfc3339())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {LOG_COLUMNS} FROM config_change_logs
                 WHERE config_type = ? AND config_id = ?
                 ORDER BY created_at DESC, id DESC"
            ))
            .bind(config_type.as_str())
            .bind(config_id)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use persona_core::domain::changelog::{
        ChangeLogEntry, EntityKind, MutationContext, Operation,
    };

    use super::SqlChangeLogStore;
    use crate::repositories::ChangeLogStore;
    use crate::{connect_with, migrations, PoolSettings};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with("sqlite::memory:", &PoolSettings::single_connection()).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn entry(config_id: &str, operation: Operation) -> ChangeLogEntry {
        ChangeLogEntry::record(
            EntityKind::AgentConfig,
            config_id,
            operation,
            None,
            Some(serde_json::json!({"name": "support-bot"})),
            &MutationContext::by("ops@example.com"),
        )
    }

    #[tokio::test]
    async fn append_and_query_round_trip() {
        let store = SqlChangeLogStore::new(setup().await);
        store.append(entry("A-1", Operation::Create)).await.expect("append");
        store.append(entry("A-1", Operation::Update)).await.expect("append");
        store.append(entry("A-2", Operation::Create)).await.expect("append");

        let entries =
            store.query(EntityKind::AgentConfig, "A-1", None).await.expect("query");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].actor.as_deref(), Some("ops@example.com"));
    }

    #[tokio::test]
    async fn query_honors_time_range() {
        let store = SqlChangeLogStore::new(setup().await);

        let mut old = entry("A-1", Operation::Create);
        old.created_at = Utc::now() - Duration::hours(2);
        store.append(old).await.expect("append old");
        store.append(entry("A-1", Operation::Update)).await.expect("append new");

        let recent = store
            .query(
                EntityKind::AgentConfig,
                "A-1",
                Some((Utc::now() - Duration::minutes(30), Utc::now() + Duration::minutes(1))),
            )
            .await
            .expect("query");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].operation, Operation::Update);
    }
}
