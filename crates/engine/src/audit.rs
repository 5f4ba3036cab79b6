//! Read side of the change log. Appends happen inside the repository as part
//! of each mutation; this facade only queries.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use persona_core::domain::changelog::{ChangeLogEntry, EntityKind};
use persona_core::errors::ConfigError;
use persona_db::repositories::ChangeLogStore;

use crate::repository::storage_error;

pub struct AuditLog {
    change_log: Arc<dyn ChangeLogStore>,
}

impl AuditLog {
    pub fn new(change_log: Arc<dyn ChangeLogStore>) -> Self {
        Self { change_log }
    }

    /// History for one entity, newest first, optionally bounded to a time
    /// range. Rollback tooling feeds an entry's `old_values` back through
    /// `ConfigRepository::restore_agent_config`.
    pub async fn query(
        &self,
        config_type: EntityKind,
        config_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<ChangeLogEntry>, ConfigError> {
        self.change_log.query(config_type, config_id, range).await.map_err(storage_error)
    }

    /// The most recent entry for one entity, if any.
    pub async fn latest(
        &self,
        config_type: EntityKind,
        config_id: &str,
    ) -> Result<Option<ChangeLogEntry>, ConfigError> {
        let mut entries = self.query(config_type, config_id, None).await?;
        Ok(if entries.is_empty() { None } else { Some(entries.remove(0)) })
    }
}
