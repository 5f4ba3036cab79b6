//! Mutation surface over the system of record. Every write validates
//! referential and type integrity first, then persists, appends exactly one
//! change-log entry and publishes one mutation event. Under write-through the
//! cache invalidation completes before the call returns.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use persona_core::config::{ConsistencyMode, EngineConfig};
use persona_core::domain::agent::{AgentConfig, AgentConfigId, AgentConfigPatch};
use persona_core::domain::changelog::{ChangeLogEntry, EntityKind, MutationContext, Operation};
use persona_core::domain::llm::{LlmConfig, LlmConfigId};
use persona_core::domain::profile::{AgentProfile, ProfileId};
use persona_core::domain::template::{PromptTemplate, TemplateDraft, TemplateId};
use persona_core::errors::ConfigError;
use persona_core::events::MutationEvent;
use persona_core::slots::PromptSlot;
use persona_db::repositories::{
    AgentConfigStore, ChangeLogStore, LlmConfigStore, LlmDeleteOutcome, ProfileStore,
    RepositoryError, TemplateDeleteOutcome, TemplateStore, UpdateOutcome,
};

use crate::sync::SyncCoordinator;

/// Lift a mechanical store failure into the caller-facing taxonomy.
pub(crate) fn storage_error(error: RepositoryError) -> ConfigError {
    match error {
        RepositoryError::UniqueViolation(what) => ConfigError::UniquenessViolation(what),
        other => ConfigError::Storage(other.to_string()),
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct ConfigRepository {
    templates: Arc<dyn TemplateStore>,
    llm_configs: Arc<dyn LlmConfigStore>,
    agents: Arc<dyn AgentConfigStore>,
    profiles: Arc<dyn ProfileStore>,
    change_log: Arc<dyn ChangeLogStore>,
    events: broadcast::Sender<MutationEvent>,
    coordinator: Option<Arc<SyncCoordinator>>,
    consistency: ConsistencyMode,
}

impl ConfigRepository {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        llm_configs: Arc<dyn LlmConfigStore>,
        agents: Arc<dyn AgentConfigStore>,
        profiles: Arc<dyn ProfileStore>,
        change_log: Arc<dyn ChangeLogStore>,
        config: &EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            templates,
            llm_configs,
            agents,
            profiles,
            change_log,
            events,
            coordinator: None,
            consistency: config.consistency,
        }
    }

    /// Attach the coordinator that synchronous (write-through) invalidation
    /// goes through. Write-behind deployments instead hand a subscription to
    /// [`SyncCoordinator::run`].
    pub fn with_coordinator(mut self, coordinator: Arc<SyncCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MutationEvent> {
        self.events.subscribe()
    }

    async fn committed(
        &self,
        entry: ChangeLogEntry,
        event: MutationEvent,
    ) -> Result<(), ConfigError> {
        if let Err(log_error) = self.change_log.append(entry).await {
            // The row is already persisted; surface the broken audit trail
            // instead of pretending the mutation failed.
            error!(event_name = "change_log_append_failed", error = %log_error);
            return Err(storage_error(log_error));
        }
        info!(
            event_name = "mutation_committed",
            kind = %event.kind,
            id = %event.id,
            operation = event.operation.as_str(),
        );
        if self.consistency == ConsistencyMode::WriteThrough {
            if let Some(coordinator) = &self.coordinator {
                coordinator.apply(&event).await;
            }
        }
        let _ = self.events.send(event);
        Ok(())
    }

    /// Fetch the template behind `id` and check it against `slot`'s expected
    /// type. Inactive templates are rejected at write time: as a missing
    /// required slot for the role, as an inactive reference otherwise.
    async fn validate_slot(
        &self,
        slot: PromptSlot,
        id: &TemplateId,
        agent_id: &str,
    ) -> Result<(), ConfigError> {
        let template = self
            .templates
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::DanglingReference { slot, id: id.0.clone() })?;
        if template.prompt_type != slot.expected_type() {
            return Err(ConfigError::TypeMismatch {
                slot,
                expected: slot.expected_type(),
                actual: template.prompt_type,
                id: id.0.clone(),
            });
        }
        if !template.is_active {
            if slot.is_required() {
                return Err(ConfigError::RequiredSlotMissing { agent_id: agent_id.to_string() });
            }
            return Err(ConfigError::InactiveReference { slot, id: id.0.clone() });
        }
        Ok(())
    }

    async fn validate_llm_reference(&self, id: &LlmConfigId) -> Result<(), ConfigError> {
        let llm = self
            .llm_configs
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::LlmConfig,
                id: id.0.clone(),
            })?;
        if !llm.is_usable {
            return Err(ConfigError::Validation(format!(
                "llm config `{}` is not usable",
                id.0
            )));
        }
        Ok(())
    }

    async fn validate_agent_config(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        self.validate_slot(PromptSlot::RoleDefinition, &config.role_definition_id, &config.id.0)
            .await?;
        for (slot, reference) in [
            (PromptSlot::SafetyPolicy, config.safety_policy_id.as_ref()),
            (PromptSlot::ReasoningFramework, config.reasoning_framework_id.as_ref()),
            (PromptSlot::RetrievalStrategy, config.retrieval_strategy_id.as_ref()),
            (PromptSlot::ProcessGuide, config.process_guide_id.as_ref()),
        ] {
            if let Some(reference) = reference {
                self.validate_slot(slot, reference, &config.id.0).await?;
            }
        }
        self.validate_llm_reference(&config.llm_config_id).await
    }

    // ------------------------------------------------------------------
    // Prompt templates
    // ------------------------------------------------------------------

    /// Publish version 1 of a new template name. An existing name is a
    /// uniqueness violation; content changes go through
    /// [`create_template_version`](Self::create_template_version).
    pub async fn create_template(
        &self,
        draft: TemplateDraft,
        context: &MutationContext,
    ) -> Result<PromptTemplate, ConfigError> {
        if self.templates.latest_version(&draft.name).await.map_err(storage_error)?.is_some() {
            return Err(ConfigError::UniquenessViolation(format!(
                "prompt template `{}` already exists; publish a new version instead",
                draft.name
            )));
        }
        self.insert_template_version(draft, 1, context).await
    }

    /// Publish the next version of an existing name. Published versions are
    /// immutable; this is the only way to change template content.
    pub async fn create_template_version(
        &self,
        draft: TemplateDraft,
        context: &MutationContext,
    ) -> Result<PromptTemplate, ConfigError> {
        let latest = self
            .templates
            .latest_version(&draft.name)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::PromptTemplate,
                id: draft.name.clone(),
            })?;
        self.insert_template_version(draft, latest + 1, context).await
    }

    async fn insert_template_version(
        &self,
        draft: TemplateDraft,
        version: i64,
        context: &MutationContext,
    ) -> Result<PromptTemplate, ConfigError> {
        let now = Utc::now();
        let template = PromptTemplate {
            id: TemplateId(Uuid::new_v4().to_string()),
            name: draft.name,
            version,
            template: draft.template,
            description: draft.description,
            category: draft.category,
            variables: draft.variables,
            prompt_type: draft.prompt_type,
            usage_guidance: draft.usage_guidance,
            is_required: draft.is_required,
            is_active: true,
            created_by: draft.created_by,
            updated_by: None,
            created_at: now,
            updated_at: now,
        };
        self.templates.insert(template.clone()).await.map_err(storage_error)?;

        let snapshot = serde_json::to_value(&template).unwrap_or(serde_json::Value::Null);
        self.committed(
            ChangeLogEntry::record(
                EntityKind::PromptTemplate,
                template.id.0.clone(),
                Operation::Create,
                None,
                Some(snapshot),
                context,
            ),
            MutationEvent::new(EntityKind::PromptTemplate, template.id.0.clone(), Operation::Create),
        )
        .await?;
        Ok(template)
    }

    /// Activate or deactivate one published version in place. Content is
    /// untouched.
    pub async fn set_template_active(
        &self,
        id: &TemplateId,
        active: bool,
        context: &MutationContext,
    ) -> Result<PromptTemplate, ConfigError> {
        let old = self
            .templates
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::PromptTemplate,
                id: id.0.clone(),
            })?;
        self.templates
            .set_active(id, active, context.actor.as_deref())
            .await
            .map_err(storage_error)?;
        let updated = self
            .templates
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::PromptTemplate,
                id: id.0.clone(),
            })?;

        self.committed(
            ChangeLogEntry::record(
                EntityKind::PromptTemplate,
                id.0.clone(),
                Operation::Update,
                Some(serde_json::to_value(&old).unwrap_or(serde_json::Value::Null)),
                Some(serde_json::to_value(&updated).unwrap_or(serde_json::Value::Null)),
                context,
            ),
            MutationEvent::new(EntityKind::PromptTemplate, id.0.clone(), Operation::Update),
        )
        .await?;
        Ok(updated)
    }

    /// Delete a template version under restrict/set-null semantics: blocked
    /// while any agent config holds it in the required role slot; optional
    /// references are cleared in the same transaction and the affected agent
    /// configs are invalidated.
    pub async fn delete_template(
        &self,
        id: &TemplateId,
        context: &MutationContext,
    ) -> Result<(), ConfigError> {
        let old = self
            .templates
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::PromptTemplate,
                id: id.0.clone(),
            })?;

        let cleared_agents = match self.templates.delete(id).await.map_err(storage_error)? {
            TemplateDeleteOutcome::NotFound => {
                return Err(ConfigError::NotFound {
                    kind: EntityKind::PromptTemplate,
                    id: id.0.clone(),
                })
            }
            TemplateDeleteOutcome::BlockedByRequiredReference { referencing_agents } => {
                return Err(ConfigError::ReferentialIntegrity(format!(
                    "template `{}` is the role_definition of {referencing_agents} agent config(s)",
                    id.0
                )))
            }
            TemplateDeleteOutcome::Deleted { cleared_agents } => cleared_agents,
        };

        self.committed(
            ChangeLogEntry::record(
                EntityKind::PromptTemplate,
                id.0.clone(),
                Operation::Delete,
                Some(serde_json::to_value(&old).unwrap_or(serde_json::Value::Null)),
                None,
                context,
            ),
            MutationEvent::new(EntityKind::PromptTemplate, id.0.clone(), Operation::Delete),
        )
        .await?;

        // The set-null pass rewrote these rows; their cached effective
        // configurations are now stale.
        for agent in cleared_agents {
            let event = MutationEvent::new(EntityKind::AgentConfig, agent.0, Operation::Update);
            if self.consistency == ConsistencyMode::WriteThrough {
                if let Some(coordinator) = &self.coordinator {
                    coordinator.apply(&event).await;
                }
            }
            let _ = self.events.send(event);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // LLM configs
    // ------------------------------------------------------------------

    pub async fn create_llm_config(
        &self,
        config: LlmConfig,
        context: &MutationContext,
    ) -> Result<LlmConfig, ConfigError> {
        self.llm_configs.insert(config.clone()).await.map_err(storage_error)?;
        self.committed(
            ChangeLogEntry::record(
                EntityKind::LlmConfig,
                config.id.0.clone(),
                Operation::Create,
                None,
                Some(config.snapshot()),
                context,
            ),
            MutationEvent::new(EntityKind::LlmConfig, config.id.0.clone(), Operation::Create),
        )
        .await?;
        Ok(config)
    }

    pub async fn update_llm_config(
        &self,
        config: LlmConfig,
        context: &MutationContext,
    ) -> Result<LlmConfig, ConfigError> {
        let old = self
            .llm_configs
            .find_by_id(&config.id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::LlmConfig,
                id: config.id.0.clone(),
            })?;
        if !self.llm_configs.update(config.clone()).await.map_err(storage_error)? {
            return Err(ConfigError::NotFound {
                kind: EntityKind::LlmConfig,
                id: config.id.0.clone(),
            });
        }
        self.committed(
            ChangeLogEntry::record(
                EntityKind::LlmConfig,
                config.id.0.clone(),
                Operation::Update,
                Some(old.snapshot()),
                Some(config.snapshot()),
                context,
            ),
            MutationEvent::new(EntityKind::LlmConfig, config.id.0.clone(), Operation::Update),
        )
        .await?;
        Ok(config)
    }

    /// Restrict semantics: fails while any agent config references it.
    pub async fn delete_llm_config(
        &self,
        id: &LlmConfigId,
        context: &MutationContext,
    ) -> Result<(), ConfigError> {
        let old = self
            .llm_configs
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::LlmConfig,
                id: id.0.clone(),
            })?;
        match self.llm_configs.delete(id).await.map_err(storage_error)? {
            LlmDeleteOutcome::NotFound => {
                return Err(ConfigError::NotFound {
                    kind: EntityKind::LlmConfig,
                    id: id.0.clone(),
                })
            }
            LlmDeleteOutcome::BlockedByReference { referencing_agents } => {
                return Err(ConfigError::ReferentialIntegrity(format!(
                    "llm config `{}` is referenced by {referencing_agents} agent config(s)",
                    id.0
                )))
            }
            LlmDeleteOutcome::Deleted => {}
        }
        self.committed(
            ChangeLogEntry::record(
                EntityKind::LlmConfig,
                id.0.clone(),
                Operation::Delete,
                Some(old.snapshot()),
                None,
                context,
            ),
            MutationEvent::new(EntityKind::LlmConfig, id.0.clone(), Operation::Delete),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Agent configs
    // ------------------------------------------------------------------

    /// Validate every slot and persist. Nothing is written when validation
    /// fails; a misassigned slot is rejected, never coerced.
    pub async fn create_agent_config(
        &self,
        mut config: AgentConfig,
        context: &MutationContext,
    ) -> Result<AgentConfig, ConfigError> {
        self.validate_agent_config(&config).await?;
        config.revision = 1;
        self.agents.insert(config.clone()).await.map_err(storage_error)?;
        self.committed(
            ChangeLogEntry::record(
                EntityKind::AgentConfig,
                config.id.0.clone(),
                Operation::Create,
                None,
                Some(config.snapshot()),
                context,
            ),
            MutationEvent::new(EntityKind::AgentConfig, config.id.0.clone(), Operation::Create),
        )
        .await?;
        Ok(config)
    }

    /// Optimistic-concurrency update. `expected_revision` is the revision the
    /// caller last read; a stale value yields `Conflict` and no write.
    pub async fn update_agent_config(
        &self,
        id: &AgentConfigId,
        patch: AgentConfigPatch,
        expected_revision: i64,
        context: &MutationContext,
    ) -> Result<AgentConfig, ConfigError> {
        let current = self
            .agents
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::AgentConfig,
                id: id.0.clone(),
            })?;
        // An empty patch is a no-op, but only for a caller holding the
        // current revision.
        if patch.is_empty() {
            if current.revision != expected_revision {
                return Err(ConfigError::Conflict { id: id.0.clone(), expected: expected_revision });
            }
            return Ok(current);
        }

        let mut next = patch.apply_to(&current);

        if patch.role_definition_id.is_some() {
            self.validate_slot(PromptSlot::RoleDefinition, &next.role_definition_id, &id.0)
                .await?;
        }
        for (slot, reference) in patch.changed_optional_slots() {
            if let Some(reference) = reference {
                self.validate_slot(slot, reference, &id.0).await?;
            }
        }
        if patch.llm_config_id.is_some() {
            self.validate_llm_reference(&next.llm_config_id).await?;
        }

        next.revision = current.revision + 1;
        next.updated_at = Utc::now();

        match self
            .agents
            .update_with_revision(&next, expected_revision)
            .await
            .map_err(storage_error)?
        {
            UpdateOutcome::Updated => {}
            UpdateOutcome::StaleRevision => {
                return Err(ConfigError::Conflict { id: id.0.clone(), expected: expected_revision })
            }
            UpdateOutcome::Missing => {
                return Err(ConfigError::NotFound {
                    kind: EntityKind::AgentConfig,
                    id: id.0.clone(),
                })
            }
        }

        self.committed(
            ChangeLogEntry::record(
                EntityKind::AgentConfig,
                id.0.clone(),
                Operation::Update,
                Some(current.snapshot()),
                Some(next.snapshot()),
                context,
            ),
            MutationEvent::new(EntityKind::AgentConfig, id.0.clone(), Operation::Update),
        )
        .await?;
        Ok(next)
    }

    /// Reapply a prior change-log snapshot as a normal optimistic-concurrency
    /// update. The log itself is never rewritten.
    pub async fn restore_agent_config(
        &self,
        id: &AgentConfigId,
        snapshot: &serde_json::Value,
        expected_revision: i64,
        context: &MutationContext,
    ) -> Result<AgentConfig, ConfigError> {
        let mut restored: AgentConfig = serde_json::from_value(snapshot.clone())
            .map_err(|e| ConfigError::Validation(format!("malformed snapshot: {e}")))?;
        if restored.id != *id {
            return Err(ConfigError::Validation(format!(
                "snapshot belongs to `{}`, not `{}`",
                restored.id.0, id.0
            )));
        }
        let current = self
            .agents
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::AgentConfig,
                id: id.0.clone(),
            })?;

        // The snapshot may reference components deleted since it was taken.
        self.validate_agent_config(&restored).await?;

        restored.revision = current.revision + 1;
        restored.updated_at = Utc::now();

        match self
            .agents
            .update_with_revision(&restored, expected_revision)
            .await
            .map_err(storage_error)?
        {
            UpdateOutcome::Updated => {}
            UpdateOutcome::StaleRevision => {
                return Err(ConfigError::Conflict { id: id.0.clone(), expected: expected_revision })
            }
            UpdateOutcome::Missing => {
                return Err(ConfigError::NotFound {
                    kind: EntityKind::AgentConfig,
                    id: id.0.clone(),
                })
            }
        }

        self.committed(
            ChangeLogEntry::record(
                EntityKind::AgentConfig,
                id.0.clone(),
                Operation::Update,
                Some(current.snapshot()),
                Some(restored.snapshot()),
                context,
            ),
            MutationEvent::new(EntityKind::AgentConfig, id.0.clone(), Operation::Update),
        )
        .await?;
        Ok(restored)
    }

    /// Deletes the config and, via cascade, its owned profile. Referenced
    /// templates and llm configs are untouched.
    pub async fn delete_agent_config(
        &self,
        id: &AgentConfigId,
        context: &MutationContext,
    ) -> Result<(), ConfigError> {
        let old = self
            .agents
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::AgentConfig,
                id: id.0.clone(),
            })?;
        if !self.agents.delete(id).await.map_err(storage_error)? {
            return Err(ConfigError::NotFound {
                kind: EntityKind::AgentConfig,
                id: id.0.clone(),
            });
        }
        self.committed(
            ChangeLogEntry::record(
                EntityKind::AgentConfig,
                id.0.clone(),
                Operation::Delete,
                Some(old.snapshot()),
                None,
                context,
            ),
            MutationEvent::new(EntityKind::AgentConfig, id.0.clone(), Operation::Delete),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Agent profiles
    // ------------------------------------------------------------------

    /// At most one profile per agent config; a second insert for the same
    /// owner is a uniqueness violation.
    pub async fn create_profile(
        &self,
        profile: AgentProfile,
        context: &MutationContext,
    ) -> Result<AgentProfile, ConfigError> {
        if self
            .agents
            .find_by_id(&profile.agent_config_id)
            .await
            .map_err(storage_error)?
            .is_none()
        {
            return Err(ConfigError::NotFound {
                kind: EntityKind::AgentConfig,
                id: profile.agent_config_id.0.clone(),
            });
        }
        if let Some(style_id) = &profile.communication_style_id {
            self.validate_slot(PromptSlot::CommunicationStyle, style_id, &profile.agent_config_id.0)
                .await?;
        }
        self.profiles.insert(profile.clone()).await.map_err(storage_error)?;
        self.committed(
            ChangeLogEntry::record(
                EntityKind::AgentProfile,
                profile.id.0.clone(),
                Operation::Create,
                None,
                Some(profile.snapshot()),
                context,
            ),
            // Profile cache keys are agent-scoped, so the event carries the
            // owning agent config id.
            MutationEvent::new(
                EntityKind::AgentProfile,
                profile.agent_config_id.0.clone(),
                Operation::Create,
            ),
        )
        .await?;
        Ok(profile)
    }

    pub async fn update_profile(
        &self,
        profile: AgentProfile,
        context: &MutationContext,
    ) -> Result<AgentProfile, ConfigError> {
        let old = self
            .profiles
            .find_by_id(&profile.id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::AgentProfile,
                id: profile.id.0.clone(),
            })?;
        if let Some(style_id) = &profile.communication_style_id {
            self.validate_slot(PromptSlot::CommunicationStyle, style_id, &profile.agent_config_id.0)
                .await?;
        }
        if !self.profiles.update(profile.clone()).await.map_err(storage_error)? {
            return Err(ConfigError::NotFound {
                kind: EntityKind::AgentProfile,
                id: profile.id.0.clone(),
            });
        }
        self.committed(
            ChangeLogEntry::record(
                EntityKind::AgentProfile,
                profile.id.0.clone(),
                Operation::Update,
                Some(old.snapshot()),
                Some(profile.snapshot()),
                context,
            ),
            MutationEvent::new(
                EntityKind::AgentProfile,
                profile.agent_config_id.0.clone(),
                Operation::Update,
            ),
        )
        .await?;
        Ok(profile)
    }

    pub async fn delete_profile(
        &self,
        id: &ProfileId,
        context: &MutationContext,
    ) -> Result<(), ConfigError> {
        let old = self
            .profiles
            .find_by_id(id)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ConfigError::NotFound {
                kind: EntityKind::AgentProfile,
                id: id.0.clone(),
            })?;
        if !self.profiles.delete(id).await.map_err(storage_error)? {
            return Err(ConfigError::NotFound {
                kind: EntityKind::AgentProfile,
                id: id.0.clone(),
            });
        }
        self.committed(
            ChangeLogEntry::record(
                EntityKind::AgentProfile,
                id.0.clone(),
                Operation::Delete,
                Some(old.snapshot()),
                None,
                context,
            ),
            MutationEvent::new(
                EntityKind::AgentProfile,
                old.agent_config_id.0.clone(),
                Operation::Delete,
            ),
        )
        .await
    }
}
