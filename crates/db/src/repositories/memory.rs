use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use persona_core::domain::agent::{AgentConfig, AgentConfigId, OPTIONAL_AGENT_SLOTS};
use persona_core::domain::changelog::{ChangeLogEntry, EntityKind};
use persona_core::domain::llm::{LlmConfig, LlmConfigId};
use persona_core::domain::profile::{AgentProfile, ProfileId};
use persona_core::domain::template::{PromptTemplate, TemplateId};
use persona_core::slots::PromptType;

use super::{
    AgentConfigStore, ChangeLogStore, LlmConfigStore, LlmDeleteOutcome, ProfileStore,
    RepositoryError, TemplateDeleteOutcome, TemplateStore, UpdateOutcome,
};

/// Test double for the whole system of record. One struct carries all five
/// entity maps so cross-entity semantics (restrict/set-null deletes, profile
/// cascade) behave like the SQL stores.
#[derive(Default)]
pub struct InMemoryStore {
    templates: RwLock<HashMap<String, PromptTemplate>>,
    llm_configs: RwLock<HashMap<String, LlmConfig>>,
    agents: RwLock<HashMap<String, AgentConfig>>,
    profiles: RwLock<HashMap<String, AgentProfile>>,
    change_log: RwLock<Vec<ChangeLogEntry>>,
}

#[async_trait::async_trait]
impl TemplateStore for InMemoryStore {
    async fn insert(&self, template: PromptTemplate) -> Result<(), RepositoryError> {
        let mut templates = self.templates.write().await;
        let duplicate = templates
            .values()
            .any(|t| t.name == template.name && t.version == template.version);
        if duplicate || templates.contains_key(&template.id.0) {
            return Err(RepositoryError::UniqueViolation(format!(
                "prompt template ({}, v{})",
                template.name, template.version
            )));
        }
        templates.insert(template.id.0.clone(), template);
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &TemplateId,
    ) -> Result<Option<PromptTemplate>, RepositoryError> {
        Ok(self.templates.read().await.get(&id.0).cloned())
    }

    async fn find_by_name_version(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<PromptTemplate>, RepositoryError> {
        Ok(self
            .templates
            .read()
            .await
            .values()
            .find(|t| t.name == name && t.version == version)
            .cloned())
    }

    async fn latest_version(&self, name: &str) -> Result<Option<i64>, RepositoryError> {
        Ok(self
            .templates
            .read()
            .await
            .values()
            .filter(|t| t.name == name)
            .map(|t| t.version)
            .max())
    }

    async fn latest_active_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PromptTemplate>, RepositoryError> {
        Ok(self
            .templates
            .read()
            .await
            .values()
            .filter(|t| t.name == name && t.is_active)
            .max_by_key(|t| t.version)
            .cloned())
    }

    async fn list_by_type(
        &self,
        prompt_type: PromptType,
        active_only: bool,
    ) -> Result<Vec<PromptTemplate>, RepositoryError> {
        let mut matches: Vec<PromptTemplate> = self
            .templates
            .read()
            .await
            .values()
            .filter(|t| t.prompt_type == prompt_type && (!active_only || t.is_active))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(matches)
    }

    async fn set_active(
        &self,
        id: &TemplateId,
        active: bool,
        updated_by: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let mut templates = self.templates.write().await;
        match templates.get_mut(&id.0) {
            Some(template) => {
                template.is_active = active;
                if let Some(updated_by) = updated_by {
                    template.updated_by = Some(updated_by.to_string());
                }
                template.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: &TemplateId) -> Result<TemplateDeleteOutcome, RepositoryError> {
        let mut templates = self.templates.write().await;
        if !templates.contains_key(&id.0) {
            return Ok(TemplateDeleteOutcome::NotFound);
        }

        let mut agents = self.agents.write().await;
        let referencing_agents =
            agents.values().filter(|a| a.role_definition_id == *id).count() as i64;
        if referencing_agents > 0 {
            return Ok(TemplateDeleteOutcome::BlockedByRequiredReference { referencing_agents });
        }

        let mut cleared: BTreeSet<String> = BTreeSet::new();
        for agent in agents.values_mut() {
            let mut touched = false;
            for slot in OPTIONAL_AGENT_SLOTS {
                if agent.optional_slot(slot) == Some(id) {
                    agent.clear_optional_slot(slot);
                    touched = true;
                }
            }
            if touched {
                agent.revision += 1;
                agent.updated_at = Utc::now();
                cleared.insert(agent.id.0.clone());
            }
        }

        let mut profiles = self.profiles.write().await;
        for profile in profiles.values_mut() {
            if profile.communication_style_id.as_ref() == Some(id) {
                profile.communication_style_id = None;
                profile.updated_at = Utc::now();
                cleared.insert(profile.agent_config_id.0.clone());
            }
        }

        templates.remove(&id.0);
        Ok(TemplateDeleteOutcome::Deleted {
            cleared_agents: cleared.into_iter().map(AgentConfigId).collect(),
        })
    }
}

#[async_trait::async_trait]
impl LlmConfigStore for InMemoryStore {
    async fn insert(&self, config: LlmConfig) -> Result<(), RepositoryError> {
        let mut llm_configs = self.llm_configs.write().await;
        if llm_configs.values().any(|c| c.name == config.name)
            || llm_configs.contains_key(&config.id.0)
        {
            return Err(RepositoryError::UniqueViolation(format!(
                "llm config `{}`",
                config.name
            )));
        }
        llm_configs.insert(config.id.0.clone(), config);
        Ok(())
    }

    async fn find_by_id(&self, id: &LlmConfigId) -> Result<Option<LlmConfig>, RepositoryError> {
        Ok(self.llm_configs.read().await.get(&id.0).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<LlmConfig>, RepositoryError> {
        Ok(self.llm_configs.read().await.values().find(|c| c.name == name).cloned())
    }

    async fn update(&self, config: LlmConfig) -> Result<bool, RepositoryError> {
        let mut llm_configs = self.llm_configs.write().await;
        if !llm_configs.contains_key(&config.id.0) {
            return Ok(false);
        }
        llm_configs.insert(config.id.0.clone(), config);
        Ok(true)
    }

    async fn delete(&self, id: &LlmConfigId) -> Result<LlmDeleteOutcome, RepositoryError> {
        let mut llm_configs = self.llm_configs.write().await;
        if !llm_configs.contains_key(&id.0) {
            return Ok(LlmDeleteOutcome::NotFound);
        }
        let referencing_agents =
            self.agents.read().await.values().filter(|a| a.llm_config_id == *id).count() as i64;
        if referencing_agents > 0 {
            return Ok(LlmDeleteOutcome::BlockedByReference { referencing_agents });
        }
        llm_configs.remove(&id.0);
        Ok(LlmDeleteOutcome::Deleted)
    }
}

#[async_trait::async_trait]
impl AgentConfigStore for InMemoryStore {
    async fn insert(&self, config: AgentConfig) -> Result<(), RepositoryError> {
        let mut agents = self.agents.write().await;
        if agents.values().any(|a| a.name == config.name) || agents.contains_key(&config.id.0) {
            return Err(RepositoryError::UniqueViolation(format!(
                "agent config `{}`",
                config.name
            )));
        }
        agents.insert(config.id.0.clone(), config);
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &AgentConfigId,
    ) -> Result<Option<AgentConfig>, RepositoryError> {
        Ok(self.agents.read().await.get(&id.0).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<AgentConfig>, RepositoryError> {
        Ok(self.agents.read().await.values().find(|a| a.name == name).cloned())
    }

    async fn list(&self) -> Result<Vec<AgentConfig>, RepositoryError> {
        let mut all: Vec<AgentConfig> = self.agents.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn update_with_revision(
        &self,
        config: &AgentConfig,
        expected_revision: i64,
    ) -> Result<UpdateOutcome, RepositoryError> {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&config.id.0) {
            Some(stored) if stored.revision == expected_revision => {
                *stored = config.clone();
                Ok(UpdateOutcome::Updated)
            }
            Some(_) => Ok(UpdateOutcome::StaleRevision),
            None => Ok(UpdateOutcome::Missing),
        }
    }

    async fn delete(&self, id: &AgentConfigId) -> Result<bool, RepositoryError> {
        let removed = self.agents.write().await.remove(&id.0).is_some();
        if removed {
            self.profiles.write().await.retain(|_, p| p.agent_config_id != *id);
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl ProfileStore for InMemoryStore {
    async fn insert(&self, profile: AgentProfile) -> Result<(), RepositoryError> {
        let mut profiles = self.profiles.write().await;
        if profiles.values().any(|p| p.agent_config_id == profile.agent_config_id)
            || profiles.contains_key(&profile.id.0)
        {
            return Err(RepositoryError::UniqueViolation(format!(
                "profile for agent `{}`",
                profile.agent_config_id.0
            )));
        }
        profiles.insert(profile.id.0.clone(), profile);
        Ok(())
    }

    async fn find_by_id(&self, id: &ProfileId) -> Result<Option<AgentProfile>, RepositoryError> {
        Ok(self.profiles.read().await.get(&id.0).cloned())
    }

    async fn find_by_agent(
        &self,
        agent_config_id: &AgentConfigId,
    ) -> Result<Option<AgentProfile>, RepositoryError> {
        Ok(self
            .profiles
            .read()
            .await
            .values()
            .find(|p| p.agent_config_id == *agent_config_id)
            .cloned())
    }

    async fn update(&self, profile: AgentProfile) -> Result<bool, RepositoryError> {
        let mut profiles = self.profiles.write().await;
        if !profiles.contains_key(&profile.id.0) {
            return Ok(false);
        }
        profiles.insert(profile.id.0.clone(), profile);
        Ok(true)
    }

    async fn delete(&self, id: &ProfileId) -> Result<bool, RepositoryError> {
        Ok(self.profiles.write().await.remove(&id.0).is_some())
    }
}

#[async_trait::async_trait]
impl ChangeLogStore for InMemoryStore {
    async fn append(&self, entry: ChangeLogEntry) -> Result<(), RepositoryError> {
        self.change_log.write().await.push(entry);
        Ok(())
    }

    async fn query(
        &self,
        config_type: EntityKind,
        config_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<ChangeLogEntry>, RepositoryError> {
        let mut entries: Vec<ChangeLogEntry> = self
            .change_log
            .read()
            .await
            .iter()
            .filter(|e| e.config_type == config_type && e.config_id == config_id)
            .filter(|e| match range {
                Some((from, to)) => e.created_at >= from && e.created_at <= to,
                None => true,
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}
