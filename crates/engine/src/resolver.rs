//! Turns an agent config id into a fully assembled [`EffectiveConfig`].
//!
//! Component reads go through [`ComponentSource`] so a cacheless deployment
//! swaps the wiring, not the resolver. Cache failures degrade to the store
//! and are logged, never returned.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use persona_core::config::{EngineConfig, OptionalSlotPolicy};
use persona_core::domain::agent::{AgentConfig, AgentConfigId};
use persona_core::domain::changelog::EntityKind;
use persona_core::domain::llm::{LlmConfig, LlmConfigId};
use persona_core::domain::profile::AgentProfile;
use persona_core::domain::template::{PromptTemplate, TemplateId};
use persona_core::effective::{assemble, EffectiveConfig};
use persona_core::errors::ConfigError;
use persona_core::slots::PromptSlot;
use persona_db::repositories::{
    AgentConfigStore, LlmConfigStore, ProfileStore, TemplateStore,
};

use crate::cache::{guarded, keys, ConfigCache};
use crate::repository::storage_error;
use crate::sync::{entity_key, SyncCoordinator};

/// Read seam for everything the resolver fans out to.
#[async_trait]
pub trait ComponentSource: Send + Sync {
    async fn agent_config(&self, id: &AgentConfigId)
        -> Result<Option<AgentConfig>, ConfigError>;
    async fn template(&self, id: &TemplateId) -> Result<Option<PromptTemplate>, ConfigError>;
    async fn llm_config(&self, id: &LlmConfigId) -> Result<Option<LlmConfig>, ConfigError>;
    async fn profile(&self, agent: &AgentConfigId) -> Result<Option<AgentProfile>, ConfigError>;
}

/// Store-only source; every read hits the system of record.
pub struct StoreSource {
    templates: Arc<dyn TemplateStore>,
    llm_configs: Arc<dyn LlmConfigStore>,
    agents: Arc<dyn AgentConfigStore>,
    profiles: Arc<dyn ProfileStore>,
}

impl StoreSource {
    pub fn new(
        templates: Arc<dyn TemplateStore>,
        llm_configs: Arc<dyn LlmConfigStore>,
        agents: Arc<dyn AgentConfigStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self { templates, llm_configs, agents, profiles }
    }
}

#[async_trait]
impl ComponentSource for StoreSource {
    async fn agent_config(
        &self,
        id: &AgentConfigId,
    ) -> Result<Option<AgentConfig>, ConfigError> {
        self.agents.find_by_id(id).await.map_err(storage_error)
    }

    async fn template(&self, id: &TemplateId) -> Result<Option<PromptTemplate>, ConfigError> {
        self.templates.find_by_id(id).await.map_err(storage_error)
    }

    async fn llm_config(&self, id: &LlmConfigId) -> Result<Option<LlmConfig>, ConfigError> {
        self.llm_configs.find_by_id(id).await.map_err(storage_error)
    }

    async fn profile(&self, agent: &AgentConfigId) -> Result<Option<AgentProfile>, ConfigError> {
        self.profiles.find_by_agent(agent).await.map_err(storage_error)
    }
}

/// Cache-backed source. Templates and profiles are cacheable; agent configs
/// are always read fresh (revision correctness) and LLM configs are never
/// cached (credentials).
pub struct CachedStoreSource {
    inner: StoreSource,
    cache: Arc<dyn ConfigCache>,
    config: EngineConfig,
}

impl CachedStoreSource {
    pub fn new(inner: StoreSource, cache: Arc<dyn ConfigCache>, config: EngineConfig) -> Self {
        Self { inner, cache, config }
    }

    async fn cached_get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match guarded(self.config.cache.op_timeout(), self.cache.get(key)).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(decoded) => Some(decoded),
                Err(error) => {
                    warn!(event_name = "cache_decode_failed", key, %error);
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(event_name = "cache_read_failed", key, %error);
                None
            }
        }
    }

    async fn cached_put<T: serde::Serialize>(&self, key: &str, value: &T) {
        let Ok(encoded) = serde_json::to_value(value) else {
            return;
        };
        let put = self.cache.put(key, encoded, self.config.cache.ttl());
        if let Err(error) = guarded(self.config.cache.op_timeout(), put).await {
            warn!(event_name = "cache_write_failed", key, %error);
        }
    }
}

#[async_trait]
impl ComponentSource for CachedStoreSource {
    async fn agent_config(
        &self,
        id: &AgentConfigId,
    ) -> Result<Option<AgentConfig>, ConfigError> {
        self.inner.agent_config(id).await
    }

    async fn template(&self, id: &TemplateId) -> Result<Option<PromptTemplate>, ConfigError> {
        if !self.config.cache.enabled {
            return self.inner.template(id).await;
        }
        let key = keys::template(id);
        if let Some(template) = self.cached_get::<PromptTemplate>(&key).await {
            return Ok(Some(template));
        }
        let template = self.inner.template(id).await?;
        if let Some(template) = &template {
            self.cached_put(&key, template).await;
        }
        Ok(template)
    }

    async fn llm_config(&self, id: &LlmConfigId) -> Result<Option<LlmConfig>, ConfigError> {
        self.inner.llm_config(id).await
    }

    async fn profile(&self, agent: &AgentConfigId) -> Result<Option<AgentProfile>, ConfigError> {
        if !self.config.cache.enabled {
            return self.inner.profile(agent).await;
        }
        let key = keys::profile(agent);
        if let Some(profile) = self.cached_get::<AgentProfile>(&key).await {
            return Ok(Some(profile));
        }
        let profile = self.inner.profile(agent).await?;
        if let Some(profile) = &profile {
            self.cached_put(&key, profile).await;
        }
        Ok(profile)
    }
}

pub struct Resolver {
    source: Arc<dyn ComponentSource>,
    cache: Arc<dyn ConfigCache>,
    coordinator: Arc<SyncCoordinator>,
    config: EngineConfig,
}

impl Resolver {
    pub fn new(
        source: Arc<dyn ComponentSource>,
        cache: Arc<dyn ConfigCache>,
        coordinator: Arc<SyncCoordinator>,
        config: EngineConfig,
    ) -> Self {
        Self { source, cache, coordinator, config }
    }

    /// Assemble the effective configuration for `id`.
    ///
    /// Fan-out is bounded: five template slots, the profile and the llm
    /// config are fetched concurrently, then the communication style once the
    /// profile is known.
    pub async fn resolve(&self, id: &AgentConfigId) -> Result<EffectiveConfig, ConfigError> {
        if self.config.cache.enabled {
            let key = keys::effective(id);
            match guarded(self.config.cache.op_timeout(), self.cache.get(&key)).await {
                Ok(Some(value)) => {
                    if let Ok(effective) = serde_json::from_value::<EffectiveConfig>(value) {
                        debug!(event_name = "resolve_cache_hit", agent = %id.0);
                        return Ok(effective);
                    }
                    warn!(event_name = "cache_decode_failed", key);
                }
                Ok(None) => {}
                Err(error) => warn!(event_name = "cache_read_failed", key, %error),
            }
        }

        let agent = self
            .source
            .agent_config(id)
            .await?
            .ok_or_else(|| ConfigError::NotFound { kind: EntityKind::AgentConfig, id: id.0.clone() })?;

        let (role, safety, reasoning, retrieval, process, profile, llm) = tokio::join!(
            self.source.template(&agent.role_definition_id),
            self.fetch_optional(agent.safety_policy_id.as_ref()),
            self.fetch_optional(agent.reasoning_framework_id.as_ref()),
            self.fetch_optional(agent.retrieval_strategy_id.as_ref()),
            self.fetch_optional(agent.process_guide_id.as_ref()),
            self.source.profile(&agent.id),
            self.source.llm_config(&agent.llm_config_id),
        );

        let role = role?.ok_or_else(|| ConfigError::DanglingReference {
            slot: PromptSlot::RoleDefinition,
            id: agent.role_definition_id.0.clone(),
        })?;
        if role.prompt_type != PromptSlot::RoleDefinition.expected_type() {
            return Err(ConfigError::TypeMismatch {
                slot: PromptSlot::RoleDefinition,
                expected: PromptSlot::RoleDefinition.expected_type(),
                actual: role.prompt_type,
                id: role.id.0.clone(),
            });
        }
        if !role.is_active {
            return Err(ConfigError::RequiredSlotMissing { agent_id: agent.id.0.clone() });
        }

        let profile = profile?;
        let style = match profile.as_ref().and_then(|p| p.communication_style_id.as_ref()) {
            Some(style_id) => {
                let found = self.source.template(style_id).await?;
                self.accept_optional(PromptSlot::CommunicationStyle, style_id, found)?
            }
            None => None,
        };

        let llm = llm?.ok_or_else(|| ConfigError::NotFound {
            kind: EntityKind::LlmConfig,
            id: agent.llm_config_id.0.clone(),
        })?;

        let mut components = vec![(PromptSlot::RoleDefinition, role)];
        for (slot, fetched, reference) in [
            (PromptSlot::SafetyPolicy, safety, agent.safety_policy_id.as_ref()),
            (PromptSlot::ReasoningFramework, reasoning, agent.reasoning_framework_id.as_ref()),
            (PromptSlot::RetrievalStrategy, retrieval, agent.retrieval_strategy_id.as_ref()),
            (PromptSlot::ProcessGuide, process, agent.process_guide_id.as_ref()),
        ] {
            if let Some(reference) = reference {
                if let Some(template) = self.accept_optional(slot, reference, fetched?)? {
                    components.push((slot, template));
                }
            }
        }
        if let Some(style) = style {
            components.push((PromptSlot::CommunicationStyle, style));
        }

        let effective = assemble(&agent, components, llm.parameters());
        debug!(
            event_name = "resolved",
            agent = %agent.id.0,
            sections = effective.sections.len(),
            content_hash = %effective.content_hash,
        );

        if self.config.cache.enabled {
            self.write_back(&agent, &effective).await;
        }

        Ok(effective)
    }

    async fn fetch_optional(
        &self,
        id: Option<&TemplateId>,
    ) -> Result<Option<PromptTemplate>, ConfigError> {
        match id {
            Some(id) => self.source.template(id).await,
            None => Ok(None),
        }
    }

    /// Validate one optional slot. Dangling or mistyped references are
    /// errors; inactive ones follow the deployment-wide policy.
    fn accept_optional(
        &self,
        slot: PromptSlot,
        id: &TemplateId,
        found: Option<PromptTemplate>,
    ) -> Result<Option<PromptTemplate>, ConfigError> {
        let template = found
            .ok_or_else(|| ConfigError::DanglingReference { slot, id: id.0.clone() })?;
        if template.prompt_type != slot.expected_type() {
            return Err(ConfigError::TypeMismatch {
                slot,
                expected: slot.expected_type(),
                actual: template.prompt_type,
                id: template.id.0.clone(),
            });
        }
        if !template.is_active {
            return match self.config.optional_slots {
                OptionalSlotPolicy::OmitInactive => {
                    debug!(event_name = "inactive_slot_omitted", slot = %slot, template = %id.0);
                    Ok(None)
                }
                OptionalSlotPolicy::FailFast => {
                    Err(ConfigError::InactiveReference { slot, id: id.0.clone() })
                }
            };
        }
        Ok(Some(template))
    }

    /// Cache the assembled configuration and register its dependency set so
    /// later mutations of any component invalidate it.
    async fn write_back(&self, agent: &AgentConfig, effective: &EffectiveConfig) {
        let mut dependencies: Vec<String> = Vec::with_capacity(8);
        dependencies.push(entity_key(EntityKind::PromptTemplate, &agent.role_definition_id.0));
        for reference in [
            agent.safety_policy_id.as_ref(),
            agent.reasoning_framework_id.as_ref(),
            agent.retrieval_strategy_id.as_ref(),
            agent.process_guide_id.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            dependencies.push(entity_key(EntityKind::PromptTemplate, &reference.0));
        }
        for section in &effective.sections {
            let key = entity_key(EntityKind::PromptTemplate, &section.template_id.0);
            if !dependencies.contains(&key) {
                dependencies.push(key);
            }
        }
        dependencies.push(entity_key(EntityKind::LlmConfig, &agent.llm_config_id.0));
        self.coordinator.register_dependencies(&agent.id, dependencies).await;

        // A mutation committed between assembly and this put has already run
        // its invalidation; putting our snapshot now would resurrect stale
        // data. Skip the put when the config moved; the TTL bounds the window
        // between this check and the put itself.
        match self.source.agent_config(&agent.id).await {
            Ok(Some(current)) if current.revision == agent.revision => {}
            Ok(_) => {
                debug!(event_name = "write_back_skipped_stale", agent = %agent.id.0);
                return;
            }
            Err(error) => {
                warn!(event_name = "write_back_recheck_failed", agent = %agent.id.0, %error);
                return;
            }
        }

        let Ok(encoded) = serde_json::to_value(effective) else {
            return;
        };
        let key = keys::effective(&agent.id);
        let put = self.cache.put(&key, encoded, self.config.cache.ttl());
        if let Err(error) = guarded(self.config.cache.op_timeout(), put).await {
            warn!(event_name = "cache_write_failed", key, %error);
        }
    }
}
