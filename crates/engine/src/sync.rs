//! Drives cache invalidation from mutation events. Under write-through the
//! repository awaits [`SyncCoordinator::apply`] before returning; under
//! write-behind the events are drained by [`SyncCoordinator::run`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use persona_core::config::CacheSettings;
use persona_core::domain::agent::AgentConfigId;
use persona_core::domain::changelog::{EntityKind, Operation};
use persona_core::domain::template::TemplateId;
use persona_core::events::MutationEvent;

use crate::cache::{guarded, keys, ConfigCache};

/// Index key for one entity in the dependency index.
pub(crate) fn entity_key(kind: EntityKind, id: &str) -> String {
    format!("{}:{id}", kind.as_str())
}

pub struct SyncCoordinator {
    cache: Arc<dyn ConfigCache>,
    settings: CacheSettings,
    /// Reverse dependency index: entity key -> agent configs whose effective
    /// configuration was assembled from it. Registered by the resolver on
    /// cache write-back.
    dependents: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl SyncCoordinator {
    pub fn new(cache: Arc<dyn ConfigCache>, settings: CacheSettings) -> Self {
        Self { cache, settings, dependents: RwLock::new(HashMap::new()) }
    }

    /// Record that `agent` depends on each of `entity_keys`.
    pub async fn register_dependencies(&self, agent: &AgentConfigId, entity_keys: Vec<String>) {
        let mut dependents = self.dependents.write().await;
        for key in entity_keys {
            dependents.entry(key).or_default().insert(agent.0.clone());
        }
    }

    /// Invalidate the closure of cache keys affected by one mutation: the
    /// mutated entity's own keys plus every dependent effective
    /// configuration. Idempotent; invalidating an absent key is a no-op.
    pub async fn apply(&self, event: &MutationEvent) {
        let mut cache_keys: BTreeSet<String> = BTreeSet::new();
        match event.kind {
            EntityKind::PromptTemplate => {
                cache_keys.insert(keys::template(&TemplateId(event.id.clone())));
            }
            EntityKind::LlmConfig => {
                // LLM configs are never cached; only dependents matter.
            }
            EntityKind::AgentConfig | EntityKind::AgentProfile => {
                // Profile events carry the owning agent config id.
                let agent = AgentConfigId(event.id.clone());
                cache_keys.insert(keys::effective(&agent));
                cache_keys.insert(keys::profile(&agent));
            }
        }

        let dependents = self.dependents.read().await;
        if let Some(agents) = dependents.get(&entity_key(event.kind, &event.id)) {
            for agent in agents {
                cache_keys.insert(keys::effective(&AgentConfigId(agent.clone())));
            }
        }
        drop(dependents);

        for key in &cache_keys {
            if let Err(error) = guarded(self.settings.op_timeout(), self.cache.invalidate(key)).await
            {
                warn!(event_name = "cache_invalidation_failed", key, %error);
            }
        }

        // Deleted entities never mutate again, so their index entry is dead
        // weight. Deleted agent configs also stop being dependents.
        if event.operation == Operation::Delete {
            let mut dependents = self.dependents.write().await;
            dependents.remove(&entity_key(event.kind, &event.id));
            if event.kind == EntityKind::AgentConfig {
                for agents in dependents.values_mut() {
                    agents.remove(&event.id);
                }
                dependents.retain(|_, agents| !agents.is_empty());
            }
        }

        debug!(
            event_name = "mutation_synced",
            kind = %event.kind,
            id = %event.id,
            invalidated = cache_keys.len(),
        );
    }

    /// Event loop for write-behind deployments. Runs until every sender is
    /// dropped; lagged events are safe to skip because the TTL bounds the
    /// resulting staleness.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<MutationEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event_name = "mutation_events_lagged", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use persona_core::config::CacheSettings;
    use persona_core::domain::agent::AgentConfigId;
    use persona_core::domain::changelog::{EntityKind, Operation};
    use persona_core::events::MutationEvent;

    use crate::cache::{keys, ConfigCache, InMemoryCache};

    use super::{entity_key, SyncCoordinator};

    fn settings() -> CacheSettings {
        CacheSettings { enabled: true, ttl_secs: 60, op_timeout_ms: 250 }
    }

    #[tokio::test]
    async fn template_mutation_invalidates_dependent_effective_configs() {
        let cache = Arc::new(InMemoryCache::default());
        let coordinator = SyncCoordinator::new(cache.clone(), settings());

        let agent = AgentConfigId("A-1".to_string());
        cache
            .put(&keys::effective(&agent), serde_json::json!({"agent": "A-1"}), Duration::from_secs(60))
            .await
            .expect("put");
        coordinator
            .register_dependencies(&agent, vec![entity_key(EntityKind::PromptTemplate, "tpl-1")])
            .await;

        coordinator
            .apply(&MutationEvent::new(EntityKind::PromptTemplate, "tpl-1", Operation::Update))
            .await;

        assert!(cache.get(&keys::effective(&agent)).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn unrelated_mutations_leave_the_cache_alone() {
        let cache = Arc::new(InMemoryCache::default());
        let coordinator = SyncCoordinator::new(cache.clone(), settings());

        let agent = AgentConfigId("A-1".to_string());
        cache
            .put(&keys::effective(&agent), serde_json::json!({"agent": "A-1"}), Duration::from_secs(60))
            .await
            .expect("put");

        coordinator
            .apply(&MutationEvent::new(EntityKind::PromptTemplate, "tpl-other", Operation::Update))
            .await;

        assert!(cache.get(&keys::effective(&agent)).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn deleting_a_template_prunes_its_dependency_index_entry() {
        let cache = Arc::new(InMemoryCache::default());
        let coordinator = SyncCoordinator::new(cache.clone(), settings());

        let agent = AgentConfigId("A-1".to_string());
        coordinator
            .register_dependencies(&agent, vec![entity_key(EntityKind::PromptTemplate, "tpl-1")])
            .await;
        coordinator
            .apply(&MutationEvent::new(EntityKind::PromptTemplate, "tpl-1", Operation::Delete))
            .await;

        // A later event for the same id must not reach the agent through a
        // stale index entry.
        cache
            .put(&keys::effective(&agent), serde_json::json!({"agent": "A-1"}), Duration::from_secs(60))
            .await
            .expect("put");
        coordinator
            .apply(&MutationEvent::new(EntityKind::PromptTemplate, "tpl-1", Operation::Update))
            .await;

        assert!(cache.get(&keys::effective(&agent)).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn deleting_an_agent_removes_it_as_a_dependent() {
        let cache = Arc::new(InMemoryCache::default());
        let coordinator = SyncCoordinator::new(cache.clone(), settings());

        let agent = AgentConfigId("A-1".to_string());
        coordinator
            .register_dependencies(&agent, vec![entity_key(EntityKind::PromptTemplate, "tpl-1")])
            .await;
        coordinator
            .apply(&MutationEvent::new(EntityKind::AgentConfig, "A-1", Operation::Delete))
            .await;

        cache
            .put(&keys::effective(&agent), serde_json::json!({"agent": "A-1"}), Duration::from_secs(60))
            .await
            .expect("put");
        coordinator
            .apply(&MutationEvent::new(EntityKind::PromptTemplate, "tpl-1", Operation::Update))
            .await;

        assert!(cache.get(&keys::effective(&agent)).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn duplicate_events_are_idempotent() {
        let cache = Arc::new(InMemoryCache::default());
        let coordinator = SyncCoordinator::new(cache.clone(), settings());

        let event = MutationEvent::new(EntityKind::AgentConfig, "A-1", Operation::Delete);
        coordinator.apply(&event).await;
        coordinator.apply(&event).await;
    }
}
